//! Body content classification.
//!
//! Sorts a payload into one of five buckets so archived bodies can be told
//! apart without re-parsing them. Classification never fails: a payload that
//! is not valid JSON or XML is simply not that type.
//!
//! Payloads that are not UTF-8 are classified as [`ContentType::Binary`]
//! immediately and are never inspected further. Binary payloads must be
//! base64-encoded before they are stored; [`encode_body`] does both steps.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

/// Classification of a request or response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContentType {
    /// No body at all.
    Null,
    /// Not valid UTF-8; stored base64-encoded.
    Binary,
    /// Valid JSON document.
    Json,
    /// Well-formed XML document.
    Xml,
    /// Any other UTF-8 text.
    Text,
}

impl ContentType {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Null => "NULL",
            ContentType::Binary => "BINARY",
            ContentType::Json => "JSON",
            ContentType::Xml => "XML",
            ContentType::Text => "TEXT",
        }
    }

    /// Parse from database string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NULL" => Some(ContentType::Null),
            "BINARY" => Some(ContentType::Binary),
            "JSON" => Some(ContentType::Json),
            "XML" => Some(ContentType::Xml),
            "TEXT" => Some(ContentType::Text),
            _ => None,
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies a payload. `None` means the message had no body.
pub fn classify(content: Option<&[u8]>) -> ContentType {
    let Some(bytes) = content else {
        return ContentType::Null;
    };

    match std::str::from_utf8(bytes) {
        Ok(text) => classify_text(text),
        Err(_) => ContentType::Binary,
    }
}

/// Classifies text that is already known to be valid UTF-8.
fn classify_text(text: &str) -> ContentType {
    if is_json(text) {
        ContentType::Json
    } else if is_xml(text) {
        ContentType::Xml
    } else {
        ContentType::Text
    }
}

fn is_json(text: &str) -> bool {
    serde_json::from_str::<serde::de::IgnoredAny>(text).is_ok()
}

/// Strict well-formedness check: exactly one root element, balanced tags,
/// valid attributes and entities, and nothing but whitespace, comments or
/// processing instructions outside the root. An XML declaration is only
/// allowed as the very first thing in the document.
fn is_xml(text: &str) -> bool {
    let mut reader = Reader::from_str(text);
    reader.config_mut().check_end_names = true;
    reader.config_mut().check_comments = true;

    let mut depth: usize = 0;
    let mut seen_root = false;
    let mut first = true;

    loop {
        let event = reader.read_event();
        let at_start = std::mem::replace(&mut first, false);

        match event {
            Err(_) => return false,
            Ok(Event::Eof) => return seen_root && depth == 0,
            Ok(Event::Start(tag)) => {
                if tag.attributes().any(|attr| attr.is_err()) {
                    return false;
                }
                if depth == 0 {
                    if seen_root {
                        return false;
                    }
                    seen_root = true;
                }
                depth += 1;
            }
            Ok(Event::Empty(tag)) => {
                if tag.attributes().any(|attr| attr.is_err()) {
                    return false;
                }
                if depth == 0 {
                    if seen_root {
                        return false;
                    }
                    seen_root = true;
                }
            }
            Ok(Event::End(_)) => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
            }
            Ok(Event::Text(content)) => {
                if depth == 0 {
                    if !content.iter().all(u8::is_ascii_whitespace) {
                        return false;
                    }
                } else if content.unescape().is_err() {
                    return false;
                }
            }
            Ok(Event::CData(_)) => {
                if depth == 0 {
                    return false;
                }
            }
            Ok(Event::DocType(_)) => {
                if seen_root {
                    return false;
                }
            }
            Ok(Event::Decl(_)) => {
                if !at_start {
                    return false;
                }
            }
            Ok(_) => {}
        }
    }
}

/// A body as it is written to the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBody {
    /// Original text, or base64 of the original bytes when `Binary`.
    pub content: Option<String>,
    /// Classification of the original payload.
    pub content_type: ContentType,
}

impl StoredBody {
    /// Recovers the original payload bytes.
    pub fn decode(&self) -> Result<Option<Vec<u8>>, base64::DecodeError> {
        match (&self.content, self.content_type) {
            (None, _) => Ok(None),
            (Some(encoded), ContentType::Binary) => STANDARD.decode(encoded).map(Some),
            (Some(text), _) => Ok(Some(text.as_bytes().to_vec())),
        }
    }
}

/// Classifies a payload and converts it to its storable form.
///
/// Anything that is not valid UTF-8 is base64-encoded and marked `Binary`,
/// so the archive never holds raw binary in a text column.
pub fn encode_body(content: Option<&[u8]>) -> StoredBody {
    match content {
        None => StoredBody {
            content: None,
            content_type: ContentType::Null,
        },
        Some(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => StoredBody {
                content: Some(text.to_owned()),
                content_type: classify_text(text),
            },
            Err(_) => StoredBody {
                content: Some(STANDARD.encode(bytes)),
                content_type: ContentType::Binary,
            },
        },
    }
}
