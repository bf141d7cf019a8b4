//! Sluice Core - the I/O-free half of the interception side channel.
//!
//! This crate decides nothing on its own; it provides the pieces the proxy
//! and the storage layer share:
//!
//! - [`content`]: body classification (`NULL`, `BINARY`, `JSON`, `XML`, `TEXT`)
//!   and the base64 rule for storing binary bodies
//! - [`backoff`]: the escalating re-probe schedule for ignored hosts
//! - [`destination`]: the store key for a TLS destination (SNI or `host:port`)
//! - [`flow`] and [`exchange`]: completed HTTP flows and the archive rows
//!   built from them
//! - [`clock`]: injectable time source

pub mod backoff;
pub mod clock;
pub mod content;
pub mod destination;
pub mod exchange;
pub mod flow;

pub use clock::{Clock, ManualClock, SystemClock};
pub use content::{classify, encode_body, ContentType, StoredBody};
pub use destination::{format_address, Destination};
pub use exchange::ArchivedExchange;
pub use flow::{FlowSnapshot, Headers, RequestSnapshot, ResponseSnapshot};
