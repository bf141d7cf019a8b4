//! Ignore-host decisions over a connection's TLS lifecycle.
//!
//! - hello: read the backoff record and bypass interception while the
//!   destination is inside its retry window
//! - established: push the destination one phase further along the schedule
//! - failed: forget the destination so the next connection is intercepted
//!
//! Success escalates the backoff and failure clears it, the reverse of a
//! circuit breaker. Keep it that way unless the policy itself changes.
//!
//! Only the hello hook waits on the store. The other two hand their write to
//! the [`StoreHandle`] and return.

use std::fmt;
use std::sync::Arc;

use sluice_core::Clock;
use sluice_storage::IgnoreHostStore;
use tracing::{debug, warn};

use crate::hooks::{ClientHello, ConnectionInfo, Decision};
use crate::worker::StoreHandle;

/// Decides per connection whether to intercept TLS.
#[derive(Clone)]
pub struct DecisionEngine {
    store: Arc<dyn IgnoreHostStore>,
    writes: StoreHandle,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for DecisionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("store", &"IgnoreHostStore")
            .field("writes", &self.writes)
            .finish()
    }
}

impl DecisionEngine {
    pub fn new(
        store: Arc<dyn IgnoreHostStore>,
        writes: StoreHandle,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            writes,
            clock,
        }
    }

    /// Reads the backoff state and sets `hello.ignore_connection` when the
    /// destination should be passed through.
    ///
    /// A failed read intercepts the connection.
    pub async fn on_client_hello(&self, hello: &mut ClientHello) -> Decision {
        let destination = hello.connection.destination();
        let now = self.clock.now();

        let ignored = match self.store.is_ignored(destination.as_str(), now).await {
            Ok(ignored) => ignored,
            Err(e) => {
                warn!(
                    address = %destination,
                    error = %e,
                    "Ignore-host lookup failed, intercepting"
                );
                false
            }
        };

        if ignored {
            hello.ignore_connection = true;
            debug!(address = %destination, "Bypassing interception");
            Decision::Bypass
        } else {
            debug!(address = %destination, "Intercepting");
            Decision::Intercept
        }
    }

    /// The client accepted our certificate on an intercepted connection.
    pub fn on_tls_established(&self, connection: &ConnectionInfo) {
        let destination = connection.destination();
        debug!(address = %destination, "TLS established with client");
        self.writes.record_seen(destination, self.clock.now());
    }

    /// The client handshake failed on an intercepted connection.
    pub fn on_tls_failed(&self, connection: &ConnectionInfo, error: &dyn fmt::Display) {
        let destination = connection.destination();
        warn!(address = %destination, error = %error, "TLS handshake with client failed");
        self.writes.reset(destination);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    use chrono::{DateTime, Duration, TimeZone, Utc};
    use sluice_core::ManualClock;
    use sluice_storage::{Database, IgnoreHost};

    use crate::worker::{StoreWorker, WorkerConfig, WorkerStores};

    struct Harness {
        db: Database,
        clock: ManualClock,
        worker: StoreWorker,
        engine: DecisionEngine,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 15, 10, 0, 0).unwrap()
    }

    fn harness() -> Harness {
        let db = Database::in_memory().unwrap();
        let clock = ManualClock::new(t0());
        let worker = StoreWorker::start(
            WorkerStores {
                ignore_hosts: Arc::new(db.clone()),
                archive: Arc::new(db.clone()),
            },
            WorkerConfig::default(),
        );
        let engine = DecisionEngine::new(
            Arc::new(db.clone()),
            worker.handle(),
            Arc::new(clock.clone()),
        );

        Harness {
            db,
            clock,
            worker,
            engine,
        }
    }

    fn example() -> ConnectionInfo {
        ConnectionInfo::new(Some("example.com"), "93.184.216.34", 443)
    }

    async fn hello(engine: &DecisionEngine, conn: ConnectionInfo) -> (Decision, bool) {
        let mut hello = ClientHello::new(conn);
        let decision = engine.on_client_hello(&mut hello).await;
        (decision, hello.ignore_connection)
    }

    /// Polls the store until the background write lands.
    async fn wait_for(db: &Database, address: &str, check: impl Fn(Option<IgnoreHost>) -> bool) {
        for _ in 0..200 {
            if check(db.find_ignore_host(address).unwrap()) {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        panic!("store never reached expected state for {address}");
    }

    #[tokio::test]
    async fn backoff_escalates_across_connections() {
        let h = harness();

        // First contact: no record, intercept
        assert_eq!(
            hello(&h.engine, example()).await,
            (Decision::Intercept, false)
        );
        h.engine.on_tls_established(&example());
        wait_for(&h.db, "example.com", |r| {
            r.is_some_and(|r| r.next_check_phase == 1 && r.last_seen_at == t0())
        })
        .await;

        // Inside the one minute window
        h.clock.advance(Duration::seconds(30));
        assert_eq!(hello(&h.engine, example()).await, (Decision::Bypass, true));

        // Window elapsed, probe again
        h.clock.set(t0() + Duration::seconds(61));
        assert_eq!(
            hello(&h.engine, example()).await,
            (Decision::Intercept, false)
        );
        h.engine.on_tls_established(&example());
        wait_for(&h.db, "example.com", |r| r.is_some_and(|r| r.next_check_phase == 2)).await;

        // Phase 2 waits five minutes from the second sighting
        h.clock.advance(Duration::minutes(4));
        assert_eq!(hello(&h.engine, example()).await.0, Decision::Bypass);
        h.clock.advance(Duration::minutes(1) + Duration::seconds(1));
        assert_eq!(hello(&h.engine, example()).await.0, Decision::Intercept);

        h.worker.shutdown().await;
    }

    #[tokio::test]
    async fn failure_resets_backoff() {
        let h = harness();

        h.engine.on_tls_established(&example());
        wait_for(&h.db, "example.com", |r| r.is_some()).await;
        assert_eq!(hello(&h.engine, example()).await.0, Decision::Bypass);

        h.engine.on_tls_failed(&example(), &"certificate unknown");
        wait_for(&h.db, "example.com", |r| r.is_none()).await;

        assert_eq!(hello(&h.engine, example()).await.0, Decision::Intercept);
        h.worker.shutdown().await;
    }

    #[tokio::test]
    async fn failure_for_unknown_destination_is_harmless() {
        let h = harness();

        h.engine.on_tls_failed(&example(), &"handshake timed out");
        h.worker.shutdown().await;

        assert!(h.db.find_ignore_host("example.com").unwrap().is_none());
    }

    #[tokio::test]
    async fn hello_does_not_mutate_state() {
        let h = harness();
        h.db.upsert_ignore_host("example.com", t0()).unwrap();

        for _ in 0..5 {
            hello(&h.engine, example()).await;
        }

        let record = h.db.find_ignore_host("example.com").unwrap().unwrap();
        assert_eq!(record.next_check_phase, 1);
        assert_eq!(record.last_seen_at, t0());
        h.worker.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_schedule_bypasses_forever() {
        let h = harness();
        for _ in 0..10 {
            h.db.upsert_ignore_host("example.com", t0()).unwrap();
        }

        h.clock.advance(Duration::days(365));
        assert_eq!(hello(&h.engine, example()).await, (Decision::Bypass, true));
        h.worker.shutdown().await;
    }

    #[tokio::test]
    async fn lookup_failure_intercepts() {
        let h = harness();
        h.db.upsert_ignore_host("example.com", t0()).unwrap();
        h.db.close().unwrap();

        assert_eq!(
            hello(&h.engine, example()).await,
            (Decision::Intercept, false)
        );
        h.worker.shutdown().await;
    }

    #[tokio::test]
    async fn destinations_are_tracked_independently() {
        let h = harness();
        let by_ip = ConnectionInfo::new(None, "10.1.2.3", 8443);

        h.engine.on_tls_established(&example());
        h.engine.on_tls_established(&by_ip);
        h.worker.shutdown().await;

        assert!(h.db.find_ignore_host("example.com").unwrap().is_some());
        assert!(h.db.find_ignore_host("10.1.2.3:8443").unwrap().is_some());
        assert_eq!(h.db.count_ignore_hosts().unwrap(), 2);
    }
}
