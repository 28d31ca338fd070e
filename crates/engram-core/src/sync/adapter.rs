//! Sync adapter state machine
//!
//! `idle -> syncing -> {idle, error}`. A successful flush returns to idle;
//! a transport failure moves to error and schedules an exponential-backoff
//! retry capped at the configured maximum. `stop` returns to idle from any
//! state. Adapters own their transport and share no mutable state with the
//! engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::ChangeRecord;

/// Initial retry delay after a transport failure
pub(crate) const BASE_BACKOFF_MS: u64 = 500;
/// Backoff cap used when the config does not set one
pub(crate) const DEFAULT_MAX_BACKOFF_MS: u64 = 60_000;

/// Transport a sync adapter pushes change records through
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Deliver a batch in commit order; must be idempotent on the consumer
    /// side
    async fn send(&self, records: &[ChangeRecord]) -> Result<(), String>;
}

/// Adapter lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// Nothing in flight
    Idle,
    /// A flush is running
    Syncing,
    /// Last flush failed; waiting out the backoff
    Error,
}

#[derive(Debug)]
struct AdapterRuntime {
    state: AdapterState,
    consecutive_failures: u32,
    next_attempt_ms: i64,
}

/// One registered sync adapter
pub struct AdapterHandle {
    name: String,
    transport: std::sync::Arc<dyn SyncTransport>,
    runtime: Mutex<AdapterRuntime>,
    acked: AtomicU64,
    max_backoff_ms: u64,
}

impl std::fmt::Debug for AdapterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterHandle")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("acked", &self.acked_seq())
            .finish()
    }
}

impl AdapterHandle {
    pub(crate) fn new(
        name: &str,
        transport: std::sync::Arc<dyn SyncTransport>,
        max_backoff_ms: u64,
    ) -> Self {
        Self {
            name: name.to_string(),
            transport,
            runtime: Mutex::new(AdapterRuntime {
                state: AdapterState::Idle,
                consecutive_failures: 0,
                next_attempt_ms: 0,
            }),
            acked: AtomicU64::new(0),
            max_backoff_ms,
        }
    }

    /// Adapter name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state
    pub fn state(&self) -> AdapterState {
        self.runtime
            .lock()
            .map_or(AdapterState::Error, |r| r.state)
    }

    /// Highest sequence this adapter has acknowledged
    pub fn acked_seq(&self) -> u64 {
        self.acked.load(Ordering::SeqCst)
    }

    pub(crate) fn restore_ack(&self, seq: u64) {
        self.acked.store(seq, Ordering::SeqCst);
    }

    /// Attempt a delivery; returns the new acked sequence on success.
    ///
    /// Honors the backoff window: a call before `next_attempt_ms` is a
    /// silent no-op so failing transports are not hammered on every commit.
    pub(crate) async fn deliver(&self, records: &[ChangeRecord], now_ms: i64) -> Option<u64> {
        {
            let Ok(mut runtime) = self.runtime.lock() else {
                return None;
            };
            if runtime.state == AdapterState::Syncing {
                return None;
            }
            if runtime.state == AdapterState::Error && now_ms < runtime.next_attempt_ms {
                return None;
            }
            runtime.state = AdapterState::Syncing;
        }

        let head = records.last().map_or(0, |r| r.seq);
        match self.transport.send(records).await {
            Ok(()) => {
                self.acked.store(head, Ordering::SeqCst);
                if let Ok(mut runtime) = self.runtime.lock() {
                    runtime.state = AdapterState::Idle;
                    runtime.consecutive_failures = 0;
                    runtime.next_attempt_ms = 0;
                }
                debug!(adapter = %self.name, head, count = records.len(), "batch delivered");
                Some(head)
            }
            Err(err) => {
                if let Ok(mut runtime) = self.runtime.lock() {
                    runtime.state = AdapterState::Error;
                    runtime.consecutive_failures = runtime.consecutive_failures.saturating_add(1);
                    let backoff = BASE_BACKOFF_MS
                        .saturating_mul(1u64 << runtime.consecutive_failures.min(16))
                        .min(self.max_backoff_ms);
                    runtime.next_attempt_ms = now_ms + backoff as i64;
                    warn!(
                        adapter = %self.name,
                        error = %err,
                        retry_in_ms = backoff,
                        "sync transport failed"
                    );
                }
                None
            }
        }
    }

    /// Return to idle from any state and clear the backoff
    pub fn stop(&self) {
        if let Ok(mut runtime) = self.runtime.lock() {
            runtime.state = AdapterState::Idle;
            runtime.consecutive_failures = 0;
            runtime.next_attempt_ms = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct FlakyTransport {
        fail: AtomicBool,
        calls: AtomicU64,
    }

    #[async_trait]
    impl SyncTransport for FlakyTransport {
        async fn send(&self, _records: &[ChangeRecord]) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                Err("connection refused".to_string())
            } else {
                Ok(())
            }
        }
    }

    fn record(seq: u64) -> ChangeRecord {
        ChangeRecord {
            seq,
            table: "t".into(),
            kind: super::super::ChangeKind::Insert,
            pk: crate::types::Value::Str("pk".into()),
            before: None,
            after: None,
            committed_at: 0,
            origin_device_id: "dev".into(),
        }
    }

    #[tokio::test]
    async fn test_success_acks_head() {
        let transport = std::sync::Arc::new(FlakyTransport {
            fail: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        });
        let handle = AdapterHandle::new("rest", transport, 10_000);

        let acked = handle.deliver(&[record(1), record(2)], 0).await;
        assert_eq!(acked, Some(2));
        assert_eq!(handle.state(), AdapterState::Idle);
        assert_eq!(handle.acked_seq(), 2);
    }

    #[tokio::test]
    async fn test_failure_backs_off_then_recovers() {
        let transport = std::sync::Arc::new(FlakyTransport {
            fail: AtomicBool::new(true),
            calls: AtomicU64::new(0),
        });
        let handle = AdapterHandle::new("rest", std::sync::Arc::clone(&transport) as _, 10_000);

        assert_eq!(handle.deliver(&[record(1)], 0).await, None);
        assert_eq!(handle.state(), AdapterState::Error);
        let calls_after_failure = transport.calls.load(Ordering::SeqCst);

        // inside the backoff window: no transport call
        assert_eq!(handle.deliver(&[record(1)], 10).await, None);
        assert_eq!(transport.calls.load(Ordering::SeqCst), calls_after_failure);

        // past the window and healthy again: delivers and returns to idle
        transport.fail.store(false, Ordering::SeqCst);
        let acked = handle.deliver(&[record(1)], 100_000).await;
        assert_eq!(acked, Some(1));
        assert_eq!(handle.state(), AdapterState::Idle);
    }

    #[tokio::test]
    async fn test_stop_clears_error_state() {
        let transport = std::sync::Arc::new(FlakyTransport {
            fail: AtomicBool::new(true),
            calls: AtomicU64::new(0),
        });
        let handle = AdapterHandle::new("rest", transport, 10_000);
        handle.deliver(&[record(1)], 0).await;
        assert_eq!(handle.state(), AdapterState::Error);

        handle.stop();
        assert_eq!(handle.state(), AdapterState::Idle);
    }
}
