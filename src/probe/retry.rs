//! Connect-type retry orchestrator
//!
//! Starts a probe up to `max_attempts` times, waiting `initial_backoff`
//! after the first attempt and `retry_interval` after each later one.
//! When a direct cycle is exhausted the peer is switched to relay and
//! the loop runs once more.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::ProbeConfig;
use crate::error::{Error, Result};
use crate::peer::{ConnectType, PeerId};
use crate::transport::ConnectionState;

/// What the orchestrator drives
#[async_trait]
pub trait ProbeTarget: Send + Sync {
    fn peer(&self) -> PeerId;

    /// Kick off one attempt; a no-op while one is in flight
    async fn attempt(&self, cancel: &CancellationToken) -> Result<()>;

    fn connection_state(&self) -> ConnectionState;

    async fn connect_type(&self) -> ConnectType;

    async fn set_connect_type(&self, connect_type: ConnectType) -> Result<()>;
}

enum CycleOutcome {
    Connected,
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub retry_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ProbeConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ProbeConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: config.initial_backoff(),
            retry_interval: config.retry_interval(),
        }
    }

    /// Drive `target` until it connects. Falls back to relay once.
    pub async fn run<T: ProbeTarget + ?Sized>(&self, target: &T, cancel: &CancellationToken) -> Result<()> {
        let peer = target.peer();
        let mut attempts = 0;
        let mut switched = false;

        loop {
            match self.cycle(target, cancel, &mut attempts).await? {
                CycleOutcome::Connected => {
                    tracing::info!("Peer {} connected after {} attempts", peer, attempts);
                    return Ok(());
                }
                CycleOutcome::Exhausted => {
                    let connect_type = target.connect_type().await;
                    if !switched && !connect_type.relay_only() {
                        tracing::warn!(
                            "Peer {} unreachable over {} after {} attempts, switching to relay",
                            peer,
                            connect_type,
                            attempts
                        );
                        target.set_connect_type(ConnectType::Relay).await?;
                        switched = true;
                        continue;
                    }
                    let err = Error::ProbeFailed { peer, attempts };
                    tracing::error!("{}", err);
                    return Err(err);
                }
            }
        }
    }

    async fn cycle<T: ProbeTarget + ?Sized>(
        &self,
        target: &T,
        cancel: &CancellationToken,
        attempts: &mut u32,
    ) -> Result<CycleOutcome> {
        for attempt in 1..=self.max_attempts {
            *attempts += 1;
            match target.attempt(cancel).await {
                Ok(()) => {}
                Err(Error::ShuttingDown) => return Err(Error::ShuttingDown),
                Err(e) => tracing::warn!("Probe attempt {} for {} failed: {}", attempt, target.peer(), e),
            }

            let wait = if attempt == 1 {
                self.initial_backoff
            } else {
                self.retry_interval
            };
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }

            match target.connection_state() {
                state if state.is_connected() => return Ok(CycleOutcome::Connected),
                ConnectionState::Failed => return Ok(CycleOutcome::Exhausted),
                _ => {}
            }
        }
        Ok(CycleOutcome::Exhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FakeTarget {
        attempts: AtomicU32,
        connect_after: Option<u32>,
        fail_after: Option<u32>,
        connect_type: Mutex<ConnectType>,
        switches: AtomicU32,
    }

    impl FakeTarget {
        fn new(connect_after: Option<u32>, fail_after: Option<u32>) -> Self {
            Self {
                attempts: AtomicU32::new(0),
                connect_after,
                fail_after,
                connect_type: Mutex::new(ConnectType::Direct),
                switches: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ProbeTarget for FakeTarget {
        fn peer(&self) -> PeerId {
            PeerId::from_u64(42)
        }

        async fn attempt(&self, _cancel: &CancellationToken) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn connection_state(&self) -> ConnectionState {
            let attempts = self.attempts.load(Ordering::SeqCst);
            if self.connect_after.map_or(false, |n| attempts >= n) {
                ConnectionState::Connected
            } else if self.fail_after.map_or(false, |n| attempts >= n) {
                ConnectionState::Failed
            } else {
                ConnectionState::Checking
            }
        }

        async fn connect_type(&self) -> ConnectType {
            *self.connect_type.lock().unwrap()
        }

        async fn set_connect_type(&self, connect_type: ConnectType) -> Result<()> {
            *self.connect_type.lock().unwrap() = connect_type;
            self.switches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_switches_once_then_fails() {
        let target = FakeTarget::new(None, None);
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();

        match RetryPolicy::default().run(&target, &cancel).await {
            Err(Error::ProbeFailed { attempts, .. }) => assert_eq!(attempts, 14),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(target.attempts.load(Ordering::SeqCst), 14);
        assert_eq!(target.switches.load(Ordering::SeqCst), 1);
        assert_eq!(target.connect_type().await, ConnectType::Relay);
        // Two cycles of 1s + 6 * 30s
        assert!(started.elapsed() >= Duration::from_secs(2 * (1 + 6 * 30)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_connected() {
        let target = FakeTarget::new(Some(3), None);
        let cancel = CancellationToken::new();
        RetryPolicy::default().run(&target, &cancel).await.unwrap();
        assert_eq!(target.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(target.switches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_state_ends_cycle_early() {
        let target = FakeTarget::new(Some(3), Some(2));
        let cancel = CancellationToken::new();
        RetryPolicy::default().run(&target, &cancel).await.unwrap();
        // Failed after the second attempt, relay connects on the next one
        assert_eq!(target.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(target.switches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_peer_does_not_switch() {
        let target = FakeTarget::new(None, None);
        *target.connect_type.lock().unwrap() = ConnectType::Relay;
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        let cancel = CancellationToken::new();
        assert!(matches!(
            policy.run(&target, &cancel).await,
            Err(Error::ProbeFailed { attempts: 3, .. })
        ));
        assert_eq!(target.switches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let target = FakeTarget::new(None, None);
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            stopper.cancel();
        });
        assert!(matches!(
            RetryPolicy::default().run(&target, &cancel).await,
            Err(Error::Cancelled)
        ));
        assert_eq!(target.attempts.load(Ordering::SeqCst), 2);
    }
}
