//! SYN/ACK handshake shared by both dialers
//!
//! The peer with the larger id initiates: it sends `HANDSHAKE_SYN` every
//! `syn_interval` until an ACK arrives or `timeout` elapses. The other
//! peer answers each SYN with an ACK. The SYN loop is stopped exactly
//! once. One deadline, fixed when the handshake starts, bounds the whole
//! exchange up to the first OFFER.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::latch::Latch;
use crate::peer::PeerId;
use crate::signal::{DialerKind, SignalPacket, SignalSender};

pub struct Handshake {
    local: PeerId,
    remote: PeerId,
    dialer: DialerKind,
    signal: Arc<dyn SignalSender>,
    syn_interval: Duration,
    timeout: Duration,
    deadline: OnceLock<Instant>,
    started: Latch,
    established: Latch,
    timed_out: Latch,
    syn_stop: CancellationToken,
    syns_sent: AtomicUsize,
    syn_cancels: AtomicUsize,
}

impl Handshake {
    pub fn new(
        local: PeerId,
        remote: PeerId,
        dialer: DialerKind,
        signal: Arc<dyn SignalSender>,
        syn_interval: Duration,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            remote,
            dialer,
            signal,
            syn_interval,
            timeout,
            deadline: OnceLock::new(),
            started: Latch::new(),
            established: Latch::new(),
            timed_out: Latch::new(),
            syn_stop: CancellationToken::new(),
            syns_sent: AtomicUsize::new(0),
            syn_cancels: AtomicUsize::new(0),
        })
    }

    /// The larger id initiates
    pub fn is_initiator(&self) -> bool {
        self.local > self.remote
    }

    /// Start the timeout and, on the initiator, the SYN loop. Idempotent.
    pub fn start(self: &Arc<Self>, cancel: &CancellationToken) {
        if !self.started.fire() {
            return;
        }
        let _ = self.deadline.set(Instant::now() + self.timeout);
        tokio::spawn(Arc::clone(self).run(cancel.clone()));
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let deadline = self.deadline();

        if self.is_initiator() {
            let mut ticker = tokio::time::interval(self.syn_interval);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = self.syn_stop.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = ticker.tick() => {}
                }

                let syn = SignalPacket::syn(self.dialer, self.local);
                match self.signal.send_packet(self.remote, &syn).await {
                    Ok(()) => {
                        self.syns_sent.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => tracing::warn!("{} SYN to {} failed: {}", self.dialer, self.remote, e),
                }
            }
        } else {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.established.wait() => return,
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }

        if !self.established.is_fired() && self.timed_out.fire() {
            tracing::warn!(
                "{} handshake with {} timed out after {:?}",
                self.dialer,
                self.remote,
                self.timeout
            );
        }
    }

    /// Responder side: answer a SYN with an ACK.
    ///
    /// Returns true for the first SYN only.
    pub async fn on_syn(&self) -> Result<bool> {
        if self.is_initiator() {
            tracing::debug!("Ignoring SYN from {} (we initiate)", self.remote);
            return Ok(false);
        }

        let first = self.established.fire();
        let ack = SignalPacket::ack(self.dialer, self.local);
        self.signal.send_packet(self.remote, &ack).await?;
        if first {
            tracing::debug!("{} handshake with {} acknowledged", self.dialer, self.remote);
        }
        Ok(first)
    }

    /// Initiator side: stop the SYN loop. Returns true for the first ACK only.
    pub fn on_ack(&self) -> bool {
        if !self.is_initiator() {
            tracing::debug!("Ignoring ACK from {} (we respond)", self.remote);
            return false;
        }
        if !self.established.fire() {
            return false;
        }

        self.syn_stop.cancel();
        self.syn_cancels.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("{} handshake with {} established", self.dialer, self.remote);
        true
    }

    /// Wait until established, timed out or cancelled
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.established.wait() => Ok(()),
            _ = self.timed_out.wait() => Err(Error::HandshakeTimeout(self.remote)),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Wait for the handshake and then for `ready`, both within the
    /// deadline set by `start`
    pub async fn wait_ready(&self, cancel: &CancellationToken, ready: &Latch) -> Result<()> {
        self.wait(cancel).await?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = ready.wait() => Ok(()),
            _ = tokio::time::sleep_until(self.deadline()) => Err(Error::HandshakeTimeout(self.remote)),
        }
    }

    /// When the exchange gives up; `timeout` from now if not started yet
    pub fn deadline(&self) -> Instant {
        self.deadline
            .get()
            .copied()
            .unwrap_or_else(|| Instant::now() + self.timeout)
    }

    pub fn is_established(&self) -> bool {
        self.established.is_fired()
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out.is_fired()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn syns_sent(&self) -> usize {
        self.syns_sent.load(Ordering::SeqCst)
    }

    /// How many times the SYN loop was stopped
    pub fn syn_cancellations(&self) -> usize {
        self.syn_cancels.load(Ordering::SeqCst)
    }
}
