//! Probe: per-peer transport racer
//!
//! One probe exists per remote peer. `start` races a fresh set of
//! dialers, adopts the best transport and keeps upgrading when a higher
//! priority transport shows up later. Signaling packets for the peer are
//! routed to the dialer they name.

mod retry;

pub use retry::{ProbeTarget, RetryPolicy};

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::ProbeConfig;
use crate::error::{Error, Result};
use crate::peer::{ConnectType, PeerId, PeerRegistry};
use crate::signal::SignalPacket;
use crate::transport::{ConnectionState, Dialer, SharedTransport, TransportKind};

/// Builds a fresh dialer of the given kind, or `None` when that path is unavailable
pub type DialerFactory = Arc<dyn Fn(TransportKind) -> Option<Arc<dyn Dialer>> + Send + Sync>;

/// Called with every adopted transport
pub type SuccessHandler =
    Arc<dyn Fn(PeerId, SharedTransport) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// Called when a discovery cycle fails
pub type FailureHandler = Arc<dyn Fn(PeerId, &Error) + Send + Sync>;

type RaceResult = (TransportKind, Result<SharedTransport>);

pub struct Probe {
    local: PeerId,
    remote: PeerId,
    config: ProbeConfig,
    force_relay: bool,
    registry: Arc<PeerRegistry>,
    factory: DialerFactory,
    state: watch::Sender<ConnectionState>,
    dialers: RwLock<HashMap<TransportKind, Arc<dyn Dialer>>>,
    /// Serializes transport adoption
    current: Mutex<Option<SharedTransport>>,
    cycle: StdMutex<Option<CancellationToken>>,
    on_success: Option<SuccessHandler>,
    on_failure: Option<FailureHandler>,
}

impl Probe {
    pub fn new(
        local: PeerId,
        remote: PeerId,
        registry: Arc<PeerRegistry>,
        config: ProbeConfig,
        factory: DialerFactory,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::New);
        Self {
            local,
            remote,
            config,
            force_relay: false,
            registry,
            factory,
            state,
            dialers: RwLock::new(HashMap::new()),
            current: Mutex::new(None),
            cycle: StdMutex::new(None),
            on_success: None,
            on_failure: None,
        }
    }

    pub fn with_force_relay(mut self, force_relay: bool) -> Self {
        self.force_relay = force_relay;
        self
    }

    pub fn with_on_success(mut self, handler: SuccessHandler) -> Self {
        self.on_success = Some(handler);
        self
    }

    pub fn with_on_failure(mut self, handler: FailureHandler) -> Self {
        self.on_failure = Some(handler);
        self
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    pub fn remote(&self) -> PeerId {
        self.remote
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// The active transport, if any
    pub async fn transport(&self) -> Option<SharedTransport> {
        self.current.lock().await.clone()
    }

    /// Write through the active transport
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let transport = self.transport().await.ok_or(Error::NotConnected(self.remote))?;
        transport.write(data).await
    }

    /// Move to `next` unless the probe was closed
    fn set_state(&self, next: ConnectionState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed || *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            tracing::info!("Probe {} -> {}: state {}", self.local, self.remote, next);
        }
        changed
    }

    /// Begin discovery unless already checking or connected
    pub async fn start(self: &Arc<Self>, cancel: &CancellationToken, remote: PeerId) -> Result<()> {
        if remote != self.remote {
            return Err(Error::AgentNotFound(remote));
        }

        let mut begun = false;
        self.state.send_if_modified(|state| {
            if state.is_active() || state.is_connected() || *state == ConnectionState::Closed {
                return false;
            }
            *state = ConnectionState::Checking;
            begun = true;
            true
        });
        if !begun {
            if self.state() == ConnectionState::Closed {
                return Err(Error::ShuttingDown);
            }
            tracing::debug!("Probe {} -> {} already {}", self.local, self.remote, self.state());
            return Ok(());
        }
        tracing::info!("Probe {} -> {}: state {}", self.local, self.remote, ConnectionState::Checking);

        let cycle = cancel.child_token();
        if let Ok(mut slot) = self.cycle.lock() {
            if let Some(previous) = slot.replace(cycle.clone()) {
                previous.cancel();
            }
        }

        let dialers = self.build_dialers().await;
        if dialers.is_empty() {
            let err = Error::AllDialersFailed(vec!["no dialer available".into()]);
            self.fail(&err);
            return Err(err);
        }

        let probe = Arc::clone(self);
        tokio::spawn(async move { probe.run_cycle(cycle, dialers).await });
        Ok(())
    }

    async fn build_dialers(&self) -> Vec<Arc<dyn Dialer>> {
        let connect_type = self
            .registry
            .connect_type(&self.remote)
            .await
            .unwrap_or_default();
        let relay_only = self.force_relay || connect_type.relay_only();

        let mut kinds = Vec::with_capacity(2);
        if !relay_only {
            kinds.push(TransportKind::Direct);
        }
        kinds.push(TransportKind::Relay);

        let mut fresh = HashMap::new();
        for kind in kinds {
            if let Some(dialer) = (self.factory)(kind) {
                fresh.insert(kind, dialer);
            }
        }

        let stale = std::mem::replace(&mut *self.dialers.write().await, fresh.clone());
        for dialer in stale.into_values() {
            dialer.abort().await;
        }

        tracing::debug!(
            "Probe {} -> {} racing {:?} (connect type {})",
            self.local,
            self.remote,
            fresh.keys().collect::<Vec<_>>(),
            connect_type
        );
        fresh.into_values().collect()
    }

    async fn run_cycle(self: Arc<Self>, cycle: CancellationToken, dialers: Vec<Arc<dyn Dialer>>) {
        match self.discover(&cycle, dialers).await {
            Ok(transport) => {
                self.handle_upgrade_transport(transport).await;
            }
            Err(Error::Cancelled) => {
                tracing::debug!("Probe {} -> {} cancelled", self.local, self.remote);
            }
            Err(e) => self.fail(&e),
        }
    }

    fn fail(&self, err: &Error) {
        tracing::warn!("Probe {} -> {} failed: {}", self.local, self.remote, err);
        self.set_state(ConnectionState::Failed);
        if let Some(handler) = &self.on_failure {
            handler(self.remote, err);
        }
    }

    /// Race `dialers` and return the preferred transport.
    ///
    /// A relay winner is held for the upgrade grace period in case a
    /// direct transport follows. Results arriving later are offered to
    /// `handle_upgrade_transport`.
    pub(crate) async fn discover(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        dialers: Vec<Arc<dyn Dialer>>,
    ) -> Result<SharedTransport> {
        let (tx, mut rx) = mpsc::channel::<RaceResult>(2);
        for dialer in dialers {
            let tx = tx.clone();
            let cancel = cancel.clone();
            let remote = self.remote;
            tokio::spawn(async move {
                let result = async {
                    dialer.prepare(&cancel, remote).await?;
                    dialer.dial(&cancel).await
                }
                .await;
                let _ = tx.send((dialer.kind(), result)).await;
            });
        }
        drop(tx);

        let mut errors = Vec::new();
        let first = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                next = rx.recv() => next,
            };
            match next {
                Some((_, Ok(transport))) => break transport,
                Some((kind, Err(e))) => {
                    tracing::warn!("Probe {} -> {}: {} dialer failed: {}", self.local, self.remote, kind, e);
                    errors.push(format!("{}: {}", kind, e));
                }
                None => return Err(Error::AllDialersFailed(errors)),
            }
        };

        if first.kind() == TransportKind::Direct {
            self.drain_late_results(rx);
            return Ok(first);
        }

        let deadline = tokio::time::Instant::now() + self.config.upgrade_grace();
        let mut chosen = first;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = chosen.close().await;
                    return Err(Error::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline) => break,
                next = rx.recv() => next,
            };
            match next {
                Some((_, Ok(transport))) if transport.priority() > chosen.priority() => {
                    tracing::info!("Probe {} -> {}: preferring {} over {}", self.local, self.remote, transport.kind(), chosen.kind());
                    let _ = chosen.close().await;
                    chosen = transport;
                    break;
                }
                Some((_, Ok(transport))) => {
                    let _ = transport.close().await;
                }
                Some((kind, Err(e))) => {
                    tracing::debug!("Probe {} -> {}: {} dialer failed during grace: {}", self.local, self.remote, kind, e);
                }
                None => break,
            }
        }

        self.drain_late_results(rx);
        Ok(chosen)
    }

    fn drain_late_results(self: &Arc<Self>, mut rx: mpsc::Receiver<RaceResult>) {
        let probe = Arc::clone(self);
        tokio::spawn(async move {
            while let Some((kind, result)) = rx.recv().await {
                match result {
                    Ok(transport) => {
                        probe.handle_upgrade_transport(transport).await;
                    }
                    Err(e) => tracing::debug!("Probe {} -> {}: late {} failure: {}", probe.local, probe.remote, kind, e),
                }
            }
        });
    }

    /// Adopt `candidate` if nothing is active or it outranks the active
    /// transport. The replaced transport is closed after the drain grace.
    pub async fn handle_upgrade_transport(&self, candidate: SharedTransport) -> bool {
        let mut current = self.current.lock().await;

        if self.state() == ConnectionState::Closed {
            drop(current);
            let _ = candidate.close().await;
            return false;
        }

        if let Some(active) = current.as_ref() {
            if candidate.priority() <= active.priority() {
                tracing::debug!(
                    "Probe {} -> {}: keeping {}, ignoring {}",
                    self.local,
                    self.remote,
                    active.kind(),
                    candidate.kind()
                );
                drop(current);
                let _ = candidate.close().await;
                return false;
            }
        }

        let previous = current.replace(Arc::clone(&candidate));
        tracing::info!(
            "Probe {} -> {}: using {} transport via {}",
            self.local,
            self.remote,
            candidate.kind(),
            candidate.remote_addr()
        );

        if let Some(previous) = previous {
            let grace = self.config.drain_grace();
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if let Err(e) = previous.close().await {
                    tracing::debug!("Closing replaced transport failed: {}", e);
                }
            });
        }

        // The device is updated under the adoption lock so installs land
        // in adoption order
        if let Some(handler) = &self.on_success {
            if let Err(e) = handler(self.remote, candidate).await {
                tracing::warn!("Peer-add for {} failed: {}", self.remote, e);
            }
        }
        self.set_state(ConnectionState::Connected);
        drop(current);
        true
    }

    /// Route a signaling packet to the dialer it names
    pub async fn handle(&self, cancel: &CancellationToken, remote: PeerId, packet: SignalPacket) -> Result<()> {
        if remote != self.remote {
            return Err(Error::AgentNotFound(remote));
        }
        let dialer = self
            .dialers
            .read()
            .await
            .get(&packet.dialer)
            .cloned()
            .ok_or(Error::AgentNotFound(remote))?;
        dialer.handle(cancel, remote, packet).await
    }

    /// Check the active transport. A dead transport is dropped and the
    /// probe moves to `Disconnected`.
    pub async fn ping(&self, _cancel: &CancellationToken) -> Result<()> {
        let mut current = self.current.lock().await;
        let transport = current.clone().ok_or(Error::NotConnected(self.remote))?;
        if transport.is_alive() {
            return Ok(());
        }

        current.take();
        drop(current);
        tracing::warn!(
            "Probe {} -> {}: {} transport lost",
            self.local,
            self.remote,
            transport.kind()
        );
        self.set_state(ConnectionState::Disconnected);
        let _ = transport.close().await;
        Err(Error::NotConnected(self.remote))
    }

    /// Tear down. The probe refuses to start again.
    pub async fn close(&self) {
        self.set_state(ConnectionState::Closed);
        if let Ok(mut slot) = self.cycle.lock() {
            if let Some(cycle) = slot.take() {
                cycle.cancel();
            }
        }
        let dialers = std::mem::take(&mut *self.dialers.write().await);
        for dialer in dialers.into_values() {
            dialer.abort().await;
        }
        if let Some(transport) = self.current.lock().await.take() {
            let _ = transport.close().await;
        }
    }

    /// Wait until the probe connects, fails or is closed
    pub async fn settled(&self, timeout: Duration) -> ConnectionState {
        let mut rx = self.subscribe();
        let wait = rx.wait_for(|state| !matches!(state, ConnectionState::New | ConnectionState::Checking));
        let settled = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(state)) => *state,
            _ => self.state(),
        };
        settled
    }
}

#[async_trait]
impl ProbeTarget for Arc<Probe> {
    fn peer(&self) -> PeerId {
        self.remote
    }

    async fn attempt(&self, cancel: &CancellationToken) -> Result<()> {
        Probe::start(self, cancel, self.remote).await
    }

    fn connection_state(&self) -> ConnectionState {
        Probe::state(self)
    }

    async fn connect_type(&self) -> ConnectType {
        if self.force_relay {
            return ConnectType::Relay;
        }
        self.registry.connect_type(&self.remote).await.unwrap_or_default()
    }

    async fn set_connect_type(&self, connect_type: ConnectType) -> Result<()> {
        self.registry.set_connect_type(&self.remote, connect_type).await
    }
}
