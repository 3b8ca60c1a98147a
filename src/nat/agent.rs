//! NAT Traversal Agent
//!
//! Owns one UDP socket. Gathers local candidates, runs authenticated
//! connectivity checks against the remote's candidates and, once a pair
//! is selected, carries tunnel datagrams over it.
//!
//! Candidates are produced on a channel instead of callbacks; state
//! changes are published on a `watch` channel.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::candidate::Candidate;
use super::check::{CheckKind, CheckMessage};
use super::stun;
use crate::config::NatConfig;
use crate::error::{Error, Result};
use crate::transport::{ConnectionState, Role};

const UFRAG_LEN: usize = 8;
const PWD_LEN: usize = 24;
const DATA_CAPACITY: usize = 512;
const MAX_PENDING_CHECKS: usize = 1024;
const MAX_DATAGRAM: usize = 65536;

/// Invoked when the selected path is lost
pub type AgentCloseHandler = Arc<dyn Fn() + Send + Sync>;

struct CheckSession {
    role: Role,
    remote_ufrag: String,
    remote_pwd: String,
}

pub struct NatAgent {
    socket: UdpSocket,
    ufrag: String,
    pwd: String,
    tie_breaker: u64,
    config: NatConfig,
    remote_candidates: RwLock<Vec<Candidate>>,
    session: StdMutex<Option<CheckSession>>,
    pending: StdMutex<HashMap<[u8; 12], (SocketAddr, bool)>>,
    stun_waiters: StdMutex<HashMap<stun::TransactionId, oneshot::Sender<Vec<u8>>>>,
    state: watch::Sender<ConnectionState>,
    selected: StdMutex<Option<SocketAddr>>,
    data_tx: mpsc::Sender<Bytes>,
    data_rx: Mutex<mpsc::Receiver<Bytes>>,
    last_rx: StdMutex<Instant>,
    on_close: StdMutex<Option<AgentCloseHandler>>,
    cancel: CancellationToken,
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Address the host would route public traffic from
fn primary_ip() -> Option<IpAddr> {
    let probe = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    probe.connect("8.8.8.8:80").ok()?;
    probe.local_addr().ok().map(|a| a.ip())
}

impl NatAgent {
    /// Bind the agent socket and start its receive loop
    pub async fn bind(listen_address: &str, config: NatConfig) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(listen_address).await?;
        let (state, _) = watch::channel(ConnectionState::New);
        let (data_tx, data_rx) = mpsc::channel(DATA_CAPACITY);

        let agent = Arc::new(Self {
            socket,
            ufrag: random_string(UFRAG_LEN),
            pwd: random_string(PWD_LEN),
            tie_breaker: rand::random(),
            config,
            remote_candidates: RwLock::new(Vec::new()),
            session: StdMutex::new(None),
            pending: StdMutex::new(HashMap::new()),
            stun_waiters: StdMutex::new(HashMap::new()),
            state,
            selected: StdMutex::new(None),
            data_tx,
            data_rx: Mutex::new(data_rx),
            last_rx: StdMutex::new(Instant::now()),
            on_close: StdMutex::new(None),
            cancel: CancellationToken::new(),
        });

        tracing::debug!("NAT agent bound on {}", agent.socket.local_addr()?);
        tokio::spawn(Arc::clone(&agent).recv_loop());
        Ok(agent)
    }

    pub fn ufrag(&self) -> &str {
        &self.ufrag
    }

    pub fn pwd(&self) -> &str {
        &self.pwd
    }

    pub fn tie_breaker(&self) -> u64 {
        self.tie_breaker
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected() && !self.cancel.is_cancelled()
    }

    pub fn selected_addr(&self) -> Option<SocketAddr> {
        self.selected.lock().ok().and_then(|s| *s)
    }

    pub fn set_on_close(&self, handler: AgentCloseHandler) {
        if let Ok(mut slot) = self.on_close.lock() {
            *slot = Some(handler);
        }
    }

    fn set_state(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == next || *state == ConnectionState::Closed {
                false
            } else {
                *state = next;
                true
            }
        })
    }

    fn touch(&self) {
        if let Ok(mut seen) = self.last_rx.lock() {
            *seen = Instant::now();
        }
    }

    fn silent_for(&self) -> std::time::Duration {
        self.last_rx
            .lock()
            .map(|seen| seen.elapsed())
            .unwrap_or_default()
    }

    /// Host candidates for the bound socket
    fn host_candidates(&self) -> Vec<Candidate> {
        let Ok(local) = self.socket.local_addr() else {
            return Vec::new();
        };
        if !local.ip().is_unspecified() {
            return vec![Candidate::host(local)];
        }

        let ip = primary_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        vec![Candidate::host(SocketAddr::new(ip, local.port()))]
    }

    async fn stun_query(&self, server: &str) -> Result<SocketAddr> {
        let local = self.socket.local_addr()?;
        let target = tokio::net::lookup_host(server)
            .await?
            .find(|a| a.is_ipv4() == local.is_ipv4())
            .ok_or_else(|| Error::Stun(format!("no usable address for {}", server)))?;

        let txn: stun::TransactionId = rand::random();
        let (tx, rx) = oneshot::channel();
        if let Ok(mut waiters) = self.stun_waiters.lock() {
            waiters.insert(txn, tx);
        }

        self.socket.send_to(&stun::binding_request(&txn), target).await?;
        let response = tokio::time::timeout(self.config.stun_timeout(), rx).await;
        if let Ok(mut waiters) = self.stun_waiters.lock() {
            waiters.remove(&txn);
        }

        match response {
            Ok(Ok(data)) => stun::parse_binding_response(&data, &txn),
            _ => Err(Error::Stun(format!("{} did not answer", server))),
        }
    }

    /// Gather local candidates. The channel closes when gathering ends.
    pub fn gather(self: &Arc<Self>) -> mpsc::Receiver<Candidate> {
        let (tx, rx) = mpsc::channel(16);
        let agent = Arc::clone(self);

        tokio::spawn(async move {
            let mut seen = HashSet::new();
            for candidate in agent.host_candidates() {
                if seen.insert(candidate.address) && tx.send(candidate).await.is_err() {
                    return;
                }
            }

            for server in agent.config.stun_servers.clone() {
                if agent.cancel.is_cancelled() {
                    return;
                }
                match agent.stun_query(&server).await {
                    Ok(mapped) => {
                        if seen.insert(mapped)
                            && tx.send(Candidate::server_reflexive(mapped)).await.is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => tracing::debug!("STUN query to {} failed: {}", server, e),
                }
            }
            tracing::debug!("Candidate gathering complete ({} candidates)", seen.len());
        });

        rx
    }

    pub async fn add_remote_candidate(&self, candidate: Candidate) {
        let mut candidates = self.remote_candidates.write().await;
        if !candidates.iter().any(|c| c.address == candidate.address) {
            tracing::trace!("Remote candidate {}", candidate);
            candidates.push(candidate);
        }
    }

    pub async fn remote_candidate_count(&self) -> usize {
        self.remote_candidates.read().await.len()
    }

    /// Actively connect (controlling side)
    pub async fn dial(self: &Arc<Self>, cancel: &CancellationToken, remote_ufrag: &str, remote_pwd: &str) -> Result<()> {
        self.connect(Role::Controlling, cancel, remote_ufrag, remote_pwd).await
    }

    /// Passively accept (controlled side)
    pub async fn accept(self: &Arc<Self>, cancel: &CancellationToken, remote_ufrag: &str, remote_pwd: &str) -> Result<()> {
        self.connect(Role::Controlled, cancel, remote_ufrag, remote_pwd).await
    }

    async fn connect(
        self: &Arc<Self>,
        role: Role,
        cancel: &CancellationToken,
        remote_ufrag: &str,
        remote_pwd: &str,
    ) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::TransportClosed);
        }
        if let Ok(mut session) = self.session.lock() {
            *session = Some(CheckSession {
                role,
                remote_ufrag: remote_ufrag.to_string(),
                remote_pwd: remote_pwd.to_string(),
            });
        }
        // A nomination may already have arrived before we got here
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::New {
                *state = ConnectionState::Checking;
                true
            } else {
                false
            }
        });

        let checks = cancel.child_token();
        tokio::spawn(Arc::clone(self).check_loop(checks.clone()));

        let mut state_rx = self.state.subscribe();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = self.cancel.cancelled() => Err(Error::TransportClosed),
            _ = tokio::time::sleep(self.config.check_timeout()) => {
                self.set_state(ConnectionState::Failed);
                Err(Error::DialFailed {
                    kind: "direct".into(),
                    reason: "connectivity checks timed out".into(),
                })
            }
            state = state_rx.wait_for(|s| {
                matches!(s, ConnectionState::Connected | ConnectionState::Failed | ConnectionState::Closed)
            }) => {
                match state.map(|s| *s) {
                    Ok(ConnectionState::Connected) => Ok(()),
                    _ => Err(Error::TransportClosed),
                }
            }
        };
        checks.cancel();

        if result.is_ok() {
            tracing::info!(
                "Direct path selected: {:?} ({:?})",
                self.selected_addr(),
                role
            );
            tokio::spawn(Arc::clone(self).keepalive_loop());
        }
        result
    }

    fn session_credentials(&self) -> Option<(Role, String, String)> {
        let session = self.session.lock().ok()?;
        session
            .as_ref()
            .map(|s| (s.role, s.remote_ufrag.clone(), s.remote_pwd.clone()))
    }

    async fn send_check(&self, addr: SocketAddr, nominate: bool) {
        let Some((_, remote_ufrag, remote_pwd)) = self.session_credentials() else {
            return;
        };
        let txn: [u8; 12] = rand::random();
        let request = CheckMessage::request(txn, format!("{}:{}", remote_ufrag, self.ufrag), nominate);

        if let Ok(mut pending) = self.pending.lock() {
            if pending.len() >= MAX_PENDING_CHECKS {
                pending.clear();
            }
            pending.insert(txn, (addr, nominate));
        }

        if let Err(e) = self.socket.send_to(&request.encode(&remote_pwd), addr).await {
            tracing::trace!("Check to {} failed: {}", addr, e);
        }
    }

    async fn check_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.check_interval());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.is_connected() {
                break;
            }

            let Some((role, _, _)) = self.session_credentials() else {
                continue;
            };
            match (role, self.selected_addr()) {
                (Role::Controlling, Some(addr)) => self.send_check(addr, true).await,
                _ => {
                    let targets: Vec<SocketAddr> = self
                        .remote_candidates
                        .read()
                        .await
                        .iter()
                        .map(|c| c.address)
                        .collect();
                    for addr in targets {
                        self.send_check(addr, false).await;
                    }
                }
            }
        }
    }

    async fn keepalive_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.keepalive_interval());
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self.silent_for() > self.config.liveness_timeout() {
                tracing::warn!(
                    "Direct path {:?} silent for over {:?}, disconnecting",
                    self.selected_addr(),
                    self.config.liveness_timeout()
                );
                self.set_state(ConnectionState::Disconnected);
                self.shutdown();
                let handler = self.on_close.lock().ok().and_then(|h| h.clone());
                if let Some(handler) = handler {
                    handler();
                }
                break;
            }

            if let Some(addr) = self.selected_addr() {
                self.send_check(addr, false).await;
            }
        }
    }

    async fn recv_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, src) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::trace!("NAT agent receive error: {}", e);
                        continue;
                    }
                }
            };
            let data = &buf[..n];

            if let Some(txn) = stun::response_transaction(data) {
                let waiter = self.stun_waiters.lock().ok().and_then(|mut w| w.remove(&txn));
                if let Some(waiter) = waiter {
                    let _ = waiter.send(data.to_vec());
                    continue;
                }
            }

            if let Some((message, integrity)) = CheckMessage::decode(data) {
                self.handle_check(message, integrity, src).await;
                continue;
            }

            if self.is_connected() && self.selected_addr() == Some(src) {
                self.touch();
                if self.data_tx.try_send(Bytes::copy_from_slice(data)).is_err() {
                    tracing::trace!("Direct receive queue full, dropping datagram");
                }
            } else {
                tracing::trace!("Dropping {} bytes from unselected {}", n, src);
            }
        }
    }

    fn select(&self, addr: SocketAddr) {
        if let Ok(mut selected) = self.selected.lock() {
            *selected = Some(addr);
        }
    }

    async fn handle_check(&self, message: CheckMessage, integrity: [u8; 32], src: SocketAddr) {
        match message.kind {
            CheckKind::Request => {
                let for_us = message
                    .username
                    .split_once(':')
                    .map_or(false, |(ours, _)| ours == self.ufrag);
                if !for_us || !message.verify(&integrity, &self.pwd) {
                    tracing::trace!("Rejected check from {}", src);
                    return;
                }

                let response = CheckMessage::response_to(&message);
                if let Err(e) = self.socket.send_to(&response.encode(&self.pwd), src).await {
                    tracing::trace!("Check response to {} failed: {}", src, e);
                }

                if self.selected_addr() == Some(src) {
                    self.touch();
                }
                if message.nominate && !self.is_connected() {
                    self.select(src);
                    self.touch();
                    self.set_state(ConnectionState::Connected);
                }
            }
            CheckKind::Response => {
                let pending = self.pending.lock().ok().and_then(|mut p| p.remove(&message.txn));
                let Some((addr, nominate)) = pending else {
                    return;
                };
                let Some((role, _, remote_pwd)) = self.session_credentials() else {
                    return;
                };
                if addr != src || !message.verify(&integrity, &remote_pwd) {
                    tracing::trace!("Rejected check response from {}", src);
                    return;
                }

                match self.selected_addr() {
                    Some(selected) if selected == src => self.touch(),
                    Some(_) => return,
                    None if role == Role::Controlling => {
                        self.select(src);
                        self.touch();
                        // Nominate right away instead of waiting for the next tick
                        self.send_check(src, true).await;
                    }
                    None => return,
                }

                if nominate && role == Role::Controlling && !self.is_connected() {
                    self.set_state(ConnectionState::Connected);
                }
            }
        }
    }

    /// Receive the next tunnel datagram
    pub async fn recv(&self) -> Result<Bytes> {
        let mut rx = self.data_rx.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::TransportClosed),
            data = rx.recv() => data.ok_or(Error::TransportClosed),
        }
    }

    /// Send a tunnel datagram on the selected pair
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::TransportClosed);
        }
        let addr = self.selected_addr().ok_or(Error::TransportClosed)?;
        self.socket.send_to(data, addr).await?;
        Ok(())
    }

    fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Close the agent; no close handler is invoked
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.set_state(ConnectionState::Closed);
        self.shutdown();
        tracing::debug!("NAT agent {} closed", self.ufrag);
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
