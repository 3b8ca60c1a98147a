//! Tunnel device adapter
//!
//! The tunnel device consumes adopted transports. `MemoryDevice` keeps
//! peer configuration in process and speaks the WireGuard UAPI text
//! format (hex keys, one `key=value` per line).

pub mod uapi;

pub use uapi::UapiServer;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::peer::{PrivateKey, PublicKey};
use crate::transport::{SharedTransport, TransportKind};

/// Peer configuration pushed to the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePeer {
    pub public_key: PublicKey,
    pub allowed_ips: Vec<String>,
    pub endpoint: Option<String>,
}

impl DevicePeer {
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            allowed_ips: Vec::new(),
            endpoint: None,
        }
    }
}

/// WireGuard-compatible tunnel device
#[async_trait]
pub trait TunnelDevice: Send + Sync {
    fn name(&self) -> &str;

    async fn up(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Install or update a peer and the transport carrying its traffic
    async fn add_peer(&self, peer: DevicePeer, transport: Option<SharedTransport>) -> Result<()>;

    async fn remove_peer(&self, public_key: &PublicKey) -> Result<()>;

    /// Render the UAPI `get` response body
    async fn ipc_get(&self) -> Result<String>;

    /// Apply a UAPI `set` request body
    async fn ipc_set(&self, config: &str) -> Result<()>;
}

struct DeviceEntry {
    config: DevicePeer,
    transport: Option<SharedTransport>,
}

/// In-process device
pub struct MemoryDevice {
    name: String,
    private_key: RwLock<Option<PrivateKey>>,
    peers: RwLock<BTreeMap<PublicKey, DeviceEntry>>,
    up: AtomicBool,
}

impl MemoryDevice {
    pub fn new(name: impl Into<String>, private_key: Option<PrivateKey>) -> Self {
        Self {
            name: name.into(),
            private_key: RwLock::new(private_key),
            peers: RwLock::new(BTreeMap::new()),
            up: AtomicBool::new(false),
        }
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    pub async fn peer(&self, public_key: &PublicKey) -> Option<DevicePeer> {
        self.peers.read().await.get(public_key).map(|e| e.config.clone())
    }

    /// Kind of transport currently installed for a peer
    pub async fn transport_kind(&self, public_key: &PublicKey) -> Option<TransportKind> {
        self.peers
            .read()
            .await
            .get(public_key)
            .and_then(|e| e.transport.as_ref().map(|t| t.kind()))
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }
}

#[async_trait]
impl TunnelDevice for MemoryDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn up(&self) -> Result<()> {
        self.up.store(true, Ordering::SeqCst);
        tracing::info!("Device {} up", self.name);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.up.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let peers = std::mem::take(&mut *self.peers.write().await);
        for entry in peers.into_values() {
            if let Some(transport) = entry.transport {
                let _ = transport.close().await;
            }
        }
        tracing::info!("Device {} closed", self.name);
        Ok(())
    }

    async fn add_peer(&self, peer: DevicePeer, transport: Option<SharedTransport>) -> Result<()> {
        let mut peers = self.peers.write().await;
        let key = peer.public_key;
        match peers.get_mut(&key) {
            Some(entry) => {
                entry.config = peer;
                if transport.is_some() {
                    entry.transport = transport;
                }
            }
            None => {
                peers.insert(key, DeviceEntry { config: peer, transport });
            }
        }
        tracing::debug!("Device {} peer {} installed", self.name, key);
        Ok(())
    }

    async fn remove_peer(&self, public_key: &PublicKey) -> Result<()> {
        let removed = self.peers.write().await.remove(public_key);
        if let Some(transport) = removed.and_then(|e| e.transport) {
            let _ = transport.close().await;
        }
        Ok(())
    }

    async fn ipc_get(&self) -> Result<String> {
        let mut out = String::new();
        if let Some(key) = self.private_key.read().await.as_ref() {
            let _ = writeln!(out, "private_key={}", key.to_hex());
        }
        for (key, entry) in self.peers.read().await.iter() {
            let _ = writeln!(out, "public_key={}", key.to_hex());
            if let Some(endpoint) = &entry.config.endpoint {
                let _ = writeln!(out, "endpoint={}", endpoint);
            }
            for ip in &entry.config.allowed_ips {
                let _ = writeln!(out, "allowed_ip={}", ip);
            }
        }
        Ok(out)
    }

    async fn ipc_set(&self, config: &str) -> Result<()> {
        let mut peers = self.peers.write().await;
        let mut current: Option<PublicKey> = None;

        for line in config.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| Error::ipc_invalid(format!("failed to parse line {:?}", line)))?;

            match key {
                "private_key" => {
                    *self.private_key.write().await = Some(PrivateKey::from_hex(value)?);
                }
                "listen_port" | "fwmark" | "protocol_version" | "persistent_keepalive_interval" => {}
                "replace_peers" => {
                    if value == "true" {
                        peers.clear();
                    }
                }
                "public_key" => {
                    let public_key = PublicKey::from_hex(value)?;
                    peers.entry(public_key).or_insert_with(|| DeviceEntry {
                        config: DevicePeer::new(public_key),
                        transport: None,
                    });
                    current = Some(public_key);
                }
                _ => {
                    let public_key = current
                        .ok_or_else(|| Error::ipc_invalid(format!("{} outside of a peer section", key)))?;
                    let Some(entry) = peers.get_mut(&public_key) else {
                        return Err(Error::ipc_invalid(format!("{} after peer removal", key)));
                    };
                    match key {
                        "endpoint" => entry.config.endpoint = Some(value.to_string()),
                        "allowed_ip" => entry.config.allowed_ips.push(value.to_string()),
                        "replace_allowed_ips" => {
                            if value == "true" {
                                entry.config.allowed_ips.clear();
                            }
                        }
                        "remove" => {
                            if value == "true" {
                                if let Some(transport) = peers.remove(&public_key).and_then(|e| e.transport) {
                                    let _ = transport.close().await;
                                }
                            }
                        }
                        _ => return Err(Error::ipc_invalid(format!("invalid UAPI key {:?}", key))),
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IPC_ERROR_INVALID;

    #[tokio::test]
    async fn test_set_then_get() {
        let device = MemoryDevice::new("wf0", None);
        let private = PrivateKey::generate();
        let peer = PrivateKey::generate().public_key();

        let request = format!(
            "private_key={}\npublic_key={}\nendpoint=10.0.0.2:51820\nallowed_ip=10.1.0.2/32\n",
            private.to_hex(),
            peer.to_hex()
        );
        device.ipc_set(&request).await.unwrap();

        let dump = device.ipc_get().await.unwrap();
        assert!(dump.starts_with(&format!("private_key={}\n", private.to_hex())));
        assert!(dump.contains(&format!("public_key={}\n", peer.to_hex())));
        assert!(dump.contains("endpoint=10.0.0.2:51820\n"));
        assert!(dump.contains("allowed_ip=10.1.0.2/32\n"));

        device
            .ipc_set(&format!("public_key={}\nremove=true\n", peer.to_hex()))
            .await
            .unwrap();
        assert_eq!(device.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_set_rejects_garbage() {
        let device = MemoryDevice::new("wf0", None);
        let err = device.ipc_set("endpoint=1.2.3.4:5\n").await.unwrap_err();
        assert_eq!(err.ipc_code(), IPC_ERROR_INVALID);

        let err = device.ipc_set("no equals sign\n").await.unwrap_err();
        assert_eq!(err.ipc_code(), IPC_ERROR_INVALID);

        assert!(device.ipc_set("public_key=zz\n").await.is_err());
    }

    #[tokio::test]
    async fn test_add_peer_keeps_transport_on_update() {
        let device = MemoryDevice::new("wf0", None);
        device.up().await.unwrap();
        let key = PrivateKey::generate().public_key();

        let mut config = DevicePeer::new(key);
        config.allowed_ips.push("10.1.0.3/32".into());
        device.add_peer(config.clone(), None).await.unwrap();

        config.endpoint = Some("relay://r:1/abc".into());
        device.add_peer(config.clone(), None).await.unwrap();
        assert_eq!(device.peer(&key).await, Some(config));
        assert_eq!(device.transport_kind(&key).await, None);

        device.close().await.unwrap();
        assert!(!device.is_up());
        assert_eq!(device.peer_count().await, 0);
    }
}
