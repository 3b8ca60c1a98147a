//! WRRP Relay Server
//!
//! Accepts upgraded streams, keeps a session routing table and forwards
//! frames between sessions. Delivered frames carry the source session id
//! so the receiver can tell its peers apart.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::codec::Framed;

use super::codec::{Frame, WrrpCodec};
use super::protocol::Command;
use super::{header_value, read_http_head, UPGRADE_PATH};
use crate::error::{Error, Result};
use crate::peer::SessionId;

const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);
const SESSION_QUEUE: usize = 1024;

type SessionMap = Arc<RwLock<HashMap<SessionId, mpsc::Sender<Frame>>>>;

/// Relay server
pub struct WrrpServer {
    /// Bind address
    bind_address: String,
    /// Largest accepted payload
    max_frame_size: usize,
    /// Registered sessions
    sessions: SessionMap,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl WrrpServer {
    pub fn new(bind_address: String, max_frame_size: usize) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            bind_address,
            max_frame_size,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            shutdown: shutdown_tx,
        }
    }

    /// Bind and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("WRRP relay listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let sessions = Arc::clone(&self.sessions);
                            let max_frame_size = self.max_frame_size;

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, addr, sessions, max_frame_size).await {
                                    tracing::warn!("Relay connection error from {}: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("WRRP relay stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Number of registered sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

async fn upgrade(socket: &mut TcpStream) -> Result<()> {
    let head = tokio::time::timeout(UPGRADE_TIMEOUT, read_http_head(socket))
        .await
        .map_err(|_| Error::DialFailed {
            kind: "relay".into(),
            reason: "upgrade request timed out".into(),
        })??;

    let request_line = head.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let valid = parts.next() == Some("GET")
        && parts.next() == Some(UPGRADE_PATH)
        && header_value(&head, "upgrade").map_or(false, |v| v.eq_ignore_ascii_case("wrrp"));

    if !valid {
        socket
            .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
            .await?;
        return Err(Error::DialFailed {
            kind: "relay".into(),
            reason: format!("bad upgrade request: {}", request_line),
        });
    }

    socket
        .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: wrrp\r\nConnection: Upgrade\r\n\r\n")
        .await?;
    Ok(())
}

/// Handle one relay client
async fn handle_connection(
    mut socket: TcpStream,
    addr: SocketAddr,
    sessions: SessionMap,
    max_frame_size: usize,
) -> Result<()> {
    socket.set_nodelay(true)?;
    upgrade(&mut socket).await?;

    let (mut sink, mut stream) = Framed::new(socket, WrrpCodec::new(max_frame_size)).split();

    let session = match tokio::time::timeout(UPGRADE_TIMEOUT, stream.next()).await {
        Ok(Some(Ok(frame))) if frame.cmd() == Command::Register => frame.session_id(),
        Ok(Some(Err(e))) => return Err(e),
        _ => {
            return Err(Error::DialFailed {
                kind: "relay".into(),
                reason: "expected register frame".into(),
            })
        }
    };

    let (tx, mut rx) = mpsc::channel::<Frame>(SESSION_QUEUE);
    if sessions.write().await.insert(session, tx.clone()).is_some() {
        tracing::debug!("Relay session {} re-registered", session);
    }
    tracing::info!("Relay session {} registered from {}", session, addr);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                tracing::debug!("Relay write error: {}", e);
                break;
            }
        }
    });

    let result = loop {
        match stream.next().await {
            Some(Ok(frame)) => match frame.cmd() {
                Command::Ping => {
                    let _ = tx.try_send(Frame::ping(session));
                }
                Command::Forward | Command::Probe => {
                    let target = sessions.read().await.get(&frame.session_id()).cloned();
                    match target {
                        Some(target) => {
                            let mut out = frame;
                            let destination = out.header.session_id;
                            out.header.session_id = session;
                            if target.try_send(out).is_err() {
                                tracing::trace!("Relay queue for {} full, dropping frame", destination);
                            }
                        }
                        None => {
                            tracing::trace!("Relay frame for unknown session {}", frame.header.session_id);
                        }
                    }
                }
                Command::Register => {}
            },
            Some(Err(e)) => break Err(e),
            None => break Ok(()),
        }
    };

    {
        let mut sessions = sessions.write().await;
        if sessions.get(&session).map_or(false, |t| t.same_channel(&tx)) {
            sessions.remove(&session);
        }
    }
    writer.abort();
    tracing::info!("Relay session {} from {} ended", session, addr);

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::peer::PrivateKey;
    use crate::wrrp::WrrpClient;
    use bytes::Bytes;

    async fn spawn_server() -> (Arc<WrrpServer>, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = Arc::new(WrrpServer::new(addr.clone(), 65535));
        let serving = Arc::clone(&server);
        tokio::spawn(async move { serving.serve(listener).await });
        (server, addr)
    }

    #[tokio::test]
    async fn test_forward_between_sessions() {
        let (server, addr) = spawn_server().await;
        let config = RelayConfig::default();

        let key_a = PrivateKey::generate().public_key();
        let key_b = PrivateKey::generate().public_key();
        let (client_a, _signals_a) = WrrpClient::connect(&addr, &key_a, &config).await.unwrap();
        let (client_b, mut signals_b) = WrrpClient::connect(&addr, &key_b, &config).await.unwrap();

        let session_a = SessionId::from_public_key(&key_a);
        let session_b = SessionId::from_public_key(&key_b);
        let mut from_a = client_b.register_route(session_a).await.rx;

        // Registration is asynchronous on the server side
        for _ in 0..50 {
            if server.session_count().await == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        client_a
            .send_forward(session_b, Bytes::from_static(b"datagram"))
            .await
            .unwrap();
        let payload = tokio::time::timeout(Duration::from_secs(2), from_a.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, Bytes::from_static(b"datagram"));

        client_a
            .send_probe(session_b, Bytes::from_static(b"signal"))
            .await
            .unwrap();
        let (source, payload) = tokio::time::timeout(Duration::from_secs(2), signals_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(source, session_a);
        assert_eq!(payload, Bytes::from_static(b"signal"));

        assert!(client_a.is_alive());
        client_a.close().await;
        assert!(!client_a.is_alive());
        server.stop();
    }

    #[tokio::test]
    async fn test_rejects_plain_http() {
        let (server, addr) = spawn_server().await;

        let mut socket = TcpStream::connect(&addr).await.unwrap();
        socket
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let head = read_http_head(&mut socket).await.unwrap();
        assert!(head.starts_with("HTTP/1.1 400"));
        assert_eq!(server.session_count().await, 0);
        server.stop();
    }
}
