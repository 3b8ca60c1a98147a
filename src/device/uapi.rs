//! UAPI control socket
//!
//! Line protocol on `<socket_dir>/<interface>.sock`:
//! - `stop\n` answers `OK\n\n` and requests shutdown
//! - `set=1\n` followed by `key=value` lines and a blank line
//! - `get=1\n\n` answers the device configuration
//!
//! Every operation ends with `errno=<code>\n\n`. An unknown operation
//! closes the connection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::TunnelDevice;
use crate::error::{Error, Result};

/// Control socket server for one device
pub struct UapiServer {
    path: PathBuf,
    device: Arc<dyn TunnelDevice>,
    /// Cancelled when a client sends `stop`
    stop_requested: CancellationToken,
    shutdown: watch::Sender<bool>,
}

impl UapiServer {
    pub fn new(path: PathBuf, device: Arc<dyn TunnelDevice>, stop_requested: CancellationToken) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            path,
            device,
            stop_requested,
            shutdown,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bind the socket and serve until stopped
    #[cfg(unix)]
    pub async fn start(&self) -> Result<()> {
        use tokio::net::UnixListener;

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        // A socket left behind by a previous run blocks bind
        let _ = tokio::fs::remove_file(&self.path).await;

        let listener = UnixListener::bind(&self.path)?;
        tracing::info!("UAPI socket listening on {}", self.path.display());

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let device = Arc::clone(&self.device);
                            let stop = self.stop_requested.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, device, stop).await {
                                    tracing::debug!("UAPI connection ended: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("UAPI accept error: {}", e);
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

        let _ = tokio::fs::remove_file(&self.path).await;
        tracing::info!("UAPI socket closed");
        Ok(())
    }

    #[cfg(not(unix))]
    pub async fn start(&self) -> Result<()> {
        Err(Error::UnsupportedPlatform("UAPI sockets need a unix platform".into()))
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Serve UAPI operations on one stream until it closes
pub async fn handle_connection<S>(stream: S, device: Arc<dyn TunnelDevice>, stop_requested: CancellationToken) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    let mut op = String::new();

    loop {
        op.clear();
        if stream.read_line(&mut op).await? == 0 {
            return Ok(());
        }

        let status = match op.as_str() {
            "stop\n" => {
                stream.write_all(b"OK\n\n").await?;
                tracing::info!("Stop requested over UAPI");
                stop_requested.cancel();
                Ok(())
            }
            "set=1\n" => match read_block(&mut stream).await? {
                Some(body) => device.ipc_set(&body).await,
                None => return Ok(()),
            },
            "get=1\n" => {
                let mut next = [0u8; 1];
                stream.read_exact(&mut next).await?;
                if next[0] != b'\n' {
                    Err(Error::ipc_invalid(format!(
                        "trailing character in UAPI get: {:?}",
                        next[0] as char
                    )))
                } else {
                    match device.ipc_get().await {
                        Ok(body) => {
                            stream.write_all(body.as_bytes()).await?;
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
            }
            _ => {
                tracing::error!("Invalid UAPI operation {:?}", op.trim_end());
                return Err(Error::ipc_invalid(format!("invalid UAPI operation {:?}", op.trim_end())));
            }
        };

        let code = match &status {
            Ok(()) => 0,
            Err(e) => {
                tracing::warn!("UAPI {} failed: {}", op.trim_end(), e);
                e.ipc_code()
            }
        };
        stream.write_all(format!("errno={}\n\n", code).as_bytes()).await?;
        stream.flush().await?;
    }
}

/// Read `key=value` lines up to a blank line. `None` on EOF.
async fn read_block<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut body = String::new();
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        if line == "\n" {
            return Ok(Some(body));
        }
        body.push_str(&line);
    }
}

/// Send one operation and return the response body.
///
/// A non-zero errno becomes `Error::Ipc`.
pub async fn exchange<S>(stream: S, op: &str) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    stream.write_all(op.as_bytes()).await?;
    stream.flush().await?;

    let mut body = String::new();
    let mut line = String::new();
    loop {
        line.clear();
        if stream.read_line(&mut line).await? == 0 {
            return Err(Error::Ipc {
                code: crate::error::IPC_ERROR_UNKNOWN,
                message: "connection closed before errno".into(),
            });
        }
        if let Some(code) = line.trim_end().strip_prefix("errno=") {
            let code: i64 = code
                .parse()
                .map_err(|_| Error::ipc_invalid(format!("bad errno line {:?}", line.trim_end())))?;
            line.clear();
            stream.read_line(&mut line).await?;
            if code != 0 {
                return Err(Error::Ipc { code, message: body });
            }
            return Ok(body);
        }
        body.push_str(&line);
    }
}

/// Connect to a running agent's control socket and run `op`
#[cfg(unix)]
pub async fn request(path: &Path, op: &str) -> Result<String> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    exchange(stream, op).await
}

#[cfg(not(unix))]
pub async fn request(_path: &Path, _op: &str) -> Result<String> {
    Err(Error::UnsupportedPlatform("UAPI sockets need a unix platform".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::error::IPC_ERROR_INVALID;
    use crate::peer::PrivateKey;

    fn serve_duplex(device: Arc<MemoryDevice>) -> (tokio::io::DuplexStream, CancellationToken) {
        let (client, server) = tokio::io::duplex(4096);
        let stop = CancellationToken::new();
        let stop_flag = stop.clone();
        tokio::spawn(async move { handle_connection(server, device, stop_flag).await });
        (client, stop)
    }

    #[tokio::test]
    async fn test_set_and_get_over_socket() {
        let device = Arc::new(MemoryDevice::new("wf0", None));
        let (mut client, _stop) = serve_duplex(Arc::clone(&device));
        let peer = PrivateKey::generate().public_key();

        let set = format!("set=1\npublic_key={}\nallowed_ip=10.2.0.1/32\n\n", peer.to_hex());
        assert_eq!(exchange(&mut client, &set).await.unwrap(), "");

        let body = exchange(&mut client, "get=1\n\n").await.unwrap();
        assert!(body.contains(&format!("public_key={}\n", peer.to_hex())));
        assert!(body.contains("allowed_ip=10.2.0.1/32\n"));
    }

    #[tokio::test]
    async fn test_errors_carry_errno() {
        let device = Arc::new(MemoryDevice::new("wf0", None));
        let (mut client, _stop) = serve_duplex(device);

        match exchange(&mut client, "set=1\nendpoint=1.1.1.1:1\n\n").await {
            Err(Error::Ipc { code, .. }) => assert_eq!(code, IPC_ERROR_INVALID),
            other => panic!("unexpected: {:?}", other),
        }

        match exchange(&mut client, "get=1\nx").await {
            Err(Error::Ipc { code, .. }) => assert_eq!(code, IPC_ERROR_INVALID),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_requests_shutdown() {
        let device = Arc::new(MemoryDevice::new("wf0", None));
        let (mut client, stop) = serve_duplex(device);

        let body = exchange(&mut client, "stop\n").await.unwrap();
        assert_eq!(body, "OK\n\n");
        assert!(stop.is_cancelled());
    }

    #[tokio::test]
    async fn test_unknown_operation_closes() {
        let device = Arc::new(MemoryDevice::new("wf0", None));
        let (mut client, _stop) = serve_duplex(device);
        assert!(exchange(&mut client, "bogus\n").await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_socket_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wf0.sock");
        let device: Arc<dyn TunnelDevice> = Arc::new(MemoryDevice::new("wf0", None));
        let server = Arc::new(UapiServer::new(path.clone(), device, CancellationToken::new()));
        let serving = Arc::clone(&server);
        let handle = tokio::spawn(async move { serving.start().await });

        for _ in 0..100 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(request(&path, "get=1\n\n").await.unwrap(), "");

        server.stop();
        handle.await.unwrap().unwrap();
    }
}
