use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::*;
use ssilink::{Device, Interest, Session};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;
use tokio_vsock::{VsockAddr, VsockListener};

/// How long a blocking readiness wait may hold a blocking-pool thread.
const WAIT_SLICE: Duration = Duration::from_millis(100);

const SOCKET_BUF_LEN: usize = 4096;

#[derive(Debug)]
pub enum ServerTarget {
    Unix(PathBuf),
    Tcp(SocketAddr),
    Vsock { cid: u32, port: u32 },
}

/// Serves one link session at a time over a stream socket.
pub struct BridgeServer {
    target: ServerTarget,
    device: Arc<Device>,
}

impl BridgeServer {
    pub fn new(target: ServerTarget, device: Arc<Device>) -> Self {
        Self { target, device }
    }

    pub async fn run(&self, token: CancellationToken) -> io::Result<()> {
        match &self.target {
            ServerTarget::Unix(path) => {
                if path.exists() {
                    let _ = std::fs::remove_file(path);
                }
                let listener = UnixListener::bind(path)?;
                info!("Bridge listening on Unix socket {:?}", path);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        accepted = listener.accept() => {
                            let (stream, _) = accepted?;
                            info!("Accepted Unix connection");
                            self.serve(stream, token.clone());
                        }
                    }
                }
                let _ = std::fs::remove_file(path);
            }
            ServerTarget::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await?;
                info!("Bridge listening on TCP {:?}", addr);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        accepted = listener.accept() => {
                            let (stream, peer) = accepted?;
                            info!("Accepted TCP connection from {:?}", peer);
                            self.serve(stream, token.clone());
                        }
                    }
                }
            }
            ServerTarget::Vsock { cid, port } => {
                let listener = VsockListener::bind(VsockAddr::new(*cid, *port))?;
                info!("Bridge listening on Vsock CID:{} Port:{}", cid, port);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        accepted = listener.accept() => {
                            let (stream, addr) = accepted?;
                            info!("Accepted Vsock connection from {:?}", addr);
                            self.serve(stream, token.clone());
                        }
                    }
                }
            }
        }

        info!("Bridge stopped accepting connections");
        Ok(())
    }

    /// Opens the link for `stream`, or turns it away while another client
    /// holds it.
    fn serve<S>(&self, stream: S, token: CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session = match self.device.open() {
            Ok(session) => Arc::new(session),
            Err(e) => {
                warn!("Rejecting connection: {}", e);
                return;
            }
        };

        tokio::spawn(async move {
            if let Err(e) = Self::handle_connection(stream, session.clone(), token).await {
                error!("Connection error: {}", e);
            }
            let stats = session.stats();
            info!(
                "Session closed: {} bytes up, {} bytes down, {} tx failures, {} overrun bytes",
                stats.bytes_sent, stats.bytes_received, stats.tx_failures, stats.read_overruns
            );
            session.close();
        });
    }

    /// Pumps socket bytes into the link and link bytes back out until either
    /// side closes.
    async fn handle_connection<S>(
        stream: S,
        session: Arc<Session>,
        token: CancellationToken,
    ) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);

        tokio::select! {
            _ = token.cancelled() => info!("Connection cancelled"),
            res = uplink(&mut reader, &session) => {
                res?;
                info!("Client closed the connection");
            }
            res = downlink(&mut writer, &session) => res?,
        }

        writer.flush().await?;
        Ok(())
    }
}

/// Socket to link. Never queues more than the write ring can hold, so no
/// byte is dropped.
async fn uplink<R>(reader: &mut R, session: &Arc<Session>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; SOCKET_BUF_LEN];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }

        let mut sent = 0;
        while sent < n {
            let room = session.write_capacity();
            if room == 0 {
                wait(session, Interest::WRITABLE).await?;
                continue;
            }
            let end = sent + room.min(n - sent);
            sent += session.write(&buf[sent..end])?;
        }
        trace!("Uplink: {} bytes", n);
    }
}

/// Link to socket.
async fn downlink<W>(writer: &mut W, session: &Arc<Session>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; SOCKET_BUF_LEN];
    loop {
        let n = session.read(&mut buf)?;
        if n == 0 {
            wait(session, Interest::READABLE).await?;
            continue;
        }
        writer.write_all(&buf[..n]).await?;
        trace!("Downlink: {} bytes", n);
    }
}

/// Waits for readiness on a blocking-pool thread, one slice at a time.
async fn wait(session: &Arc<Session>, interest: Interest) -> io::Result<()> {
    let session = session.clone();
    tokio::task::spawn_blocking(move || session.wait(interest, WAIT_SLICE))
        .await
        .map_err(io::Error::other)??;
    Ok(())
}
