//! Point-to-point, ordered, reliable channels between the interceptor and
//! the analyzer, implemented over TCP loopback.
//!
//! Two distinct connections make up the fabric (spec.md §4.7): a
//! packet-metadata stream flowing only interceptor → analyzer, and a
//! command stream flowing only analyzer → interceptor. The interceptor is
//! the server for both (it is the long-lived privileged process); the
//! analyzer connects to each with a bounded retry, per spec.md §7's
//! `PeerUnavailable` handling.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tracing::warn;

use crate::error::NetShieldError;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// The interceptor's side of the fabric: listens for the analyzer to
/// connect on each of the two channels.
pub struct IpcServer {
    packet_listener: TcpListener,
    command_listener: TcpListener,
}

impl IpcServer {
    pub async fn bind(packet_port: u16, command_port: u16) -> Result<Self, NetShieldError> {
        let packet_addr: SocketAddr = ([127, 0, 0, 1], packet_port).into();
        let command_addr: SocketAddr = ([127, 0, 0, 1], command_port).into();

        let packet_listener = TcpListener::bind(packet_addr)
            .await
            .map_err(|e| NetShieldError::PeerUnavailable(format!("bind packet channel: {e}")))?;
        let command_listener = TcpListener::bind(command_addr)
            .await
            .map_err(|e| NetShieldError::PeerUnavailable(format!("bind command channel: {e}")))?;

        Ok(IpcServer {
            packet_listener,
            command_listener,
        })
    }

    /// Actual bound port of the packet channel listener (useful when
    /// binding to port 0 in tests).
    pub fn packet_port(&self) -> u16 {
        self.packet_listener.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Actual bound port of the command channel listener.
    pub fn command_port(&self) -> u16 {
        self.command_listener.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Blocks until the analyzer connects on the packet-metadata channel.
    pub async fn accept_packet_channel(&self) -> Result<TcpStream, NetShieldError> {
        let (stream, _) = self
            .packet_listener
            .accept()
            .await
            .map_err(|e| NetShieldError::PeerUnavailable(format!("accept packet channel: {e}")))?;
        Ok(stream)
    }

    /// Blocks until the analyzer connects on the command channel.
    pub async fn accept_command_channel(&self) -> Result<TcpStream, NetShieldError> {
        let (stream, _) = self
            .command_listener
            .accept()
            .await
            .map_err(|e| NetShieldError::PeerUnavailable(format!("accept command channel: {e}")))?;
        Ok(stream)
    }
}

/// The analyzer's side of the fabric: connects to the interceptor's two
/// listeners with a bounded retry.
pub struct IpcClient;

impl IpcClient {
    /// Connects to `host:port`, retrying every 200ms until `max_wait`
    /// elapses, at which point the peer is declared unavailable.
    pub async fn connect_with_retry(
        host: &str,
        port: u16,
        max_wait: Duration,
    ) -> Result<TcpStream, NetShieldError> {
        let addr = format!("{host}:{port}");
        let deadline = tokio::time::Instant::now() + max_wait;
        let mut last_err = String::new();

        loop {
            match TcpStream::connect(&addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    last_err = e.to_string();
                    if tokio::time::Instant::now() >= deadline {
                        warn!(target: "ipc", %addr, error = %last_err, "peer unavailable after retry window");
                        return Err(NetShieldError::PeerUnavailable(format!(
                            "could not connect to {addr}: {last_err}"
                        )));
                    }
                    sleep(CONNECT_RETRY_INTERVAL).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_binds_to_ephemeral_ports() {
        let server = IpcServer::bind(0, 0).await.unwrap();
        assert_ne!(server.packet_port(), 0);
        assert_ne!(server.command_port(), 0);
        assert_ne!(server.packet_port(), server.command_port());
    }

    #[tokio::test]
    async fn test_client_connects_to_running_server() {
        let server = IpcServer::bind(0, 0).await.unwrap();
        let port = server.packet_port();

        let accept_fut = server.accept_packet_channel();
        let connect_fut = IpcClient::connect_with_retry("127.0.0.1", port, Duration::from_secs(2));

        let (accepted, connected) = tokio::join!(accept_fut, connect_fut);
        assert!(accepted.is_ok());
        assert!(connected.is_ok());
    }

    #[tokio::test]
    async fn test_client_gives_up_after_max_wait_when_nothing_listens() {
        // Port 1 is a reserved low port unlikely to have a listener in test
        // sandboxes; retry budget is kept short so the test stays fast.
        let result =
            IpcClient::connect_with_retry("127.0.0.1", 1, Duration::from_millis(300)).await;
        assert!(result.is_err());
    }
}
