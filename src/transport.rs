// file: src/transport.rs
// description: duplex text-frame transport; WebSocket over TCP/TLS via fastwebsockets
// reference: https://docs.rs/fastwebsockets/latest/fastwebsockets/

use crate::error::{SyncError, SyncResult};
use fastwebsockets::{FragmentCollector, Frame, OpCode, Payload, Role, WebSocket};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};
use url::Url;

/// Opens connections to an endpoint. The manager is generic over this so
/// the wire can be swapped for an in-memory pair.
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    fn open(&self, endpoint: &Url) -> impl Future<Output = SyncResult<Self::Conn>> + Send;
}

/// One established duplex text connection.
pub trait Connection: Send + 'static {
    /// Next text frame, or `None` once the peer closed the connection.
    fn recv_text(&mut self) -> impl Future<Output = SyncResult<Option<String>>> + Send;

    fn send_text(&mut self, text: String) -> impl Future<Output = SyncResult<()>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

type BoxedStream = Box<dyn IoStream>;

/// Dials `ws://` and `wss://` endpoints.
#[derive(Clone)]
pub struct WebSocketConnector {
    tls: tokio_rustls::TlsConnector,
}

impl WebSocketConnector {
    pub fn new() -> SyncResult<Self> {
        let config = rustls::ClientConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()?
        .with_root_certificates(rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        })
        .with_no_client_auth();

        Ok(Self {
            tls: tokio_rustls::TlsConnector::from(Arc::new(config)),
        })
    }

    async fn dial(&self, endpoint: &Url) -> SyncResult<BoxedStream> {
        let host = endpoint
            .host_str()
            .ok_or_else(|| SyncError::HandshakeFailed {
                reason: format!("no host in {endpoint}"),
            })?
            .to_string();
        let port = endpoint
            .port_or_known_default()
            .ok_or_else(|| SyncError::HandshakeFailed {
                reason: format!("no port for scheme {}", endpoint.scheme()),
            })?;

        let tcp = TcpStream::connect((host.as_str(), port)).await?;
        tcp.set_nodelay(true)?;

        match endpoint.scheme() {
            "ws" => Ok(Box::new(tcp)),
            "wss" => {
                let domain = rustls::pki_types::ServerName::try_from(host.clone()).map_err(|e| {
                    SyncError::HandshakeFailed {
                        reason: format!("invalid TLS server name {host}: {e}"),
                    }
                })?;
                let tls = self.tls.connect(domain, tcp).await?;
                Ok(Box::new(tls))
            }
            other => Err(SyncError::HandshakeFailed {
                reason: format!("unsupported scheme {other}"),
            }),
        }
    }
}

impl Connector for WebSocketConnector {
    type Conn = WebSocketConnection;

    async fn open(&self, endpoint: &Url) -> SyncResult<WebSocketConnection> {
        let mut stream = self.dial(endpoint).await?;
        upgrade(&mut stream, endpoint).await?;

        let mut ws = WebSocket::after_handshake(stream, Role::Client);
        ws.set_writev(true);
        ws.set_auto_close(true);
        ws.set_auto_pong(true);

        debug!(endpoint = %endpoint, "WebSocket upgrade complete");
        Ok(WebSocketConnection {
            ws: FragmentCollector::new(ws),
        })
    }
}

fn host_header(endpoint: &Url) -> String {
    let host = endpoint.host_str().unwrap_or_default();
    match endpoint.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn request_target(endpoint: &Url) -> String {
    match endpoint.query() {
        Some(query) => format!("{}?{}", endpoint.path(), query),
        None => endpoint.path().to_string(),
    }
}

// Reads the HTTP upgrade response byte by byte so no frame bytes are consumed.
async fn upgrade(stream: &mut BoxedStream, endpoint: &Url) -> SyncResult<()> {
    let key = fastwebsockets::handshake::generate_key();
    let request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n",
        request_target(endpoint),
        host_header(endpoint),
        key
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 16 * 1024 {
            return Err(SyncError::HandshakeFailed {
                reason: "upgrade response headers too large".into(),
            });
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(SyncError::ConnectionClosed);
        }
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    trace!("Upgrade response: {}", head);
    let status_line = head.lines().next().unwrap_or_default();
    if !status_line.contains(" 101 ") && !status_line.ends_with(" 101") {
        return Err(SyncError::HandshakeFailed {
            reason: status_line.to_string(),
        });
    }
    Ok(())
}

pub struct WebSocketConnection {
    ws: FragmentCollector<BoxedStream>,
}

impl Connection for WebSocketConnection {
    async fn recv_text(&mut self) -> SyncResult<Option<String>> {
        loop {
            let frame = self.ws.read_frame().await?;
            match frame.opcode {
                OpCode::Text => {
                    let text = String::from_utf8(frame.payload.to_vec()).map_err(|e| {
                        SyncError::InvalidMessage(format!("non UTF-8 text frame: {e}"))
                    })?;
                    return Ok(Some(text));
                }
                OpCode::Binary => {
                    warn!(
                        "Binary frame of {} bytes ignored; attachments are not supported",
                        frame.payload.len()
                    );
                }
                OpCode::Close => return Ok(None),
                _ => {}
            }
        }
    }

    async fn send_text(&mut self, text: String) -> SyncResult<()> {
        self.ws
            .write_frame(Frame::text(Payload::Owned(text.into_bytes())))
            .await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.write_frame(Frame::close(1000, b"")).await {
            debug!("Close frame not delivered: {}", e);
        }
    }
}
