//! Local origin: host sockets, no tunnel
//!
//! Connects, opens datagram sockets and fetches directly from the host's
//! network stack. This is the innermost origin; tunnelled origins wrap the
//! same capability surface around a provider connection.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::common::{IntoStream, Socket, Stream};
use crate::error::{Error, Result};

use super::{Locator, Opening, Origin, Response, Sewer};

pub struct Local {
    connector: TlsConnector,
}

impl Local {
    pub fn new() -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            connector: TlsConnector::from(Arc::new(config)),
        }
    }
}

impl Default for Local {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Origin for Local {
    async fn connect(&self, host: &str, port: u16) -> Result<Stream> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream.into_stream())
    }

    async fn unlid(&self, sewer: Arc<dyn Sewer>) -> Result<Arc<dyn Opening>> {
        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?);

        let receiver = Arc::clone(&socket);
        tokio::spawn(async move {
            let mut buffer = vec![0u8; 65535];
            loop {
                match receiver.recv_from(&mut buffer).await {
                    Ok((size, SocketAddr::V4(from))) => {
                        sewer.land(&buffer[..size], Socket::from(from));
                    }
                    Ok(_) => {}
                    Err(error) => {
                        debug!("opening receive failed: {}", error);
                        break;
                    }
                }
            }
        });

        Ok(Arc::new(LocalOpening { socket }))
    }

    async fn fetch(
        &self,
        method: &str,
        locator: &Locator,
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> Result<Response> {
        let stream = TcpStream::connect((locator.host.as_str(), locator.port)).await?;
        stream.set_nodelay(true)?;

        let stream: Stream = match locator.scheme.as_str() {
            "http" => stream.into_stream(),
            "https" => {
                let name = ServerName::try_from(locator.host.clone())
                    .map_err(|_| Error::Config(format!("invalid server name: {}", locator.host)))?;
                self.connector.connect(name, stream).await?.into_stream()
            }
            other => return Err(Error::Unsupported(format!("fetch scheme: {}", other))),
        };

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|error| Error::Http(error.to_string()))?;
        tokio::spawn(async move {
            if let Err(error) = connection.await {
                debug!("fetch connection closed: {}", error);
            }
        });

        let mut builder = hyper::Request::builder()
            .method(method)
            .uri(locator.path.clone())
            .header(hyper::header::HOST, locator.host.clone());
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|error| Error::Http(error.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|error| Error::Http(error.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|error| Error::Http(error.to_string()))?
            .to_bytes()
            .to_vec();

        Ok(Response { status, body })
    }
}

struct LocalOpening {
    socket: Arc<UdpSocket>,
}

#[async_trait]
impl Opening for LocalOpening {
    async fn send(&self, payload: &[u8], target: Socket) -> Result<()> {
        self.socket
            .send_to(payload, SocketAddr::from(target))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_connect_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buffer = [0u8; 5];
            stream.read_exact(&mut buffer).await.unwrap();
            stream.write_all(&buffer).await.unwrap();
        });

        let origin = Local::new();
        let mut stream = origin.connect("127.0.0.1", port).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");
    }

    struct ChannelSewer(mpsc::UnboundedSender<(Vec<u8>, Socket)>);

    impl Sewer for ChannelSewer {
        fn land(&self, payload: &[u8], source: Socket) {
            let _ = self.0.send((payload.to_vec(), source));
        }
    }

    #[tokio::test]
    async fn test_unlid_send_and_land() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let peer_socket = match peer_addr {
            SocketAddr::V4(v4) => Socket::from(v4),
            _ => unreachable!(),
        };

        let origin = Local::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let opening = origin.unlid(Arc::new(ChannelSewer(tx))).await.unwrap();

        opening.send(b"ping", peer_socket).await.unwrap();
        let mut buffer = [0u8; 16];
        let (size, from) = peer.recv_from(&mut buffer).await.unwrap();
        assert_eq!(&buffer[..size], b"ping");

        peer.send_to(b"pong", from).await.unwrap();
        let (payload, source) = rx.recv().await.unwrap();
        assert_eq!(payload, b"pong");
        assert_eq!(source, peer_socket);
    }

    #[tokio::test]
    async fn test_fetch_plain_http() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buffer = [0u8; 1024];
            loop {
                let size = stream.read(&mut buffer).await.unwrap();
                request.extend_from_slice(&buffer[..size]);
                if size == 0 || request.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            assert!(request.starts_with(b"GET /test "));
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello")
                .await
                .unwrap();
        });

        let origin = Local::new();
        let locator = Locator::new("http", "127.0.0.1", port, "/test");
        let body = origin
            .fetch("GET", &locator, &[], None)
            .await
            .unwrap()
            .ok()
            .unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn test_fetch_error_status() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buffer = [0u8; 1024];
            let _ = stream.read(&mut buffer).await;
            stream
                .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let origin = Local::new();
        let locator = Locator::new("http", "127.0.0.1", port, "/missing");
        let response = origin.fetch("GET", &locator, &[], None).await.unwrap();
        assert_eq!(response.status, 404);
        assert!(response.ok().is_err());
    }
}
