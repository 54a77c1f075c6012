//! Origin - outbound reachability capabilities
//!
//! An `Origin` is how the capture engine reaches the Internet: a TCP
//! connect, a datagram opening, and a convenience HTTPS fetch. The local
//! realisation uses host sockets directly; remote realisations tunnel the
//! same operations through a provider.

mod local;

pub use local::Local;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::common::{Socket, Stream};
use crate::error::{Error, Result};

/// Receives datagrams landed by an `Opening`.
pub trait Sewer: Send + Sync {
    fn land(&self, payload: &[u8], source: Socket);
}

/// An established datagram opening bound to an ephemeral local socket.
#[async_trait]
pub trait Opening: Send + Sync {
    async fn send(&self, payload: &[u8], target: Socket) -> Result<()>;
}

/// Capability for reaching the Internet through some egress.
#[async_trait]
pub trait Origin: Send + Sync {
    /// Establish a TCP byte stream to `host:port` over the egress.
    async fn connect(&self, host: &str, port: u16) -> Result<Stream>;

    /// Bind a new datagram opening; `sewer` receives `(payload, source)`
    /// pairs for every datagram that comes back.
    async fn unlid(&self, sewer: Arc<dyn Sewer>) -> Result<Arc<dyn Opening>>;

    /// Convenience HTTPS request over the egress.
    async fn fetch(
        &self,
        method: &str,
        locator: &Locator,
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> Result<Response>;
}

/// A parsed URL endpoint: scheme, host, port and path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Locator {
    pub fn new(scheme: &str, host: &str, port: u16, path: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
            path: path.to_string(),
        }
    }

    /// Parse `scheme://host[:port][/path]`.
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::Config(format!("invalid url: {}", url)))?;
        let (authority, path) = match rest.find('/') {
            Some(index) => (&rest[..index], &rest[index..]),
            None => (rest, "/"),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .map_err(|_| Error::Config(format!("invalid port in url: {}", url)))?,
            ),
            None => match scheme {
                "https" => (authority, 443),
                "http" => (authority, 80),
                _ => return Err(Error::Config(format!("unknown scheme in url: {}", url))),
            },
        };
        if host.is_empty() {
            return Err(Error::Config(format!("empty host in url: {}", url)));
        }
        Ok(Self::new(scheme, host, port, path))
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}://{}:{}{}",
            self.scheme, self.host, self.port, self.path
        )
    }
}

/// An HTTP response from `Origin::fetch`.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Response {
    /// The body of a successful response, or an error for anything else.
    pub fn ok(self) -> Result<Vec<u8>> {
        if (200..300).contains(&self.status) {
            Ok(self.body)
        } else {
            Err(Error::Http(format!("status {}", self.status)))
        }
    }
}

/// Time a fetch through `origin`, returning (megabits per second, bytes).
pub async fn measure(origin: &dyn Origin, locator: &Locator) -> Result<(f64, usize)> {
    tokio::time::sleep(Duration::from_millis(1000)).await;
    let before = Instant::now();
    let body = origin.fetch("GET", locator, &[], None).await?.ok()?;
    let elapsed = before.elapsed().as_secs_f64();
    let mbps = (body.len() as f64 * 8.0) / elapsed / 1_000_000.0;
    Ok((mbps, body.len()))
}
