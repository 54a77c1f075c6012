//! Server node
//!
//! Keeps one `Client` per peer fingerprint (weakly, so idle sessions lapse)
//! and runs the TLS signalling endpoint: an SDP offer POSTed to the
//! configured path is answered with the SDP answer as `text/plain`; any
//! negotiation failure is a bare 404; every other route answers 200 empty.

pub mod client;
pub mod egress;

pub use client::{Client, Negotiator, Translator};
pub use egress::Egress;

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex, Weak};

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_rustls::rustls::pki_types::PrivateKeyDer;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::origin::Locator;

/// PEM-encoded TLS identity for the signalling endpoint.
#[derive(Clone)]
pub struct TlsIdentity {
    pub key: String,
    pub chain: String,
}

pub struct Node {
    ice: Vec<String>,
    locator: Locator,
    lottery: String,
    negotiator: Arc<dyn Negotiator>,
    egress: Arc<dyn Egress>,
    clients: Mutex<HashMap<String, Weak<Client>>>,
}

impl Node {
    pub fn new(
        ice: Vec<String>,
        rpc: &str,
        lottery: String,
        negotiator: Arc<dyn Negotiator>,
        egress: Arc<dyn Egress>,
    ) -> Result<Self> {
        Ok(Self {
            ice,
            locator: Locator::parse(rpc)?,
            lottery,
            negotiator,
            egress,
            clients: Mutex::new(HashMap::new()),
        })
    }

    /// Find or create the signalling session for a peer fingerprint.
    ///
    /// The cache holds weak handles: while any signalling is in flight the
    /// caller's strong handle keeps the entry upgradable, and once the last
    /// caller drops it the entry lapses.
    pub fn find(&self, fingerprint: &str) -> Arc<Client> {
        let mut clients = self.clients.lock().unwrap();
        if let Some(client) = clients.get(fingerprint).and_then(Weak::upgrade) {
            return client;
        }
        let client = Arc::new(Client::new(
            fingerprint,
            self.locator.clone(),
            self.lottery.clone(),
            Arc::clone(&self.negotiator),
            Translator::new(Arc::clone(&self.egress)),
        ));
        clients.insert(fingerprint.to_string(), Arc::downgrade(&client));
        client
    }

    /// Handle one signalling request.
    async fn handle(
        self: Arc<Self>,
        path: Arc<String>,
        request: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        if request.method() == Method::POST && request.uri().path() == path.as_str() {
            return Ok(match self.respond(request).await {
                Ok(answer) => Response::builder()
                    .status(StatusCode::OK)
                    .header(hyper::header::CONTENT_TYPE, "text/plain")
                    .body(Full::new(Bytes::from(answer)))
                    .unwrap(),
                Err(error) => {
                    debug!("signalling failed: {}", error);
                    Response::builder()
                        .status(StatusCode::NOT_FOUND)
                        .body(Full::new(Bytes::new()))
                        .unwrap()
                }
            });
        }
        Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::new()))
            .unwrap())
    }

    async fn respond(&self, request: Request<hyper::body::Incoming>) -> Result<String> {
        let body = request
            .into_body()
            .collect()
            .await
            .map_err(|error| Error::Signalling(error.to_string()))?
            .to_bytes();
        let offer = String::from_utf8(body.to_vec())
            .map_err(|_| Error::Signalling("offer is not utf-8".into()))?;

        let fingerprint = fingerprint(&offer)?;
        let client = self.find(&fingerprint);
        let answer = client.respond(&offer, &self.ice).await?;

        info!("answered {} ({} bytes)", fingerprint, answer.len());
        Ok(answer)
    }

    /// Run the signalling endpoint until the process exits.
    pub async fn run(self: Arc<Self>, port: u16, path: String, tls: TlsIdentity) -> Result<()> {
        let acceptor = tls_acceptor(&tls)?;
        let path = Arc::new(path);

        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!("signalling on 0.0.0.0:{}{}", port, path);

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    warn!("accept failed: {}", error);
                    continue;
                }
            };

            let acceptor = acceptor.clone();
            let node = Arc::clone(&self);
            let path = Arc::clone(&path);
            tokio::spawn(async move {
                let stream = match acceptor.accept(stream).await {
                    Ok(stream) => stream,
                    Err(error) => {
                        debug!("tls handshake with {} failed: {}", peer, error);
                        return;
                    }
                };
                let service = service_fn(move |request| {
                    Arc::clone(&node).handle(Arc::clone(&path), request)
                });
                if let Err(error) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!("connection with {} failed: {}", peer, error);
                }
            });
        }
    }
}

/// Derive the peer identity from the DTLS fingerprint attribute of an SDP
/// offer.
pub fn fingerprint(offer: &str) -> Result<String> {
    offer
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("a=fingerprint:"))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| Error::Signalling("offer carries no fingerprint".into()))
}

fn tls_acceptor(tls: &TlsIdentity) -> Result<TlsAcceptor> {
    let chain = rustls_pemfile::certs(&mut Cursor::new(tls.chain.as_bytes()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|error| Error::Config(format!("bad certificate chain: {}", error)))?;
    if chain.is_empty() {
        return Err(Error::Config("certificate chain is empty".into()));
    }

    let key = rustls_pemfile::read_all(&mut Cursor::new(tls.key.as_bytes()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|error| Error::Config(format!("bad private key: {}", error)))?
        .into_iter()
        .find_map(|item| match item {
            rustls_pemfile::Item::Pkcs8Key(key) => Some(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Pkcs1Key(key) => Some(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Sec1Key(key) => Some(PrivateKeyDer::Sec1(key)),
            _ => None,
        })
        .ok_or_else(|| Error::Config("no private key found".into()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|error| Error::Config(format!("tls configuration failed: {}", error)))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct EchoNegotiator;

    #[async_trait]
    impl Negotiator for EchoNegotiator {
        async fn respond(&self, offer: &str, ice: &[String]) -> Result<String> {
            Ok(format!("answer-to:{}:{}", offer.len(), ice.len()))
        }
    }

    struct FailingNegotiator;

    #[async_trait]
    impl Negotiator for FailingNegotiator {
        async fn respond(&self, _offer: &str, _ice: &[String]) -> Result<String> {
            Err(Error::Signalling("negotiation refused".into()))
        }
    }

    fn node(negotiator: Arc<dyn Negotiator>) -> Arc<Node> {
        Arc::new(
            Node::new(
                vec!["stun:stun.l.google.com:19302".to_string()],
                "http://127.0.0.1:8545/",
                String::new(),
                negotiator,
                Arc::new(egress::Drain::new()),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_find_reuses_live_clients() {
        let node = node(Arc::new(EchoNegotiator));
        let first = node.find("ab:cd");
        let second = node.find("ab:cd");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.fingerprint(), "ab:cd");

        let other = node.find("ef:01");
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn test_find_lapses_without_holders() {
        let node = node(Arc::new(EchoNegotiator));
        let first = node.find("ab:cd");
        let pointer = Arc::as_ptr(&first);
        drop(first);

        // The weak entry no longer upgrades, so a new client is built.
        let second = node.find("ab:cd");
        assert!(!std::ptr::eq(pointer, Arc::as_ptr(&second)));
    }

    #[tokio::test]
    async fn test_concurrent_find_single_client() {
        let node = node(Arc::new(EchoNegotiator));
        let clients = tokio::join!(
            {
                let node = Arc::clone(&node);
                async move { node.find("abc") }
            },
            {
                let node = Arc::clone(&node);
                async move { node.find("abc") }
            }
        );
        assert!(Arc::ptr_eq(&clients.0, &clients.1));
    }

    #[tokio::test]
    async fn test_client_respond() {
        let node = node(Arc::new(EchoNegotiator));
        let client = node.find("ab:cd");
        let answer = client
            .respond("v=0", &["stun:example".to_string()])
            .await
            .unwrap();
        assert_eq!(answer, "answer-to:3:1");
    }

    #[tokio::test]
    async fn test_failed_negotiation_surfaces() {
        let node = node(Arc::new(FailingNegotiator));
        let client = node.find("ab:cd");
        assert!(client.respond("v=0", &[]).await.is_err());
    }

    #[test]
    fn test_fingerprint_parse() {
        let offer = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n\
                     a=fingerprint:sha-256 AB:CD:EF:01\r\na=setup:actpass\r\n";
        assert_eq!(fingerprint(offer).unwrap(), "sha-256 AB:CD:EF:01");
    }

    #[test]
    fn test_fingerprint_missing() {
        assert!(fingerprint("v=0\r\na=setup:actpass\r\n").is_err());
        assert!(fingerprint("a=fingerprint:\r\n").is_err());
    }
}
