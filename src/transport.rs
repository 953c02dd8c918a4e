use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Request, Uri};
use http_body_util::BodyExt;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::RootCertStore;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tower::Service;

use crate::error::{BoxError, Error};
use crate::{OutboundRequest, OutboundResponse};

pub type Body = http_body_util::combinators::BoxBody<Bytes, BoxError>;

pub(crate) type UpstreamClient = hyper_util::client::legacy::Client<UpstreamConnector, Body>;

pub fn full_body(data: impl Into<Bytes>) -> Body {
    http_body_util::Full::new(data.into())
        .map_err(|e| match e {})
        .boxed()
}

pub fn empty_body() -> Body {
    http_body_util::Empty::new().map_err(|e| match e {}).boxed()
}

/// Upstream connection: plain TCP for `http`, rustls TLS for `https`.
/// Reports ALPN negotiation to hyper-util's pool so h2 upstreams multiplex.
pub(crate) enum UpstreamStream {
    Plain(TcpStream),
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

impl Connection for UpstreamStream {
    fn connected(&self) -> Connected {
        match self {
            UpstreamStream::Plain(_) => Connected::new(),
            UpstreamStream::Tls(tls) => {
                let mut connected = Connected::new();
                if tls.get_ref().1.alpn_protocol() == Some(b"h2") {
                    connected = connected.negotiated_h2();
                }
                connected
            }
        }
    }
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Connector that dispatches on the request scheme.
#[derive(Clone)]
pub(crate) struct UpstreamConnector {
    tls: TlsConnector,
}

impl UpstreamConnector {
    fn new() -> Self {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Self {
            tls: TlsConnector::from(Arc::new(config)),
        }
    }
}

impl Service<Uri> for UpstreamConnector {
    type Response = TokioIo<UpstreamStream>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let tls = self.tls.clone();
        Box::pin(async move {
            let host = uri.host().ok_or("missing host in URI")?;
            let use_tls = uri.scheme_str() == Some("https");
            let port = uri.port_u16().unwrap_or(if use_tls { 443 } else { 80 });
            let tcp = TcpStream::connect((host, port)).await?;
            if use_tls {
                let server_name: ServerName<'static> = host.to_string().try_into()?;
                let tls_stream = tls.connect(server_name, tcp).await?;
                Ok(TokioIo::new(UpstreamStream::Tls(tls_stream)))
            } else {
                Ok(TokioIo::new(UpstreamStream::Plain(tcp)))
            }
        })
    }
}

/// One-shot HTTP exchange under a hard deadline.
///
/// The deadline covers connect, request write, and the full body read. When
/// it elapses, the in-flight exchange is cancelled by dropping its future
/// and the caller sees `RequestTimeout`; other transport errors surface
/// unmodified.
pub(crate) struct Transport {
    client: UpstreamClient,
}

impl Transport {
    pub(crate) fn new() -> Self {
        let client = hyper_util::client::legacy::Client::builder(TokioExecutor::new())
            .build(UpstreamConnector::new());
        Self { client }
    }

    pub(crate) async fn send(
        &self,
        request: &OutboundRequest,
        deadline: Duration,
    ) -> Result<OutboundResponse, Error> {
        let mut builder = Request::builder()
            .method(request.method.clone())
            .uri(request.url.clone());
        if let Some(headers) = builder.headers_mut() {
            headers.extend(request.headers.clone());
        }
        let body = match &request.body {
            Some(bytes) => full_body(bytes.clone()),
            None => empty_body(),
        };
        let req = builder
            .body(body)
            .map_err(|e| Error::Transport(Box::new(e)))?;

        let exchange = async {
            let resp = self
                .client
                .request(req)
                .await
                .map_err(|e| Error::Transport(Box::new(e)))?;
            let (parts, body) = resp.into_parts();
            let bytes = body
                .collect()
                .await
                .map_err(|e| Error::Transport(Box::new(e)))?
                .to_bytes();
            Ok(OutboundResponse {
                status: parts.status,
                headers: normalize_headers(&parts.headers),
                body: bytes,
            })
        };

        match tokio::time::timeout(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => Err(Error::RequestTimeout { deadline }),
        }
    }
}

/// Flatten response headers into lowercase string keys; repeated headers
/// are joined with `", "`.
fn normalize_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out: HashMap<String, String> = HashMap::with_capacity(headers.keys_len());
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    out
}
