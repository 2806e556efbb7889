//! HTTP/1.1 proxy front end
//!
//! Plain requests are rewritten to origin-form and forwarded over a fresh
//! tracked stream with a hyper client connection. CONNECT requests get a
//! `200 Connection Established` once the target is dialed, after which the
//! upgraded connection is spliced to the target.

use crate::error::DispatchError;
use crate::relay::FrontendContext;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::header::{self, HeaderValue};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioIo, TokioTimer};
use ssh2proxy_proto::{join_host_port, split_authority};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Request headers that only concern the proxy hop
const PROXY_HOP_HEADERS: &[&str] = &["proxy-connection", "proxy-authorization"];

pub struct HttpProxyServer {
    ctx: FrontendContext,
}

impl HttpProxyServer {
    pub fn new(ctx: FrontendContext) -> Self {
        Self { ctx }
    }

    /// Accept until the shutdown token fires
    pub async fn serve(self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!("HTTP proxy listening on {}", addr);
        }

        loop {
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!("New HTTP proxy connection from {}", peer_addr);
                        let ctx = self.ctx.clone();
                        self.ctx.tasks.spawn(serve_connection(ctx, stream, peer_addr));
                    }
                    Err(e) => {
                        error!("Failed to accept HTTP proxy connection: {}", e);
                    }
                },
            }
        }

        debug!("HTTP proxy listener stopped");
    }
}

async fn serve_connection(ctx: FrontendContext, stream: TcpStream, peer_addr: SocketAddr) {
    let service_ctx = ctx.clone();
    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = service_ctx.clone();
        async move { Ok::<_, Infallible>(handle_request(ctx, req).await) }
    });

    let mut builder = hyper::server::conn::http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(ctx.handshake_timeout)
        .preserve_header_case(true)
        .title_case_headers(true);

    let conn = builder
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = ctx.shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            tokio::select! {
                result = conn.as_mut() => result,
                _ = ctx.force_close.cancelled() => Ok(()),
            }
        }
    };

    if let Err(e) = result {
        ctx.log
            .failure(&format!("HTTP connection from {} ended with error", peer_addr), &e);
    }
}

async fn handle_request(ctx: FrontendContext, req: Request<Incoming>) -> Response<ProxyBody> {
    if !ctx.opener.has_capacity() {
        ctx.log.warn(format!(
            "Connection limit reached, rejecting {} {}",
            req.method(),
            req.uri()
        ));
        return text_response(StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached");
    }

    if req.method() == Method::CONNECT {
        handle_connect(ctx, req).await
    } else {
        forward(ctx, req).await
    }
}

/// Target of a proxied request: URI authority, else the Host header
fn request_target<B>(req: &Request<B>, default_port: u16) -> Option<(String, u16)> {
    let authority = match req.uri().authority() {
        Some(authority) => authority.as_str().to_string(),
        None => req
            .headers()
            .get(header::HOST)?
            .to_str()
            .ok()?
            .to_string(),
    };
    split_authority(&authority, default_port)
}

fn dispatch_failure(err: &DispatchError) -> Response<ProxyBody> {
    match err {
        DispatchError::Capacity { .. } => {
            text_response(StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached")
        }
        DispatchError::Protocol(message) => text_response(StatusCode::BAD_REQUEST, message),
        other => text_response(StatusCode::SERVICE_UNAVAILABLE, &other.to_string()),
    }
}

async fn handle_connect(ctx: FrontendContext, req: Request<Incoming>) -> Response<ProxyBody> {
    let Some((host, port)) = request_target(&req, 443) else {
        return text_response(StatusCode::BAD_REQUEST, "Invalid CONNECT target");
    };
    let address = join_host_port(&host, port);
    ctx.log.debug(format!("Handling HTTPS connection to {}", address));

    let upstream = match ctx.opener.open("tcp", &address).await {
        Ok(upstream) => upstream,
        Err(e) => return dispatch_failure(&e),
    };

    let relay_ctx = ctx.clone();
    ctx.tasks.spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let (up, down) = relay_ctx
                    .splice(TokioIo::new(upgraded), upstream, &address)
                    .wait()
                    .await;
                relay_ctx.log.debug(format!(
                    "HTTPS tunnel to {} closed ({} bytes up, {} bytes down)",
                    address, up, down
                ));
            }
            Err(e) => {
                // Dropping `upstream` releases its slot
                debug!("HTTP upgrade for {} failed: {}", address, e);
            }
        }
    });

    let mut response = Response::new(empty());
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    response
}

async fn forward(ctx: FrontendContext, req: Request<Incoming>) -> Response<ProxyBody> {
    let Some((host, port)) = request_target(&req, 80) else {
        return text_response(StatusCode::BAD_REQUEST, "Missing Host");
    };
    let address = join_host_port(&host, port);
    let method = req.method().clone();
    ctx.log.debug(format!("Handling HTTP request {} {}", method, req.uri()));

    let upstream = match ctx.opener.open("tcp", &address).await {
        Ok(upstream) => upstream,
        Err(e) => return dispatch_failure(&e),
    };

    let mut client = hyper::client::conn::http1::Builder::new();
    client.preserve_header_case(true).title_case_headers(true);
    let (mut sender, conn) = match client.handshake(TokioIo::new(upstream)).await {
        Ok(parts) => parts,
        Err(e) => {
            ctx.log.failure(&format!("HTTP handshake with {} failed", address), &e);
            return text_response(StatusCode::BAD_GATEWAY, "Upstream handshake failed");
        }
    };

    // Drives the upstream connection; the tracked stream closes with it
    let conn_ctx = ctx.clone();
    let conn_address = address.clone();
    ctx.tasks.spawn(async move {
        tokio::select! {
            result = conn => {
                if let Err(e) = result {
                    conn_ctx.log.failure(&format!("Upstream connection to {} failed", conn_address), &e);
                }
            }
            _ = conn_ctx.force_close.cancelled() => {}
        }
    });

    let request = origin_form(req, &host, port);
    match sender.send_request(request).await {
        Ok(response) => {
            debug!("{} {} -> {}", method, address, response.status());
            response.map(|body| body.boxed())
        }
        Err(e) => {
            ctx.log.failure(&format!("HTTP request to {} failed", address), &e);
            text_response(StatusCode::BAD_GATEWAY, "Upstream request failed")
        }
    }
}

/// Rewrite an absolute-form proxy request into what the origin expects
fn origin_form<B>(req: Request<B>, host: &str, port: u16) -> Request<B> {
    let (mut parts, body) = req.into_parts();

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    parts.uri = path.parse::<Uri>().unwrap_or_else(|_| Uri::from_static("/"));

    for name in PROXY_HOP_HEADERS {
        parts.headers.remove(*name);
    }

    if !parts.headers.contains_key(header::HOST) {
        let authority = match (port, host.contains(':')) {
            (80, true) => format!("[{}]", host),
            (80, false) => host.to_string(),
            _ => join_host_port(host, port),
        };
        if let Ok(value) = HeaderValue::from_str(&authority) {
            parts.headers.insert(header::HOST, value);
        }
    }

    Request::from_parts(parts, body)
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(
        Full::new(Bytes::from(format!("{}\n", message)))
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_target() {
        let req = Request::get("http://example.com/index.html").body(()).unwrap();
        assert_eq!(request_target(&req, 80), Some(("example.com".to_string(), 80)));

        let req = Request::builder()
            .method(Method::CONNECT)
            .uri("example.com:8443")
            .body(())
            .unwrap();
        assert_eq!(request_target(&req, 443), Some(("example.com".to_string(), 8443)));

        let req = Request::get("/path")
            .header(header::HOST, "10.0.0.5:8080")
            .body(())
            .unwrap();
        assert_eq!(request_target(&req, 80), Some(("10.0.0.5".to_string(), 8080)));

        let req = Request::get("/path").body(()).unwrap();
        assert_eq!(request_target(&req, 80), None);
    }

    #[test]
    fn test_origin_form_rewrite() {
        let req = Request::get("http://example.com/a/b?q=1")
            .header("proxy-connection", "keep-alive")
            .header("proxy-authorization", "Basic Zm9vOmJhcg==")
            .header("accept", "*/*")
            .body(())
            .unwrap();
        let req = origin_form(req, "example.com", 80);

        assert_eq!(req.uri(), "/a/b?q=1");
        assert!(req.headers().get("proxy-connection").is_none());
        assert!(req.headers().get("proxy-authorization").is_none());
        assert_eq!(req.headers()[header::HOST], "example.com");
        assert_eq!(req.headers()["accept"], "*/*");
    }

    #[test]
    fn test_origin_form_keeps_host_and_port() {
        let req = Request::get("http://example.com:8080").body(()).unwrap();
        let req = origin_form(req, "example.com", 8080);
        assert_eq!(req.uri(), "/");
        assert_eq!(req.headers()[header::HOST], "example.com:8080");

        let req = Request::get("http://[::1]:8080/x")
            .header(header::HOST, "original")
            .body(())
            .unwrap();
        let req = origin_form(req, "::1", 8080);
        assert_eq!(req.headers()[header::HOST], "original");
    }

    #[tokio::test]
    async fn test_text_response() {
        let response = text_response(StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Connection limit reached\n");
    }
}
