//! Domain-aware reverse proxy for venture code-server workspaces.
//!
//! One listener fronts every venture domain. Plain requests are classified
//! (editor asset, login redirect, locally served theme stylesheet) and
//! forwarded to the backend the route table picks for the Host header; the
//! login page gets a per-venture stylesheet spliced in on the way back.
//! WebSocket upgrades bypass classification and are tunneled byte-for-byte
//! with the Origin header pinned to the backend. The `/downloads` subtree is
//! routed to per-venture installer backends without any redirect gate.

pub mod routes;

use std::convert::Infallible;
use std::future::Future;
use std::io::{self, Cursor, Read};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use brotli::Decompressor;
use bytes::Bytes;
use chrono::Utc;
use flate2::read::{GzDecoder, ZlibDecoder};
use futures_util::future;
use http::header::{
    CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST, LOCATION, ORIGIN, UPGRADE,
};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode, Uri, Version};
use http_body_util::{BodyExt, Empty, Full, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde_json::json;
use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use zstd::stream::read::Decoder as ZstdDecoder;

use crate::routes::{DownloadTable, RouteTable};

type BoxBody =
    http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;
type HttpClient = Client<HttpConnector, BoxBody>;

const SERVICE_NAME: &str = "vsc-proxy-gateway";
const THEME_PATH_PREFIX: &str = "/login-themes/";
const DOWNLOADS_PATH_PREFIX: &str = "/downloads/";
/// Upper bound on buffering a login page for stylesheet injection.
const MAX_REWRITE_BODY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    /// Default backend authority, shared by every route without its own target.
    pub backend: String,
    pub routes: RouteTable,
    pub downloads: DownloadTable,
    /// Directory holding the stylesheets served under `/login-themes/`.
    pub theme_dir: PathBuf,
}

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

struct ProxyState {
    client: HttpClient,
    backend: String,
    routes: RouteTable,
    downloads: DownloadTable,
    theme_dir: PathBuf,
}

/// Binds the listener and spawns the accept loop. Returns the actual bound
/// address so callers can discover OS-assigned ports, and a handle that
/// completes once `shutdown` resolves and the loop exits.
pub fn spawn_proxy<S>(
    cfg: ProxyConfig,
    mut shutdown: S,
) -> Result<(SocketAddr, JoinHandle<()>), ProxyError>
where
    S: Future<Output = ()> + Send + 'static + Unpin,
{
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(Duration::from_secs(5)));
    let client: HttpClient = Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(8)
        .build(connector);

    let std_listener = StdTcpListener::bind(cfg.listen)?;
    std_listener.set_nonblocking(true)?;
    let listen_addr = std_listener.local_addr()?;
    let listener = TcpListener::from_std(std_listener)?;

    let state = Arc::new(ProxyState {
        client,
        backend: routes::normalize_target(&cfg.backend),
        routes: cfg.routes,
        downloads: cfg.downloads,
        theme_dir: cfg.theme_dir,
    });

    let handle = tokio::spawn(async move {
        info!("proxy listening on {}", listen_addr);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, remote_addr)) => {
                            let state = state.clone();
                            tokio::spawn(async move {
                                if let Err(err) = serve_client_stream(stream, remote_addr, state).await {
                                    error!(%err, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(%e, "accept error");
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("shutting down proxy");
                    break;
                }
            }
        }
    });

    Ok((listen_addr, handle))
}

async fn serve_client_stream(
    stream: TcpStream,
    remote_addr: SocketAddr,
    state: Arc<ProxyState>,
) -> Result<(), BoxError> {
    let io = TokioIo::new(stream);
    let svc_state = state.clone();
    let service = service_fn(move |req| handle(svc_state.clone(), remote_addr, req));

    let mut builder = http1::Builder::new();
    builder
        .keep_alive(true)
        .preserve_header_case(true)
        .title_case_headers(true);
    builder.serve_connection(io, service).with_upgrades().await?;
    Ok(())
}

async fn handle(
    state: Arc<ProxyState>,
    remote_addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, Infallible> {
    // Upgrades skip classification entirely; the editor reconnects through
    // whatever path it was on when the socket opened.
    if is_upgrade_request(&req) {
        return Ok(match handle_upgrade(state, remote_addr, req).await {
            Ok(resp) => resp,
            Err(resp) => resp,
        });
    }

    if req.uri().path() == "/health" {
        return Ok(health_response());
    }

    if req.uri().path().starts_with(DOWNLOADS_PATH_PREFIX) {
        return Ok(handle_download(state, remote_addr, req).await);
    }

    match classify(req.uri()) {
        RequestClass::LocalAsset(name) => Ok(serve_theme_asset(&state, &name).await),
        RequestClass::RedirectWithFolder => {
            let host = host_header(req.headers());
            let route = state.routes.resolve(&host);
            info!(%host, workspace = %route.workspace_folder, "redirecting to workspace folder");
            Ok(redirect_with_folder(&host, req.uri(), &route.workspace_folder))
        }
        RequestClass::Passthrough => Ok(match handle_http(state, remote_addr, req).await {
            Ok(resp) => resp,
            Err(resp) => resp,
        }),
    }
}

#[derive(Debug)]
enum RequestClass {
    Passthrough,
    RedirectWithFolder,
    LocalAsset(String),
}

fn classify(uri: &Uri) -> RequestClass {
    let path = uri.path();

    if let Some(name) = path.strip_prefix(THEME_PATH_PREFIX) {
        if !name.is_empty() && !name.contains('/') && name != ".." {
            return RequestClass::LocalAsset(name.to_string());
        }
    }

    // Editor assets must reach the backend untouched, even when other rules
    // would redirect.
    if is_static_asset_path(path) {
        return RequestClass::Passthrough;
    }

    if has_folder_param(uri) {
        return RequestClass::Passthrough;
    }

    if path != "/" && !path.starts_with("/login") {
        return RequestClass::Passthrough;
    }

    RequestClass::RedirectWithFolder
}

fn is_static_asset_path(path: &str) -> bool {
    path.starts_with("/_static/")
        || path.starts_with("/static/")
        || path.starts_with("/stable-")
        || path.contains(".js")
        || path.contains(".css")
        || path.contains(".ico")
        || path.contains(".svg")
        || path.contains(".json")
}

fn has_folder_param(uri: &Uri) -> bool {
    uri.query()
        .map(|q| {
            q.split('&')
                .any(|kv| kv == "folder" || kv.starts_with("folder="))
        })
        .unwrap_or(false)
}

fn redirect_with_folder(host: &str, uri: &Uri, folder: &str) -> Response<BoxBody> {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let separator = if uri.query().is_some() { '&' } else { '?' };
    let location = format!(
        "http://{}{}{}folder={}",
        host,
        path_and_query,
        separator,
        urlencoding::encode(folder)
    );

    Response::builder()
        .status(StatusCode::FOUND)
        .header(LOCATION, location)
        .body(empty_body())
        .unwrap()
}

async fn handle_http(
    state: Arc<ProxyState>,
    remote_addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, Response<BoxBody>> {
    let host = host_header(req.headers());
    let route = state.routes.resolve(&host);
    let authority = route
        .target
        .clone()
        .unwrap_or_else(|| state.backend.clone());
    let wants_theme = req.uri().path() == "/" && route.login_theme.is_some();

    let (mut parts, incoming) = req.into_parts();
    parts.uri = build_upstream_uri(&authority, &parts.uri)?;
    parts.version = Version::HTTP_11;

    let mut new_req = Request::from_parts(parts, incoming_to_box(incoming));
    strip_hop_by_hop_headers(new_req.headers_mut());
    set_forwarding_headers(new_req.headers_mut(), &authority, &host, remote_addr);
    if route.target.is_some() {
        // Venture context for per-venture backends.
        if let Ok(value) = HeaderValue::from_str(route.venture_name()) {
            new_req.headers_mut().insert("x-venture-name", value);
        }
        if let Ok(value) = HeaderValue::from_str(&route.domain) {
            new_req.headers_mut().insert("x-venture-domain", value);
        }
    }

    info!(
        client = %remote_addr,
        method = %new_req.method(),
        path = %new_req.uri().path(),
        upstream = %authority,
        "proxy http"
    );

    let upstream_resp = state.client.request(new_req).await.map_err(|e| {
        error!(%e, upstream = %authority, "backend request error");
        text_response(StatusCode::INTERNAL_SERVER_ERROR, "Code-server proxy error")
    })?;

    if wants_theme && is_rewrite_candidate(&upstream_resp) {
        let theme = route.login_theme.as_deref().unwrap_or_default();
        return Ok(rewrite_login_response(upstream_resp, theme).await);
    }

    Ok(relay_response(upstream_resp))
}

/// Streams an upstream response back to the client unmodified apart from
/// hop-by-hop headers.
fn relay_response(upstream: Response<Incoming>) -> Response<BoxBody> {
    let (mut parts, body) = upstream.into_parts();
    strip_hop_by_hop_headers(&mut parts.headers);
    Response::from_parts(parts, incoming_to_box(body))
}

fn is_rewrite_candidate(resp: &Response<Incoming>) -> bool {
    resp.status() == StatusCode::OK
        && resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("text/html"))
            .unwrap_or(false)
}

/// Buffers the backend's login page, splices the venture stylesheet in
/// before `</head>`, and re-emits it with a corrected Content-Length. The
/// buffer is per-request and bounded; a page over the cap is refused rather
/// than half-written.
async fn rewrite_login_response(upstream: Response<Incoming>, theme: &str) -> Response<BoxBody> {
    let (parts, body) = upstream.into_parts();

    let buffered = match Limited::new(body, MAX_REWRITE_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            warn!(%err, "failed to buffer login page for rewrite");
            return text_response(StatusCode::BAD_GATEWAY, "login page too large to rewrite");
        }
    };

    let encoding = parts
        .headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let decoded = match decode_body_with_encoding(buffered.as_ref(), encoding.as_deref()) {
        Ok(decoded) => decoded,
        Err(err) => {
            warn!(%err, "failed to decode login page body; relaying unmodified");
            return relay_buffered(parts, buffered);
        }
    };

    let injected = match inject_login_theme(&decoded, theme) {
        Some(injected) => injected,
        // No </head> marker: the client gets the exact bytes the backend
        // produced.
        None => return relay_buffered(parts, buffered),
    };

    let mut headers = sanitize_payload_headers(&parts.headers);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(injected.len()));

    let mut response = Response::new(full_body(injected));
    *response.status_mut() = parts.status;
    *response.version_mut() = parts.version;
    *response.headers_mut() = headers;
    response
}

/// Re-emits an already-buffered upstream body unchanged, restating the
/// length since the stream was consumed.
fn relay_buffered(mut parts: http::response::Parts, body: Bytes) -> Response<BoxBody> {
    strip_hop_by_hop_headers(&mut parts.headers);
    parts
        .headers
        .insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    Response::from_parts(parts, full_body(body))
}

/// Splices a stylesheet link immediately before the first `</head>`.
/// Returns None when the marker is absent.
fn inject_login_theme(body: &[u8], theme: &str) -> Option<Vec<u8>> {
    const MARKER: &[u8] = b"</head>";
    let idx = body.windows(MARKER.len()).position(|w| w == MARKER)?;
    let link = format!(
        "<link rel=\"stylesheet\" href=\"/login-themes/{}\">\n",
        theme
    );

    let mut out = Vec::with_capacity(body.len() + link.len());
    out.extend_from_slice(&body[..idx]);
    out.extend_from_slice(link.as_bytes());
    out.extend_from_slice(&body[idx..]);
    Some(out)
}

fn decode_body_with_encoding(bytes: &[u8], encoding: Option<&str>) -> io::Result<Vec<u8>> {
    match encoding.map(|enc| enc.trim().to_ascii_lowercase()) {
        None => Ok(bytes.to_vec()),
        Some(enc) => match enc.as_str() {
            "" | "identity" => Ok(bytes.to_vec()),
            "gzip" => {
                let mut decoder = GzDecoder::new(Cursor::new(bytes));
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
            "deflate" => {
                let mut decoder = ZlibDecoder::new(Cursor::new(bytes));
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
            "br" => {
                let mut decoder = Decompressor::new(Cursor::new(bytes), 4096);
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
            "zstd" => {
                let mut decoder = ZstdDecoder::new(Cursor::new(bytes))?;
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported content-encoding: {}", other),
            )),
        },
    }
}

/// Headers describing the payload we are about to replace, plus hop-by-hop
/// headers, are dropped before the rewritten response goes out.
fn sanitize_payload_headers(headers: &HeaderMap) -> HeaderMap {
    const PAYLOAD_HEADERS: &[&str] = &[
        "content-length",
        "content-encoding",
        "transfer-encoding",
        "content-md5",
        "content-digest",
        "etag",
    ];

    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if PAYLOAD_HEADERS.contains(&name.as_str()) {
            continue;
        }
        out.insert(name.clone(), value.clone());
    }
    strip_hop_by_hop_headers(&mut out);
    out
}

async fn handle_upgrade(
    state: Arc<ProxyState>,
    remote_addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, Response<BoxBody>> {
    let host = host_header(req.headers());
    let route = state.routes.resolve(&host);
    let authority = route
        .target
        .clone()
        .unwrap_or_else(|| state.backend.clone());
    let upstream_uri = build_upstream_uri(&authority, req.uri())?;

    let mut proxied_req_builder = Request::builder()
        .method(req.method())
        .uri(upstream_uri)
        .version(req.version());

    // Forward the client's headers wholesale: Cookie keeps the editor
    // session alive and Sec-WebSocket-* carries the handshake.
    for (name, value) in req.headers().iter() {
        proxied_req_builder = proxied_req_builder.header(name, value);
    }

    let (parts, incoming) = req.into_parts();
    let mut proxied_req = proxied_req_builder
        .body(incoming_to_box(incoming))
        .map_err(|_| {
            text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to build upgrade request",
            )
        })?;

    // The backend validates Origin against its own address, so the client's
    // Origin must not reach it. Host follows for the same reason.
    if let Ok(value) = HeaderValue::from_str(&format!("http://{}", authority)) {
        proxied_req.headers_mut().insert(ORIGIN, value);
    }
    if let Ok(value) = HeaderValue::from_str(&authority) {
        proxied_req.headers_mut().insert(HOST, value);
    }
    // Connection/Upgrade stay; the backend needs them for the handshake.
    proxied_req.headers_mut().remove("proxy-connection");
    proxied_req.headers_mut().remove("keep-alive");
    proxied_req.headers_mut().remove("te");
    proxied_req.headers_mut().remove("transfer-encoding");
    proxied_req.headers_mut().remove("trailers");

    info!(client = %remote_addr, %host, upstream = %authority, "proxy websocket upgrade");

    let upstream_resp = state.client.request(proxied_req).await.map_err(|e| {
        error!(%e, upstream = %authority, "backend upgrade error");
        text_response(StatusCode::INTERNAL_SERVER_ERROR, "Code-server proxy error")
    })?;

    if upstream_resp.status() != StatusCode::SWITCHING_PROTOCOLS {
        // Relay the backend's refusal (probably 4xx/5xx) as-is.
        return Ok(relay_response(upstream_resp));
    }

    let mut client_resp_builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    let out_headers = client_resp_builder
        .headers_mut()
        .expect("headers_mut available");
    for (name, value) in upstream_resp.headers().iter() {
        out_headers.insert(name, value.clone());
    }
    out_headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));

    let client_resp = client_resp_builder.body(empty_body()).map_err(|_| {
        text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to build upgrade response",
        )
    })?;

    let original_req = Request::from_parts(parts, ());

    // Tunnel once the 101 has gone back to the client. A dropped tunnel is
    // terminal; the editor re-initiates on its own.
    tokio::spawn(async move {
        match future::try_join(
            hyper::upgrade::on(original_req),
            hyper::upgrade::on(upstream_resp),
        )
        .await
        {
            Ok((client_upgraded, upstream_upgraded)) => {
                let mut client_io = TokioIo::new(client_upgraded);
                let mut upstream_io = TokioIo::new(upstream_upgraded);
                if let Err(e) = copy_bidirectional(&mut client_io, &mut upstream_io).await {
                    warn!(%e, "websocket tunnel error");
                }
                let _ = client_io.shutdown().await;
                let _ = upstream_io.shutdown().await;
            }
            Err(e) => {
                warn!("websocket upgrade error: {:?}", e);
            }
        }
    });

    Ok(client_resp)
}

/// `/downloads/<venture>/<file>`: picked apart by the first path segment and
/// sent to that venture's installer backend. No redirect, no login gate.
async fn handle_download(
    state: Arc<ProxyState>,
    remote_addr: SocketAddr,
    req: Request<Incoming>,
) -> Response<BoxBody> {
    let venture = req.uri().path()[DOWNLOADS_PATH_PREFIX.len()..]
        .split('/')
        .next()
        .unwrap_or("")
        .to_string();
    let authority = state
        .downloads
        .resolve(&venture)
        .unwrap_or(state.backend.as_str())
        .to_string();

    let host = host_header(req.headers());
    let (mut parts, incoming) = req.into_parts();
    parts.uri = match build_upstream_uri(&authority, &parts.uri) {
        Ok(uri) => uri,
        Err(resp) => return resp,
    };
    parts.version = Version::HTTP_11;

    let mut new_req = Request::from_parts(parts, incoming_to_box(incoming));
    strip_hop_by_hop_headers(new_req.headers_mut());
    set_forwarding_headers(new_req.headers_mut(), &authority, &host, remote_addr);

    info!(client = %remote_addr, venture = %venture, upstream = %authority, "proxy download");

    match state.client.request(new_req).await {
        Ok(resp) => relay_response(resp),
        Err(err) => {
            error!(%err, venture = %venture, upstream = %authority, "download backend error");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "error": "download backend unreachable",
                    "venture": venture,
                    "timestamp": Utc::now().to_rfc3339(),
                }),
            )
        }
    }
}

async fn serve_theme_asset(state: &ProxyState, name: &str) -> Response<BoxBody> {
    let path = state.theme_dir.join(name);
    match tokio::fs::read(&path).await {
        Ok(contents) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/css; charset=utf-8")
            .header(CONTENT_LENGTH, contents.len())
            .body(full_body(contents))
            .unwrap(),
        Err(err) => {
            warn!(%err, theme = name, "login theme asset not found");
            text_response(StatusCode::NOT_FOUND, "theme not found")
        }
    }
}

fn health_response() -> Response<BoxBody> {
    json_response(
        StatusCode::OK,
        json!({
            "status": "healthy",
            "service": SERVICE_NAME,
            "timestamp": Utc::now().to_rfc3339(),
        }),
    )
}

fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let has_conn_upgrade = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    has_conn_upgrade && req.headers().contains_key(UPGRADE)
}

fn strip_hop_by_hop_headers(h: &mut HeaderMap) {
    // Standard hop-by-hop headers per RFC 7230
    const HOP_HEADERS: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailers",
        "transfer-encoding",
        "upgrade",
        "proxy-connection",
    ];

    // Also remove headers listed in Connection: <header-names>
    if let Some(conn_val) = h
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
    {
        for token in conn_val.split(',') {
            let name = token.trim().to_ascii_lowercase();
            if !name.is_empty() {
                h.remove(&name);
            }
        }
    }

    for name in HOP_HEADERS {
        h.remove(*name);
    }
}

fn set_forwarding_headers(
    headers: &mut HeaderMap,
    authority: &str,
    original_host: &str,
    remote_addr: SocketAddr,
) {
    if let Ok(value) = HeaderValue::from_str(authority) {
        headers.insert(HOST, value);
    }

    let client_ip = remote_addr.ip().to_string();
    let forwarded_for = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{}, {}", existing, client_ip),
        None => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
    if !original_host.is_empty() {
        if let Ok(value) = HeaderValue::from_str(original_host) {
            headers.insert("x-forwarded-host", value);
        }
    }
}

#[allow(clippy::result_large_err)]
fn build_upstream_uri(authority: &str, orig: &Uri) -> Result<Uri, Response<BoxBody>> {
    let path_and_query = orig.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let uri_str = format!("http://{}{}", authority, path_and_query);
    Uri::from_str(&uri_str).map_err(|_| {
        text_response(StatusCode::INTERNAL_SERVER_ERROR, "invalid upstream uri")
    })
}

fn host_header(headers: &HeaderMap) -> String {
    headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .trim()
        .to_string()
}

fn empty_body() -> BoxBody {
    Empty::<Bytes>::new()
        .map_err(|never: Infallible| match never {})
        .boxed()
}

fn full_body(b: impl Into<Bytes>) -> BoxBody {
    Full::new(b.into())
        .map_err(|never: Infallible| match never {})
        .boxed()
}

fn incoming_to_box(b: Incoming) -> BoxBody {
    b.map_err(|e| -> BoxError { Box::new(e) }).boxed()
}

fn text_response(status: StatusCode, msg: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(msg.to_string()))
        .unwrap()
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(value.to_string()))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_static_assets_as_passthrough() {
        for path in [
            "/out/vs/loader.js",
            "/style.css",
            "/favicon.ico",
            "/logo.svg",
            "/manifest.json",
            "/_static/src/browser/pages/login.html",
            "/static/out/vs/workbench/workbench.web.main.js",
            "/stable-abc123/static/media/code.svg",
        ] {
            let uri: Uri = format!("http://mezzpro.xyz{}", path).parse().unwrap();
            assert!(
                matches!(classify(&uri), RequestClass::Passthrough),
                "expected passthrough for {}",
                path
            );
        }
    }

    #[test]
    fn root_without_folder_redirects() {
        let uri: Uri = "http://mezzpro.xyz/".parse().unwrap();
        assert!(matches!(classify(&uri), RequestClass::RedirectWithFolder));
    }

    #[test]
    fn login_paths_redirect_without_folder() {
        for uri in ["http://mezzpro.xyz/login", "http://mezzpro.xyz/login?next=x"] {
            let uri: Uri = uri.parse().unwrap();
            assert!(matches!(classify(&uri), RequestClass::RedirectWithFolder));
        }
    }

    #[test]
    fn folder_param_short_circuits_redirect() {
        let uri: Uri = "http://mezzpro.xyz/?folder=%2Fhome%2Fcoder%2Fworkspace-mezzpro"
            .parse()
            .unwrap();
        assert!(matches!(classify(&uri), RequestClass::Passthrough));
    }

    #[test]
    fn non_root_paths_pass_through() {
        let uri: Uri = "http://mezzpro.xyz/api/session".parse().unwrap();
        assert!(matches!(classify(&uri), RequestClass::Passthrough));
    }

    #[test]
    fn theme_requests_are_local_assets() {
        let uri: Uri = "http://mezzpro.xyz/login-themes/mezzpro-login.css"
            .parse()
            .unwrap();
        match classify(&uri) {
            RequestClass::LocalAsset(name) => assert_eq!(name, "mezzpro-login.css"),
            other => panic!("unexpected class: {:?}", other),
        }
    }

    #[test]
    fn theme_traversal_is_not_served_locally() {
        let uri: Uri = "http://mezzpro.xyz/login-themes/../token".parse().unwrap();
        assert!(!matches!(classify(&uri), RequestClass::LocalAsset(_)));
    }

    #[test]
    fn detects_folder_query_parameter() {
        let with: Uri = "http://h/?folder=%2Fws".parse().unwrap();
        assert!(has_folder_param(&with));
        let bare: Uri = "http://h/?folder".parse().unwrap();
        assert!(has_folder_param(&bare));
        let other: Uri = "http://h/?folderish=1".parse().unwrap();
        assert!(!has_folder_param(&other));
        let none: Uri = "http://h/".parse().unwrap();
        assert!(!has_folder_param(&none));
    }

    #[test]
    fn redirect_location_carries_encoded_folder() {
        let uri: Uri = "http://mezzpro.xyz/".parse().unwrap();
        let resp = redirect_with_folder("mezzpro.xyz", &uri, "/home/coder/workspace-mezzpro");
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(
            resp.headers().get(LOCATION).unwrap().to_str().unwrap(),
            "http://mezzpro.xyz/?folder=%2Fhome%2Fcoder%2Fworkspace-mezzpro"
        );
    }

    #[test]
    fn redirect_preserves_existing_query() {
        let uri: Uri = "http://mezzpro.xyz/login?next=1".parse().unwrap();
        let resp = redirect_with_folder("mezzpro.xyz", &uri, "/ws");
        assert_eq!(
            resp.headers().get(LOCATION).unwrap().to_str().unwrap(),
            "http://mezzpro.xyz/login?next=1&folder=%2Fws"
        );
    }

    #[test]
    fn injects_stylesheet_before_head_close() {
        let body = b"<html><head><title>t</title></head><body/></html>";
        let out = inject_login_theme(body, "mezzpro-login.css").unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "<html><head><title>t</title><link rel=\"stylesheet\" href=\"/login-themes/mezzpro-login.css\">\n</head><body/></html>"
        );
    }

    #[test]
    fn injects_exactly_once_at_first_marker() {
        let body = b"<head></head><head></head>";
        let out = inject_login_theme(body, "a.css").unwrap();
        let links = out.windows(5).filter(|w| w == b"<link").count();
        assert_eq!(links, 1);
        assert!(out.starts_with(b"<head><link"));
    }

    #[test]
    fn missing_marker_yields_none() {
        assert!(inject_login_theme(b"<html><body>no head</body></html>", "a.css").is_none());
    }

    #[test]
    fn decodes_identity_and_none_encodings() {
        let payload = b"hello world";
        assert_eq!(decode_body_with_encoding(payload, None).unwrap(), payload);
        assert_eq!(
            decode_body_with_encoding(payload, Some("identity")).unwrap(),
            payload
        );
        assert_eq!(
            decode_body_with_encoding(payload, Some("")).unwrap(),
            payload
        );
    }

    #[test]
    fn decodes_gzip_payloads() {
        use flate2::{write::GzEncoder, Compression};
        use std::io::Write;

        let payload = b"compressed content";
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        let compressed = encoder.finish().unwrap();

        let decoded = decode_body_with_encoding(&compressed, Some("gzip")).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn errors_on_unsupported_encoding() {
        let err = decode_body_with_encoding(b"noop", Some("unknown-enc")).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn strips_hop_by_hop_and_connection_named_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-custom"));
        headers.insert("x-custom", HeaderValue::from_static("1"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        strip_hop_by_hop_headers(&mut headers);
        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get("x-custom").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert!(headers.get("content-type").is_some());
    }

    #[test]
    fn sanitized_headers_drop_payload_metadata() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("100"));
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert("etag", HeaderValue::from_static("\"abc\""));
        headers.insert("set-cookie", HeaderValue::from_static("session=1"));
        let out = sanitize_payload_headers(&headers);
        assert!(out.get(CONTENT_LENGTH).is_none());
        assert!(out.get(CONTENT_ENCODING).is_none());
        assert!(out.get("etag").is_none());
        assert!(out.get("set-cookie").is_some());
    }
}
