use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use http::HeaderName;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use crate::bufferpool::BufferPool;
use crate::dialer::resolve_dialer;
use crate::environment::Environment;
use crate::netutil::{read_head, resolve_target, splice, write_with_timeout};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type ResponseBody = BoxBody<Bytes, BoxError>;

const MAX_REQUEST_HEAD_BYTES: usize = 16 * 1024;

struct HttpContext {
    env: Environment,
    pool: BufferPool,
}

/// Runs the HTTP proxy front: accepts connections, sniffs `CONNECT` versus
/// plain requests, and dispatches each (§4.5, §4.6). Returns immediately if
/// the current config's `http_listen_addr` is empty (front disabled).
pub async fn run(env: Environment) -> Result<()> {
    let listen_addr = env.config().http_listen_addr.clone();
    if listen_addr.is_empty() {
        return Ok(());
    }

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind http socket {listen_addr}"))?;
    env.info(format!("listening on: http://{listen_addr}"));

    let ctx = Arc::new(HttpContext {
        env,
        pool: BufferPool::default(),
    });

    loop {
        let (stream, peer) = listener.accept().await.context("http accept failed")?;
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, ctx.clone()).await {
                ctx.env.error(format!("connection from {peer} failed: {err:#}"));
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, ctx: Arc<HttpContext>) -> Result<()> {
    if is_connect_request(&stream).await? {
        handle_connect(stream, &ctx).await
    } else {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let ctx = Arc::clone(&ctx);
            async move { Ok::<_, hyper::Error>(handle_plain(req, ctx).await) }
        });
        http1::Builder::new()
            .serve_connection(io, service)
            .await
            .context("plain http connection error")
    }
}

/// Peeks (without consuming) up to a handful of bytes to tell a `CONNECT`
/// request apart from a plain one before deciding which path owns the
/// socket. `TcpStream::peek` never advances the read cursor, so whichever
/// path is chosen still sees every byte the client sent.
async fn is_connect_request(stream: &TcpStream) -> Result<bool> {
    let mut buf = [0u8; 8];
    for _ in 0..40 {
        let n = stream.peek(&mut buf).await.context("peek failed")?;
        if n >= 7 {
            return Ok(&buf[..7] == b"CONNECT");
        }
        if n == 0 {
            return Ok(false);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(false)
}

/// §4.5 — the HTTP CONNECT handler. The socket is owned directly (no
/// framework hijack needed: nothing has touched it yet), so the `200`
/// response can be written byte-for-byte as the spec requires.
async fn handle_connect(mut client: TcpStream, ctx: &HttpContext) -> Result<()> {
    let config = ctx.env.config();
    let head = read_head(&mut client, MAX_REQUEST_HEAD_BYTES, config.read_timeout()).await?;
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    req.parse(&head).context("failed to parse CONNECT request")?;
    let target = req
        .path
        .map(str::to_string)
        .ok_or_else(|| anyhow!("CONNECT request has no target"))?;

    ctx.env.info(format!("CONNECT {target}"));

    let (host, ip) = resolve_target(&ctx.env, config.connect_timeout(), &target).await;
    let dialer = resolve_dialer(&ctx.env, &config, &host, ip);

    ctx.env.info(format!("CONNECT {target} => {dialer}"));

    let target_conn = match dialer.dial("tcp", &target).await {
        Ok(conn) => conn,
        Err(err) => {
            ctx.env.error(format!("CONNECT {target} => {dialer}: {err}"));
            let _ = write_with_timeout(&mut client, b"HTTP/1.1 502 Bad Gateway\r\n\r\n", config.write_timeout()).await;
            return Ok(());
        }
    };

    if let Err(err) = write_with_timeout(
        &mut client,
        b"HTTP/1.1 200 Connection established\r\n\r\n",
        config.write_timeout(),
    )
    .await
    {
        ctx.env.error(format!("writing response failed: {err}"));
    }
    if let Err(err) = client.flush().await {
        ctx.env.error(format!("flushing response failed: {err}"));
    }

    splice(client, target_conn, ctx.pool.clone(), &ctx.env, &target).await;
    Ok(())
}

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "upgrade",
    "transfer-encoding",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// §4.6 — the plain (non-CONNECT) HTTP request path. A stock reverse-proxy
/// component would normally own this; here it is a direct `hyper` client
/// handshake over a connection opened by the same §4.4 dialer, so the
/// routing decision stays in the dialer, not a separately-configured
/// transport.
async fn handle_plain(req: Request<Incoming>, ctx: Arc<HttpContext>) -> Response<ResponseBody> {
    match handle_plain_inner(req, &ctx).await {
        Ok(resp) => resp,
        Err(err) => {
            ctx.env.error(format!("bad request: {err:#}"));
            bad_gateway("proxy request failed")
        }
    }
}

async fn handle_plain_inner(
    mut req: Request<Incoming>,
    ctx: &HttpContext,
) -> Result<Response<ResponseBody>> {
    let host_port = req
        .uri()
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            req.headers()
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        })
        .ok_or_else(|| anyhow!("no host in request"))?;
    let host_port = ensure_port(&host_port);

    let config = ctx.env.config();
    let (host, ip) = resolve_target(&ctx.env, config.connect_timeout(), &host_port).await;
    let dialer = resolve_dialer(&ctx.env, &config, &host, ip);

    ctx.env
        .info(format!("{} {} => {dialer}", req.method(), req.uri()));

    req.headers_mut().retain(|name, _| !is_hop_by_hop(name));

    let target_conn = dialer
        .dial("tcp", &host_port)
        .await
        .with_context(|| format!("{dialer}"))?;
    let io = TokioIo::new(target_conn);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .context("upstream handshake failed")?;
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let resp = sender
        .send_request(req)
        .await
        .context("failed to send upstream request")?;
    let (mut parts, body) = resp.into_parts();
    parts.headers.retain(|name, _| !is_hop_by_hop(name));
    let body = body.map_err(|e| Box::new(e) as BoxError).boxed();
    Ok(Response::from_parts(parts, body))
}

fn ensure_port(host_port: &str) -> String {
    if host_port.rsplit_once(':').is_some() {
        host_port.to_string()
    } else {
        format!("{host_port}:80")
    }
}

fn bad_gateway(message: &'static str) -> Response<ResponseBody> {
    let body = Full::new(Bytes::from_static(message.as_bytes()))
        .map_err(|never: std::convert::Infallible| match never {})
        .boxed();
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(body)
        .expect("valid static response")
}
