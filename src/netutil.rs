use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::bufferpool::BufferPool;
use crate::environment::Environment;

/// Splits `host:port`; if `host` is an IP literal it is used directly and no
/// DNS lookup happens, and the returned domain is the empty string — a raw
/// IP destination has no domain name, so domain-based matchers (including
/// the bare `.` catch-all, whose `suffix_len == 0` rule matches any
/// *non-empty* name) must never see it as a hit. This mirrors the original's
/// `resolveDialer` setting `host = ""` before building the rule lookup
/// whenever `net.ParseIP(host) != nil`. Otherwise resolves via the system
/// resolver under `connect_timeout`; failures are logged at Warn but not
/// fatal, matching §4.5 step 1 and §4.7's resolver hook (both fronts share
/// this).
pub async fn resolve_target(
    env: &Environment,
    connect_timeout: Duration,
    host_port: &str,
) -> (String, Option<IpAddr>) {
    let host = host_port
        .rsplit_once(':')
        .map(|(h, _)| h)
        .unwrap_or(host_port)
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();

    if let Ok(ip) = host.parse::<IpAddr>() {
        return (String::new(), Some(ip));
    }

    let lookup = tokio::time::timeout(connect_timeout, tokio::net::lookup_host(format!("{host}:0"))).await;
    match lookup {
        Ok(Ok(mut addrs)) => (host.clone(), addrs.next().map(|a| a.ip())),
        Ok(Err(err)) => {
            env.warn(format!("IP lookup failed for {host}: {err}"));
            (host, None)
        }
        Err(_) => {
            env.warn(format!("IP lookup timed out for {host}"));
            (host, None)
        }
    }
}

/// Reads one HTTP request/response head byte by byte, stopping exactly at
/// the end of the header block so no tunnel/body data is consumed. Bounded
/// by `read_timeout` (the listener's configured read timeout); a zero
/// duration means no timeout, matching §6's `ReadTimeoutMillis = 0` default.
pub async fn read_head<S: AsyncRead + Unpin>(
    stream: &mut S,
    max: usize,
    read_timeout: Duration,
) -> Result<Vec<u8>> {
    with_read_timeout(read_timeout, read_head_inner(stream, max)).await
}

async fn read_head_inner<S: AsyncRead + Unpin>(stream: &mut S, max: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(256);
    loop {
        let byte = stream.read_u8().await.context("failed to read request head")?;
        buf.push(byte);
        if buf.len() >= 4 && &buf[buf.len() - 4..] == b"\r\n\r\n" {
            return Ok(buf);
        }
        if buf.len() > max {
            anyhow::bail!("request head exceeds size limit");
        }
    }
}

/// Races `fut` against `timeout` unless `timeout` is zero (no timeout
/// configured), in which case `fut` runs unbounded. Shared by both listener
/// fronts to bound the initial request-header read per §5.
pub async fn with_read_timeout<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    if timeout.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "timed out after {}ms reading request head",
            timeout.as_millis()
        )),
    }
}

/// Writes `data` to `writer`, bounded by `write_timeout` (zero means no
/// timeout), mirroring `read_head`'s timeout handling for the symmetric
/// `WriteTimeoutMillis` config field.
pub async fn write_with_timeout<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
    write_timeout: Duration,
) -> Result<()> {
    let write = async { writer.write_all(data).await.context("failed to write response") };
    if write_timeout.is_zero() {
        return write.await;
    }
    match tokio::time::timeout(write_timeout, write).await {
        Ok(result) => result,
        Err(_) => anyhow::bail!("timed out after {}ms writing response", write_timeout.as_millis()),
    }
}

/// §4.5 steps 6-7 / §4.7's dial-and-relay hook — bidirectional splice with
/// per-direction half-close. Each direction runs its own pooled-buffer copy
/// loop; when a direction's source hits EOF, the destination's write half is
/// shut down (propagating FIN) while the other direction keeps running until
/// its own source EOFs.
pub async fn splice(client: TcpStream, target: TcpStream, pool: BufferPool, env: &Environment, label: &str) {
    let (mut client_r, mut client_w) = client.into_split();
    let (mut target_r, mut target_w) = target.into_split();

    let pool_a = pool.clone();
    let pool_b = pool;

    let client_to_target = async {
        let mut buf = pool_a.acquire();
        let result = copy_with_buffer(&mut client_r, &mut target_w, &mut buf).await;
        let _ = target_w.shutdown().await;
        result
    };
    let target_to_client = async {
        let mut buf = pool_b.acquire();
        let result = copy_with_buffer(&mut target_r, &mut client_w, &mut buf).await;
        let _ = client_w.shutdown().await;
        result
    };

    let (client_result, target_result) = tokio::join!(client_to_target, target_to_client);
    if let Err(err) = client_result {
        env.error(format!("tunnel {label} client->target error: {err}"));
    }
    if let Err(err) = target_result {
        env.error(format!("tunnel {label} target->client error: {err}"));
    }
}

async fn copy_with_buffer<R, W>(reader: &mut R, writer: &mut W, buf: &mut [u8]) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}
