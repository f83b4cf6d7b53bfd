use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::bufferpool::BufferPool;
use crate::dialer::{DialError, resolve_dialer};
use crate::environment::Environment;
use crate::netutil::{resolve_target, splice, with_read_timeout, write_with_timeout};

const SOCKS_VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const NO_ACCEPTABLE_METHODS: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

struct SocksContext {
    env: Environment,
    pool: BufferPool,
}

/// Runs the SOCKS5 proxy front (§4.7): a hand-rolled CONNECT-only handshake
/// (RFC 1928) feeding the same dialer factory and splice routine as the HTTP
/// front. No client authentication and no BIND/UDP ASSOCIATE, matching the
/// non-goals that rule those out. Returns immediately if the current
/// config's `socks_listen_addr` is empty (front disabled).
pub async fn run(env: Environment) -> Result<()> {
    let listen_addr = env.config().socks_listen_addr.clone();
    if listen_addr.is_empty() {
        return Ok(());
    }

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind socks socket {listen_addr}"))?;
    env.info(format!("listening on: socks5://{listen_addr}"));

    let ctx = Arc::new(SocksContext {
        env,
        pool: BufferPool::default(),
    });

    loop {
        let (stream, peer) = listener.accept().await.context("socks accept failed")?;
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, &ctx).await {
                ctx.env.error(format!("connection from {peer} failed: {err:#}"));
            }
        });
    }
}

async fn handle_connection(mut client: TcpStream, ctx: &SocksContext) -> Result<()> {
    let config = ctx.env.config();

    let accepted = with_read_timeout(config.read_timeout(), negotiate_auth(&mut client)).await?;
    if !accepted {
        return Ok(());
    }

    let (target, command) =
        with_read_timeout(config.read_timeout(), read_request(&mut client, config.write_timeout()))
            .await?;
    if command != CMD_CONNECT {
        write_reply(&mut client, REP_COMMAND_NOT_SUPPORTED, config.write_timeout()).await?;
        bail!("unsupported SOCKS5 command: {command}");
    }

    ctx.env.info(format!("CONNECT {target}"));

    let (host, ip) = resolve_target(&ctx.env, config.connect_timeout(), &target).await;
    let dialer = resolve_dialer(&ctx.env, &config, &host, ip);

    ctx.env.info(format!("CONNECT {target} => {dialer}"));

    let target_conn = match dialer.dial("tcp", &target).await {
        Ok(conn) => conn,
        Err(err) => {
            ctx.env.error(format!("CONNECT {target} => {dialer}: {err}"));
            write_reply(&mut client, reply_code_for(&err), config.write_timeout()).await?;
            return Ok(());
        }
    };

    write_reply(&mut client, REP_SUCCESS, config.write_timeout()).await?;
    splice(client, target_conn, ctx.pool.clone(), &ctx.env, &target).await;
    Ok(())
}

fn reply_code_for(err: &DialError) -> u8 {
    match err {
        DialError::Connect { source, .. }
            if source.kind() == std::io::ErrorKind::ConnectionRefused =>
        {
            REP_CONNECTION_REFUSED
        }
        _ => REP_GENERAL_FAILURE,
    }
}

/// Reads the method-selection greeting and requires the client to offer
/// no-authentication. Returns `false` (connection already closed) if no
/// acceptable method was offered.
async fn negotiate_auth(client: &mut TcpStream) -> Result<bool> {
    let mut header = [0u8; 2];
    client.read_exact(&mut header).await.context("failed to read greeting")?;
    if header[0] != SOCKS_VERSION {
        bail!("unsupported SOCKS version: {}", header[0]);
    }

    let mut methods = vec![0u8; header[1] as usize];
    client.read_exact(&mut methods).await.context("failed to read auth methods")?;

    if !methods.contains(&NO_AUTH) {
        client.write_all(&[SOCKS_VERSION, NO_ACCEPTABLE_METHODS]).await?;
        return Ok(false);
    }

    client.write_all(&[SOCKS_VERSION, NO_AUTH]).await?;
    Ok(true)
}

/// Reads the CONNECT/BIND/UDP-ASSOCIATE request and returns the dial target
/// in `host:port` form (domain names are left unresolved; resolution happens
/// through the same hook the HTTP front uses) alongside the command byte.
async fn read_request(client: &mut TcpStream, write_timeout: Duration) -> Result<(String, u8)> {
    let mut header = [0u8; 4];
    client.read_exact(&mut header).await.context("failed to read request header")?;
    if header[0] != SOCKS_VERSION {
        bail!("unsupported SOCKS version in request: {}", header[0]);
    }
    let command = header[1];
    let address_type = header[3];

    let host = match address_type {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            client.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            client.read_exact(&mut addr).await?;
            Ipv6Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            client.read_exact(&mut domain).await?;
            String::from_utf8(domain).context("domain is not valid UTF-8")?
        }
        other => {
            write_reply(client, REP_ADDRESS_TYPE_NOT_SUPPORTED, write_timeout).await?;
            bail!("unsupported SOCKS5 address type: {other}");
        }
    };

    let mut port = [0u8; 2];
    client.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);

    let target = if address_type == ATYP_IPV6 {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    Ok((target, command))
}

/// Writes a SOCKS5 reply. `BND.ADDR`/`BND.PORT` are reported as `0.0.0.0:0`:
/// the protocol requires the field but, absent NAT traversal concerns, its
/// value is not meaningful to this proxy's clients.
async fn write_reply(client: &mut TcpStream, reply_code: u8, write_timeout: Duration) -> Result<()> {
    let reply = [
        SOCKS_VERSION,
        reply_code,
        0x00,
        ATYP_IPV4,
        0, 0, 0, 0,
        0, 0,
    ];
    write_with_timeout(client, &reply, write_timeout).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener as TestListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TestListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn negotiate_auth_accepts_no_auth_method() {
        let (mut client, mut server) = loopback_pair().await;
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

        let accepted = negotiate_auth(&mut server).await.unwrap();
        assert!(accepted);

        let mut resp = [0u8; 2];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn negotiate_auth_rejects_when_no_auth_absent() {
        let (mut client, mut server) = loopback_pair().await;
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

        let accepted = negotiate_auth(&mut server).await.unwrap();
        assert!(!accepted);

        let mut resp = [0u8; 2];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, [0x05, 0xFF]);
    }

    #[tokio::test]
    async fn read_request_parses_domain_target() {
        let (mut client, mut server) = loopback_pair().await;
        let mut req = vec![0x05, CMD_CONNECT, 0x00, ATYP_DOMAIN];
        req.push(b"x.test".len() as u8);
        req.extend_from_slice(b"x.test");
        req.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let (target, command) = read_request(&mut server, Duration::ZERO).await.unwrap();
        assert_eq!(target, "x.test:80");
        assert_eq!(command, CMD_CONNECT);
    }

    #[tokio::test]
    async fn read_request_parses_ipv4_target() {
        let (mut client, mut server) = loopback_pair().await;
        let req = [0x05, CMD_CONNECT, 0x00, ATYP_IPV4, 127, 0, 0, 1, 0x1F, 0x90];
        client.write_all(&req).await.unwrap();

        let (target, _) = read_request(&mut server, Duration::ZERO).await.unwrap();
        assert_eq!(target, "127.0.0.1:8080");
    }

    #[tokio::test]
    async fn write_reply_emits_rfc1928_shape() {
        let (mut client, mut server) = loopback_pair().await;
        write_reply(&mut server, REP_SUCCESS, Duration::ZERO).await.unwrap();

        let mut resp = [0u8; 10];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }
}
