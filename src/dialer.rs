use std::fmt;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::config::Config;
use crate::environment::Environment;

const MAX_RESPONSE_HEAD_BYTES: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("{identity}: unable to connect: {source}")]
    Connect {
        identity: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{identity}: unable send request: {source}")]
    SendRequest {
        identity: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{identity}: unable to read response: {source}")]
    ReadResponse {
        identity: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{identity}: got response status: {status}")]
    BadStatus { identity: String, status: u16 },
}

/// A capability that either dials the target directly or negotiates an
/// upstream HTTP CONNECT tunnel to it. Constructed per-request by
/// [`resolve_dialer`] and owned by the request task.
#[async_trait]
pub trait Dialer: Send + Sync + fmt::Display {
    async fn dial(&self, network: &str, address: &str) -> Result<TcpStream, DialError>;
}

async fn connect_with_timeout(
    identity: &str,
    address: &str,
    timeout: std::time::Duration,
) -> Result<TcpStream, DialError> {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(DialError::Connect {
            identity: identity.to_string(),
            source,
        }),
        // A timed-out connect is still a connect failure: fold it into the
        // same `Connect` variant so it renders through the spec-mandated
        // "unable to connect: <cause>" template rather than a shape of its
        // own, matching `mkError(err, "unable to connect")` in the original
        // for every failure path including `context.WithTimeout`.
        Err(_) => Err(DialError::Connect {
            identity: identity.to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect timed out after {}ms", timeout.as_millis()),
            ),
        }),
    }
}

/// Opens a TCP connection to `address` with a connect deadline bound by the
/// current config's connect timeout.
pub struct DirectDialer {
    connect_timeout: std::time::Duration,
}

impl DirectDialer {
    pub fn new(connect_timeout: std::time::Duration) -> Self {
        Self { connect_timeout }
    }
}

impl fmt::Display for DirectDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DIRECT")
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, _network: &str, address: &str) -> Result<TcpStream, DialError> {
        connect_with_timeout(&self.to_string(), address, self.connect_timeout).await
    }
}

/// Dials an upstream HTTP proxy and negotiates a CONNECT tunnel to the
/// original request's address.
pub struct UpstreamDialer {
    connect_timeout: std::time::Duration,
    proxy_addr: String,
}

impl UpstreamDialer {
    pub fn new(connect_timeout: std::time::Duration, proxy_addr: String) -> Self {
        Self {
            connect_timeout,
            proxy_addr,
        }
    }
}

impl fmt::Display for UpstreamDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PROXY http://{}", self.proxy_addr)
    }
}

#[async_trait]
impl Dialer for UpstreamDialer {
    async fn dial(&self, network: &str, address: &str) -> Result<TcpStream, DialError> {
        let identity = self.to_string();
        let mut conn =
            connect_with_timeout(&identity, &self.proxy_addr, self.connect_timeout).await?;
        let _ = network;

        use tokio::io::AsyncWriteExt;
        let request = format!("CONNECT {address} HTTP/1.1\r\n\r\n");
        if let Err(source) = conn.write_all(request.as_bytes()).await {
            return Err(DialError::SendRequest { identity, source });
        }

        match read_response_status(&mut conn).await {
            Ok(status) if status == 200 => Ok(conn),
            Ok(status) => Err(DialError::BadStatus { identity, status }),
            Err(source) => Err(DialError::ReadResponse { identity, source }),
        }
    }
}

/// Reads one HTTP response head from `conn`, byte by byte so no bytes past
/// the header block (the start of tunnel data) are consumed, and returns its
/// status code.
async fn read_response_status(conn: &mut TcpStream) -> std::io::Result<u16> {
    let mut buf = Vec::with_capacity(256);
    loop {
        let byte = conn.read_u8().await?;
        buf.push(byte);
        if buf.len() >= 4 && &buf[buf.len() - 4..] == b"\r\n\r\n" {
            break;
        }
        if buf.len() > MAX_RESPONSE_HEAD_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "response head too large",
            ));
        }
    }

    let mut headers = [httparse::EMPTY_HEADER; 16];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(&buf) {
        Ok(_) => response.code.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "response has no status code")
        }),
        Err(err) => Err(std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())),
    }
}

/// Dialer factory (§4.4): normalizes `fqdn`, resolves the routing rule, and
/// constructs the matching dialer variant. Absence of a matching rule, or a
/// rule with an empty upstream scheme, means dial directly.
pub fn resolve_dialer(
    env: &Environment,
    config: &Config,
    fqdn: &str,
    ip: Option<std::net::IpAddr>,
) -> Box<dyn Dialer> {
    let normalized = crate::config::normalize_domain(fqdn);
    env.debug(format!("resolve: {normalized} / {ip:?}"));
    let rule = env.resolve_rule(&normalized, ip);
    match rule.and_then(|r| r.upstream) {
        None => Box::new(DirectDialer::new(config.connect_timeout())),
        Some(upstream) => Box::new(UpstreamDialer::new(
            config.connect_timeout(),
            upstream.host_port,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn env_with(toml: &str) -> Environment {
        Environment::new(Config::from_toml_str(toml).unwrap().0)
    }

    #[test]
    fn factory_picks_direct_for_no_match() {
        let env = env_with(
            r#"
[[Rules]]
Proxy = ""
Patterns = ["only.test"]
"#,
        );
        let config = env.config();
        let dialer = resolve_dialer(&env, &config, "other.test", None);
        assert_eq!(dialer.to_string(), "DIRECT");
    }

    #[test]
    fn factory_picks_upstream_when_rule_has_proxy() {
        let env = env_with(
            r#"
[[Rules]]
Proxy = "http://up.test:3128"
Patterns = [".corp.test"]
"#,
        );
        let config = env.config();
        let dialer = resolve_dialer(&env, &config, "x.corp.test", None);
        assert_eq!(dialer.to_string(), "PROXY http://up.test:3128");
    }

    #[test]
    fn factory_lowercases_fqdn_before_matching() {
        let env = env_with(
            r#"
[[Rules]]
Proxy = "http://up.test:3128"
Patterns = ["example.test"]
"#,
        );
        let config = env.config();
        let dialer = resolve_dialer(&env, &config, "Example.TEST", None);
        assert_eq!(dialer.to_string(), "PROXY http://up.test:3128");
    }

    #[test]
    fn factory_dials_direct_for_ip_literal_despite_catch_all_rule() {
        // An empty domain (the form resolve_target hands back for a raw IP
        // destination) must never hit a ".", per spec.md §4.1's
        // `domain == "" -> false` rule: only a Cidr matcher may match here.
        let env = env_with(
            r#"
[[Rules]]
Proxy = "http://up.test:3128"
Patterns = ["."]
"#,
        );
        let config = env.config();
        let dialer = resolve_dialer(&env, &config, "", Some("93.184.216.34".parse().unwrap()));
        assert_eq!(dialer.to_string(), "DIRECT");
    }

    #[test]
    fn factory_matches_cidr_rule_for_ip_literal_with_empty_domain() {
        let env = env_with(
            r#"
[[Rules]]
Proxy = "http://up.test:3128"
Patterns = ["10.0.0.0/8"]
"#,
        );
        let config = env.config();
        let dialer = resolve_dialer(&env, &config, "", Some("10.1.2.3".parse().unwrap()));
        assert_eq!(dialer.to_string(), "PROXY http://up.test:3128");
    }

    #[test]
    fn timed_out_connect_renders_through_unable_to_connect_template() {
        let err = DialError::Connect {
            identity: "DIRECT".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out after 5ms"),
        };
        assert_eq!(
            err.to_string(),
            "DIRECT: unable to connect: connect timed out after 5ms"
        );
    }

    async fn fake_upstream() -> (tokio::net::TcpListener, String) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    async fn read_request_head(conn: &mut TcpStream) -> Vec<u8> {
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            conn.read_exact(&mut byte).await.unwrap();
            buf.push(byte[0]);
            if buf.ends_with(b"\r\n\r\n") {
                return buf;
            }
        }
    }

    #[tokio::test]
    async fn upstream_dialer_sends_literal_connect_request_and_follows_200() {
        use tokio::io::AsyncWriteExt;

        let (listener, proxy_addr) = fake_upstream().await;
        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let request = read_request_head(&mut conn).await;
            conn.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
            request
        });

        let dialer = UpstreamDialer::new(std::time::Duration::from_secs(5), proxy_addr);
        let result = dialer.dial("tcp", "corp.internal:443").await;
        assert!(result.is_ok());

        let request = server.await.unwrap();
        assert_eq!(request, b"CONNECT corp.internal:443 HTTP/1.1\r\n\r\n");
    }

    #[tokio::test]
    async fn upstream_dialer_surfaces_non_200_reply_as_bad_status() {
        use tokio::io::AsyncWriteExt;

        let (listener, proxy_addr) = fake_upstream().await;
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let _ = read_request_head(&mut conn).await;
            conn.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let dialer = UpstreamDialer::new(std::time::Duration::from_secs(5), proxy_addr.clone());
        let err = dialer.dial("tcp", "corp.internal:443").await.unwrap_err();
        match err {
            DialError::BadStatus { status, identity } => {
                assert_eq!(status, 407);
                assert_eq!(identity, format!("PROXY http://{proxy_addr}"));
            }
            other => panic!("expected BadStatus, got {other:?}"),
        }
    }
}
