use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::matcher::Matcher;

/// Logging verbosity, ordered `Error < Warn < Info < Debug`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl TryFrom<u8> for Verbosity {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Verbosity::Error,
            1 => Verbosity::Warn,
            2 => Verbosity::Info,
            3 => Verbosity::Debug,
            other => bail!("invalid Verbosity value: {other} (expected 0=Error 1=Warn 2=Info 3=Debug)"),
        })
    }
}

impl Verbosity {
    pub fn as_str(self) -> &'static str {
        match self {
            Verbosity::Error => "ERROR",
            Verbosity::Warn => "WARN",
            Verbosity::Info => "INFO",
            Verbosity::Debug => "DEBUG",
        }
    }
}

/// An upstream HTTP proxy a matched rule forwards the CONNECT request to.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub host_port: String,
}

/// An ordered matcher list plus an optional upstream target. First matching
/// rule in `Config::rules` wins; an absent upstream means "dial directly".
#[derive(Debug, Clone)]
pub struct Rule {
    pub patterns: Vec<String>,
    pub matchers: Vec<Matcher>,
    pub upstream: Option<UpstreamTarget>,
}

impl Rule {
    pub fn proxy_host_port(&self) -> Option<&str> {
        self.upstream.as_ref().map(|u| u.host_port.as_str())
    }
}

/// An immutable, atomically-publishable configuration snapshot.
#[derive(Debug, Clone)]
pub struct Config {
    pub http_listen_addr: String,
    pub socks_listen_addr: String,
    pub connect_timeout_millis: u64,
    pub read_timeout_millis: u64,
    pub write_timeout_millis: u64,
    pub verbosity: Verbosity,
    pub rules: Vec<Rule>,
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_millis)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_millis)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_millis)
    }

    /// Parse and validate a TOML document into a `Config`, returning any
    /// unrecognized top-level or rule-level field names alongside it so the
    /// caller can log them at Warn (an unknown field never fails the load).
    pub fn from_toml_str(raw: &str) -> Result<(Self, Vec<String>)> {
        let value: toml::Value =
            toml::from_str(raw).context("failed to parse TOML document")?;
        let unknown = collect_unknown_fields(&value);

        let raw_config: RawConfig =
            toml::from_str(raw).context("failed to parse TOML document")?;
        let config = raw_config.validate()?;
        Ok((config, unknown))
    }
}

const ROOT_FIELDS: &[&str] = &[
    "HttpListenAddr",
    "SocksListenAddr",
    "ConnectTimeoutMillis",
    "ReadTimeoutMillis",
    "WriteTimeoutMillis",
    "Verbosity",
    "Rules",
];
const RULE_FIELDS: &[&str] = &["Proxy", "Patterns"];

fn collect_unknown_fields(value: &toml::Value) -> Vec<String> {
    let mut unknown = Vec::new();
    let Some(root) = value.as_table() else {
        return unknown;
    };
    for key in root.keys() {
        if !ROOT_FIELDS.contains(&key.as_str()) {
            unknown.push(key.clone());
        }
    }
    if let Some(rules) = root.get("Rules").and_then(|v| v.as_array()) {
        for (i, rule) in rules.iter().enumerate() {
            let Some(table) = rule.as_table() else {
                continue;
            };
            for key in table.keys() {
                if !RULE_FIELDS.contains(&key.as_str()) {
                    unknown.push(format!("Rules[{i}].{key}"));
                }
            }
        }
    }
    unknown
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(rename = "HttpListenAddr", default = "default_http_listen_addr")]
    http_listen_addr: String,
    #[serde(rename = "SocksListenAddr", default = "default_socks_listen_addr")]
    socks_listen_addr: String,
    #[serde(rename = "ConnectTimeoutMillis", default = "default_connect_timeout_millis")]
    connect_timeout_millis: u64,
    #[serde(rename = "ReadTimeoutMillis", default)]
    read_timeout_millis: u64,
    #[serde(rename = "WriteTimeoutMillis", default)]
    write_timeout_millis: u64,
    #[serde(rename = "Verbosity", default)]
    verbosity: u8,
    #[serde(rename = "Rules", default)]
    rules: Vec<RawRule>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    #[serde(rename = "Proxy", default)]
    proxy: String,
    #[serde(rename = "Patterns", default)]
    patterns: Vec<String>,
}

fn default_http_listen_addr() -> String {
    "127.0.0.1:8001".to_string()
}

fn default_socks_listen_addr() -> String {
    "127.0.0.1:8002".to_string()
}

fn default_connect_timeout_millis() -> u64 {
    10_000
}

impl RawConfig {
    fn validate(self) -> Result<Config> {
        if self.rules.is_empty() {
            bail!("no rules were defined");
        }
        let mut rules = Vec::with_capacity(self.rules.len());
        for (i, raw_rule) in self.rules.into_iter().enumerate() {
            let upstream = parse_proxy_url(&raw_rule.proxy)
                .with_context(|| format!("rule[{i}] proxy `{}`", raw_rule.proxy))?;
            let mut matchers = Vec::with_capacity(raw_rule.patterns.len());
            for (j, pattern) in raw_rule.patterns.iter().enumerate() {
                let m = Matcher::compile(pattern)
                    .with_context(|| format!("rule[{i}] pattern[{j}] `{pattern}`"))?;
                matchers.push(m);
            }
            rules.push(Rule {
                patterns: raw_rule.patterns,
                matchers,
                upstream,
            });
        }

        Ok(Config {
            http_listen_addr: self.http_listen_addr,
            socks_listen_addr: self.socks_listen_addr,
            connect_timeout_millis: self.connect_timeout_millis,
            read_timeout_millis: self.read_timeout_millis,
            write_timeout_millis: self.write_timeout_millis,
            verbosity: Verbosity::try_from(self.verbosity)?,
            rules,
        })
    }
}

/// Parse and validate a rule's `Proxy` field. An empty string means direct
/// dialing (`Ok(None)`). Otherwise the value must be `http://host:port` with
/// no user-info, path, query, or fragment.
fn parse_proxy_url(proxy_url: &str) -> Result<Option<UpstreamTarget>> {
    if proxy_url.is_empty() {
        return Ok(None);
    }

    let uri: http::Uri = proxy_url
        .parse()
        .with_context(|| format!("invalid URL `{proxy_url}`"))?;

    if proxy_url.contains('@') {
        bail!("has unsupported user-info");
    }
    if let Some(pq) = uri.path_and_query() {
        if !matches!(pq.as_str(), "" | "/") {
            bail!("has unsupported path/query/fragment");
        }
    }
    if proxy_url.contains('#') {
        bail!("has unsupported fragment");
    }

    match uri.scheme_str() {
        Some("http") => {}
        Some(other) => bail!("has unsupported scheme `{other}`"),
        None => bail!("has no scheme"),
    }

    let authority = uri
        .authority()
        .ok_or_else(|| anyhow::anyhow!("has no host"))?;

    Ok(Some(UpstreamTarget {
        host_port: authority.as_str().to_string(),
    }))
}

/// Lowercase and trim a trailing dot from an FQDN, the normal form every
/// matcher evaluation expects its `domain` argument in.
pub fn normalize_domain(input: &str) -> String {
    input.trim().trim_end_matches('.').to_ascii_lowercase()
}
