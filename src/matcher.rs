use std::net::IpAddr;

use anyhow::{Result, bail};
use ipnet::IpNet;

/// A compiled routing predicate over `(domain, ip)`.
///
/// Built once at config load time from a textual [`Pattern`](crate::config)
/// and held immutably for the lifetime of the [`Config`](crate::config::Config)
/// snapshot that owns it.
#[derive(Debug, Clone)]
pub enum Matcher {
    ExactDomain(String),
    SubdomainSuffix { suffix: String, suffix_len: usize },
    Cidr(IpNet),
}

impl Matcher {
    /// Compile a textual pattern into a matcher.
    ///
    /// `domain` name patterns and IP CIDRs share one namespace:
    /// - contains `/` -> CIDR
    /// - starts with `.` -> subdomain glob (bare `.` matches any non-empty name)
    /// - otherwise -> exact domain
    ///
    /// A bare IP literal or an empty string is rejected: IPs must be
    /// expressed as a `/32` or `/128` CIDR.
    pub fn compile(pattern: &str) -> Result<Self> {
        if pattern.is_empty() || pattern.parse::<IpAddr>().is_ok() {
            bail!("domain name pattern or CIDR is required");
        }
        if pattern.contains('/') {
            let net: IpNet = pattern.parse()?;
            return Ok(Matcher::Cidr(net));
        }
        if let Some(suffix) = pattern.strip_prefix('.') {
            return Ok(Matcher::SubdomainSuffix {
                suffix_len: suffix.len(),
                suffix: suffix.to_string(),
            });
        }
        Ok(Matcher::ExactDomain(pattern.to_string()))
    }

    /// Evaluate the matcher. `domain` is expected already lowercased and
    /// trimmed of a trailing dot by the caller; `ip` may be absent.
    pub fn matches(&self, domain: &str, ip: Option<IpAddr>) -> bool {
        match self {
            Matcher::ExactDomain(name) => domain == name,
            Matcher::Cidr(net) => ip.map(|ip| net.contains(&ip)).unwrap_or(false),
            Matcher::SubdomainSuffix { suffix, suffix_len } => {
                if domain.is_empty() {
                    return false;
                }
                if *suffix_len == 0 {
                    return true;
                }
                let len = domain.len();
                if len == *suffix_len {
                    domain == suffix
                } else if len > *suffix_len {
                    let dot = len - suffix_len - 1;
                    domain.as_bytes()[dot] == b'.' && &domain[dot + 1..] == suffix
                } else {
                    false
                }
            }
        }
    }
}
