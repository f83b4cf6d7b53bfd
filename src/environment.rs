use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::{Config, Rule, Verbosity};
use crate::logging;

/// Process-wide runtime handle: one atomically swappable reference to the
/// current [`Config`] snapshot plus a log-line prefix.
///
/// Readers call [`Environment::config`] once per request and treat the
/// returned `Arc<Config>` as immutable for the rest of their work; updaters
/// publish a fully-built snapshot with [`Environment::set_config`]. There is
/// no lock: `ArcSwap::load`/`store` are each a single atomic operation.
pub struct Environment {
    config: Arc<ArcSwap<Config>>,
    prefix: &'static str,
}

impl Environment {
    pub fn new(initial: Config) -> Self {
        Self {
            config: Arc::new(ArcSwap::from_pointee(initial)),
            prefix: "",
        }
    }

    /// A handle sharing the same config reference but logging under a
    /// different component prefix (`"config "`, `"http "`, `"socks "`).
    pub fn with_prefix(&self, prefix: &'static str) -> Self {
        Self {
            config: Arc::clone(&self.config),
            prefix,
        }
    }

    /// Load the current configuration snapshot with a single atomic read.
    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    /// Publish a new, already-validated configuration snapshot with a
    /// single atomic store. Old snapshots are dropped once their last
    /// reader releases them.
    pub fn set_config(&self, config: Config) {
        self.config.store(Arc::new(config));
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(Verbosity::Error, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.log(Verbosity::Warn, message.as_ref());
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(Verbosity::Info, message.as_ref());
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.log(Verbosity::Debug, message.as_ref());
    }

    fn log(&self, level: Verbosity, message: &str) {
        if self.config().verbosity >= level {
            logging::line(self.prefix, level, message);
        }
    }

    /// Routing engine: the first rule whose matchers hit `(domain, ip)`,
    /// evaluated in config order. Both inputs may be absent independently.
    /// At Debug verbosity every evaluated pattern is logged hit/miss.
    pub fn resolve_rule(&self, domain: &str, ip: Option<IpAddr>) -> Option<Rule> {
        let config = self.config();
        for (i, rule) in config.rules.iter().enumerate() {
            for (j, matcher) in rule.matchers.iter().enumerate() {
                let hit = matcher.matches(domain, ip);
                if self.config().verbosity >= Verbosity::Debug {
                    let pattern = rule.patterns.get(j).map(String::as_str).unwrap_or("?");
                    if hit {
                        self.debug(format!(
                            "rule[{i}]/pattern[{j}]({pattern}) matches: {domain} {ip:?}"
                        ));
                    } else {
                        self.debug(format!(
                            "rule[{i}]/pattern[{j}]({pattern}) does not match: {domain} {ip:?}"
                        ));
                    }
                }
                if hit {
                    return Some(rule.clone());
                }
            }
        }
        self.debug(format!("no pattern matches: {domain} {ip:?}"));
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn config_with_rules(toml: &str) -> Config {
        Config::from_toml_str(toml).unwrap().0
    }

    #[test]
    fn resolve_rule_first_match_wins() {
        let toml = r#"
[[Rules]]
Proxy = "http://up1.test:3128"
Patterns = [".a.test"]

[[Rules]]
Proxy = "http://up2.test:3128"
Patterns = ["."]
"#;
        let env = Environment::new(config_with_rules(toml));
        let rule = env.resolve_rule("x.a.test", None).unwrap();
        assert_eq!(rule.proxy_host_port(), Some("up1.test:3128"));
    }

    #[test]
    fn resolve_rule_falls_through_to_catch_all() {
        let toml = r#"
[[Rules]]
Proxy = "http://up1.test:3128"
Patterns = [".a.test"]

[[Rules]]
Proxy = ""
Patterns = ["."]
"#;
        let env = Environment::new(config_with_rules(toml));
        let rule = env.resolve_rule("other.test", None).unwrap();
        assert!(rule.upstream.is_none());
    }

    #[test]
    fn resolve_rule_absent_when_nothing_matches() {
        let toml = r#"
[[Rules]]
Proxy = ""
Patterns = ["only.test"]
"#;
        let env = Environment::new(config_with_rules(toml));
        assert!(env.resolve_rule("other.test", None).is_none());
    }

    #[test]
    fn config_swap_is_observed_atomically() {
        let env = Environment::new(config_with_rules(
            r#"
[[Rules]]
Proxy = ""
Patterns = ["."]
"#,
        ));
        let before = env.config();
        env.set_config(config_with_rules(
            r#"
ConnectTimeoutMillis = 42

[[Rules]]
Proxy = ""
Patterns = ["."]
"#,
        ));
        let after = env.config();
        assert_eq!(before.connect_timeout_millis, 10_000);
        assert_eq!(after.connect_timeout_millis, 42);
    }
}
