use time::{OffsetDateTime, format_description::FormatItem, macros::format_description};

use crate::config::Verbosity;

const TIMESTAMP_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");

/// Format and write one `PREFIX TIMESTAMP LEVEL message` line to stderr.
///
/// Filtering by the current `Verbosity` is the caller's (`Environment`'s)
/// responsibility; this function always writes.
pub fn line(prefix: &str, level: Verbosity, message: &str) {
    let now = OffsetDateTime::now_utc();
    let timestamp = now
        .format(TIMESTAMP_FORMAT)
        .unwrap_or_else(|_| String::from("0000-00-00T00:00:00Z"));
    eprintln!("{prefix}{timestamp} {} {message}", level.as_str());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_str_matches_wire_format_levels() {
        assert_eq!(Verbosity::Error.as_str(), "ERROR");
        assert_eq!(Verbosity::Debug.as_str(), "DEBUG");
    }
}
