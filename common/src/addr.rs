//! Owned-string helpers for labeling remote endpoints.

/// Build a display label for a remote endpoint that may or may not have a resolved
/// hostname. Mirrors the `host [numeric]` convention used in the engine's log lines.
pub fn format_remote_label(numeric: &str, host: Option<&str>) -> String {
    match host {
        Some(host) => format!("{host} [{numeric}]"),
        None => numeric.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_only() {
        assert_eq!(format_remote_label("10.0.0.1:9", None), "10.0.0.1:9");
    }

    #[test]
    fn numeric_and_host() {
        assert_eq!(
            format_remote_label("10.0.0.1:9", Some("example.org")),
            "example.org [10.0.0.1:9]"
        );
    }
}
