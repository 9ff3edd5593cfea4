use chrono::{DateTime, Utc};

/// Shown by `--version` in long form.
pub const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (commit ",
    env!("PIDMASTER_BUILD_COMMIT"),
    ", built on ",
    env!("PIDMASTER_BUILD_HOST"),
    ", ",
    env!("PIDMASTER_BUILD_TIME"),
    ")"
);

pub fn build_host() -> &'static str {
    option_env!("PIDMASTER_BUILD_HOST").unwrap_or("unknown")
}

pub fn build_commit() -> &'static str {
    option_env!("PIDMASTER_BUILD_COMMIT").unwrap_or("-")
}

pub fn build_time_raw() -> &'static str {
    option_env!("PIDMASTER_BUILD_TIME").unwrap_or("unknown")
}

/// Render the `epoch:<secs>` stamp from build.rs as `YYYY-MM-DD HH:MM:SS` (UTC).
pub fn format_build_time(raw: &str) -> String {
    let raw = raw.trim();
    let parsed = raw
        .strip_prefix("epoch:")
        .and_then(|s| s.trim().parse::<i64>().ok())
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
    match parsed {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => raw.to_string(),
    }
}

pub fn banner() -> String {
    format!(
        "pidmaster {} (commit {}, built on {} at {})",
        env!("CARGO_PKG_VERSION"),
        build_commit(),
        build_host(),
        format_build_time(build_time_raw())
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_stamp_renders_utc() {
        assert_eq!(format_build_time("epoch:0"), "1970-01-01 00:00:00");
        assert_eq!(format_build_time("epoch: 86400 "), "1970-01-02 00:00:00");
    }

    #[test]
    fn unknown_stamp_passes_through() {
        assert_eq!(format_build_time("unknown"), "unknown");
    }
}
