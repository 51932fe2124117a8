//! CLI command implementations

pub mod build;
pub mod cache;
pub mod images;
pub mod init;
pub mod run;

use anyhow::Result;
use slipway_core::config::IsolationMode;
use std::collections::HashMap;

/// Parse `KEY=VALUE` arguments.
pub fn parse_key_values(items: &[String]) -> Result<HashMap<String, String>> {
    items
        .iter()
        .map(|item| match item.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(anyhow::anyhow!("Invalid KEY=VALUE format: {}", item)),
        })
        .collect()
}

pub fn parse_isolation(value: &str) -> Result<IsolationMode> {
    match value.to_lowercase().as_str() {
        "auto" => Ok(IsolationMode::Auto),
        "chroot" => Ok(IsolationMode::Chroot),
        "host" => Ok(IsolationMode::Host),
        other => anyhow::bail!("Unknown isolation mode '{}' (expected auto, chroot or host)", other),
    }
}

/// Formats size in bytes to human-readable form.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Formats a duration in seconds to a human-readable string.
pub fn format_duration(secs: f64) -> String {
    if secs < 1.0 {
        format!("{:.0}ms", secs * 1000.0)
    } else if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        let mins = (secs / 60.0).floor();
        let remaining_secs = secs - (mins * 60.0);
        format!("{:.0}m{:.0}s", mins, remaining_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_values() {
        let parsed = parse_key_values(&["VERSION=2".to_string(), "EMPTY=".to_string()]).unwrap();
        assert_eq!(parsed["VERSION"], "2");
        assert_eq!(parsed["EMPTY"], "");

        assert!(parse_key_values(&["novalue".to_string()]).is_err());
        assert!(parse_key_values(&["=x".to_string()]).is_err());
    }

    #[test]
    fn test_parse_isolation() {
        assert_eq!(parse_isolation("Host").unwrap(), IsolationMode::Host);
        assert!(parse_isolation("vm").is_err());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(1536), "1.5KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0MB");
    }

    #[test]
    fn test_format_duration_milliseconds() {
        assert_eq!(format_duration(0.123), "123ms");
    }

    #[test]
    fn test_format_duration_seconds() {
        assert_eq!(format_duration(5.7), "5.7s");
    }

    #[test]
    fn test_format_duration_minutes() {
        assert_eq!(format_duration(125.0), "2m5s");
    }
}
