//! Checks run before the dashboard process is spawned.
//!
//! Both failures here are reported without starting anything, so a bad
//! launch never leaves a half-started process or a bound port behind.

use super::Container;
use crate::builder::runner::host_path;
use crate::error::{Result, SlipwayError};
use crate::ports::ServeEndpoint;
use std::io::ErrorKind;
use std::net::TcpListener;
use std::path::Path;
use tracing::debug;

/// Run every check for `container`.
pub fn preflight(container: &Container) -> Result<()> {
    if let Some(entry) = container.command.entry_file() {
        check_entry(container.rootfs(), container.workdir(), &entry)?;
    }
    check_port(&container.endpoint)
}

/// Fail with `EntryNotFound` when `entry` does not exist in the image.
/// Relative entries resolve against `workdir`.
pub fn check_entry(rootfs: &Path, workdir: &str, entry: &str) -> Result<()> {
    let image_path = if entry.starts_with('/') {
        entry.to_string()
    } else {
        format!("{}/{}", workdir.trim_end_matches('/'), entry)
    };

    let path = host_path(rootfs, &image_path);
    if path.is_file() {
        debug!(entry = %image_path, "Entry file present");
        return Ok(());
    }

    Err(SlipwayError::EntryNotFound { entry: entry.to_string(), workdir: workdir.to_string() })
}

/// Check that `endpoint` can be bound, releasing it again immediately.
pub fn check_port(endpoint: &ServeEndpoint) -> Result<()> {
    match TcpListener::bind(endpoint.socket_addr()) {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            Err(SlipwayError::PortConflict { port: endpoint.port, address: endpoint.address.to_string() })
        }
        Err(e) => Err(SlipwayError::BindFailed {
            port: endpoint.port,
            address: endpoint.address.to_string(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::TempDir;

    #[test]
    fn test_entry_resolves_against_workdir() {
        let rootfs = TempDir::new().unwrap();
        std::fs::create_dir_all(rootfs.path().join("app")).unwrap();
        std::fs::write(rootfs.path().join("app/app.py"), "import streamlit\n").unwrap();

        check_entry(rootfs.path(), "/app", "app.py").unwrap();
        check_entry(rootfs.path(), "/", "/app/app.py").unwrap();
    }

    #[test]
    fn test_missing_entry_names_file_and_workdir() {
        let rootfs = TempDir::new().unwrap();
        let err = check_entry(rootfs.path(), "/app", "app.py").unwrap_err();

        match &err {
            SlipwayError::EntryNotFound { entry, workdir } => {
                assert_eq!(entry, "app.py");
                assert_eq!(workdir, "/app");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(err.exit_code(), 125);
    }

    #[test]
    fn test_port_in_use_is_a_conflict() {
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let endpoint = ServeEndpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);

        let err = check_port(&endpoint).unwrap_err();
        assert!(matches!(err, SlipwayError::PortConflict { port: p, .. } if p == port));

        drop(held);
        check_port(&endpoint).unwrap();
    }
}
