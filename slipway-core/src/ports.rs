//! Dashboard serve endpoint.
//!
//! The exposed port (image metadata) and the bind flags handed to the
//! dashboard runner are both generated from one [`ServeEndpoint`], so the
//! port literal lives in exactly one place.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Port the dashboard runner listens on unless configured otherwise.
pub const DEFAULT_SERVE_PORT: u16 = 8501;

/// Wildcard bind address. Loopback would make the dashboard unreachable from
/// outside the container's network namespace.
pub const WILDCARD_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

const PORT_FLAG: &str = "--server.port=";
const ADDRESS_FLAG: &str = "--server.address=";

/// Network interface and port the launched process binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServeEndpoint {
    pub address: IpAddr,
    pub port: u16,
}

impl Default for ServeEndpoint {
    fn default() -> Self {
        Self { address: WILDCARD_ADDRESS, port: DEFAULT_SERVE_PORT }
    }
}

impl ServeEndpoint {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }

    /// Flags passed to the runner. Flag names and value formatting must match
    /// the dashboard framework's CLI exactly.
    pub fn bind_flags(&self) -> [String; 2] {
        [format!("{}{}", PORT_FLAG, self.port), format!("{}{}", ADDRESS_FLAG, self.address)]
    }

    /// Extract the endpoint from a launch argument vector.
    ///
    /// Returns `None` when no port flag is present. A missing address flag
    /// falls back to the wildcard address.
    pub fn from_args(args: &[String]) -> Option<Self> {
        let port = args
            .iter()
            .find_map(|a| a.strip_prefix(PORT_FLAG))
            .and_then(|p| p.parse::<u16>().ok())?;

        let address = args
            .iter()
            .find_map(|a| a.strip_prefix(ADDRESS_FLAG))
            .and_then(|a| a.parse::<IpAddr>().ok())
            .unwrap_or(WILDCARD_ADDRESS);

        Some(Self { address, port })
    }

    /// True for the flags [`ServeEndpoint::bind_flags`] produces.
    pub fn is_bind_flag(arg: &str) -> bool {
        arg.starts_with(PORT_FLAG) || arg.starts_with(ADDRESS_FLAG)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Address a local client should dial to reach this endpoint.
    pub fn connect_addr(&self) -> SocketAddr {
        if self.address.is_unspecified() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.port)
        } else {
            self.socket_addr()
        }
    }
}

impl fmt::Display for ServeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bind_flags_are_exact() {
        let flags = ServeEndpoint::default().bind_flags();
        assert_eq!(flags[0], "--server.port=8501");
        assert_eq!(flags[1], "--server.address=0.0.0.0");
    }

    #[test]
    fn test_from_args() {
        let args: Vec<String> = ["streamlit", "run", "app.py", "--server.port=9000", "--server.address=127.0.0.1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let endpoint = ServeEndpoint::from_args(&args).unwrap();
        assert_eq!(endpoint.port, 9000);
        assert_eq!(endpoint.address, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn test_from_args_defaults_to_wildcard() {
        let args = vec!["--server.port=8501".to_string()];
        let endpoint = ServeEndpoint::from_args(&args).unwrap();
        assert_eq!(endpoint, ServeEndpoint::default());
        assert_eq!(endpoint.connect_addr().ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));

        assert!(ServeEndpoint::from_args(&["run".to_string()]).is_none());
    }
}
