//! Startup readiness watch.

use crate::ports::ServeEndpoint;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Poll `endpoint` until it accepts a connection or `timeout` passes.
///
/// Returns the time it took to become ready. Only informational: a slow
/// dashboard is logged, never killed.
pub async fn wait_until_ready(endpoint: ServeEndpoint, timeout: Duration) -> Option<Duration> {
    let started = Instant::now();
    let target = endpoint.connect_addr();

    while started.elapsed() < timeout {
        if TcpStream::connect(target).await.is_ok() {
            let elapsed = started.elapsed();
            info!(endpoint = %endpoint, ready_secs = elapsed.as_secs_f64(), "Dashboard accepting connections");
            return Some(elapsed);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    warn!(endpoint = %endpoint, timeout_secs = timeout.as_secs(), "Dashboard not accepting connections yet");
    None
}
