//! HTTP surfaces
//!
//! - `app` - the primary (internal) listener application
//! - `redirect` - plaintext redirect & ACME challenge responder
//! - `metrics` - Prometheus registry shared by every component

mod app;
pub mod metrics;
mod redirect;

pub use app::{build_app, RequestStats};
pub use metrics::{create_metrics, SharedMetrics, SupervisorMetrics};
pub use redirect::{redirect_router, redirect_url, serve_redirect, CHALLENGE_PREFIX};

use crate::error::ServerError;
use std::net::{IpAddr, SocketAddr};
use tokio::net::{TcpListener, TcpSocket};

/// Parse `host` as an IP literal and pair it with `port`
pub fn socket_addr(host: &str, port: u16) -> Result<SocketAddr, ServerError> {
    let ip: IpAddr = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .map_err(|e| ServerError::Bind {
            addr: format!("{}:{}", host, port),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        })?;
    Ok(SocketAddr::new(ip, port))
}

/// Bind a listener with an explicit accept backlog
pub fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener, ServerError> {
    let bind_err = |source: std::io::Error| ServerError::Bind {
        addr: addr.to_string(),
        source,
    };

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_err)?;
    socket.set_reuseaddr(true).map_err(bind_err)?;
    socket.bind(addr).map_err(bind_err)?;
    socket.listen(backlog.max(1)).map_err(bind_err)
}

#[cfg(test)]
#[path = "metrics_test.rs"]
mod metrics_tests;
