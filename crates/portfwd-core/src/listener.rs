//! Listener management: one bound socket and accept loop per rule.
//!
//! All listeners are bound before any accept loop starts, so a port that
//! cannot be bound aborts startup instead of leaving a partially running
//! rule set.

use crate::error::{ForwardError, ForwardResult};
use crate::handler::ConnectionHandler;
use crate::rules::RuleIndex;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Address listeners bind to by default: the IPv6 wildcard, which also
/// accepts IPv4 clients on dual-stack hosts.
pub const BIND_ALL: IpAddr = IpAddr::V6(Ipv6Addr::UNSPECIFIED);

/// Owns the bound listeners until their accept loops are spawned.
pub struct ListenerManager {
    handler: Arc<ConnectionHandler>,
    listeners: Vec<(RuleIndex, TcpListener)>,
}

impl ListenerManager {
    /// Bind a listener on `host:<listen_port>` for every rule, in table order.
    ///
    /// # Errors
    ///
    /// [`ForwardError::Bind`] for the first port that cannot be bound.
    /// Listeners bound before the failure are closed.
    pub async fn bind(handler: Arc<ConnectionHandler>, host: IpAddr) -> ForwardResult<Self> {
        let mut listeners = Vec::with_capacity(handler.rules().len());

        for (index, rule) in handler.rules().iter() {
            let addr = SocketAddr::new(host, rule.listen_port);
            let listener = bind_listener(addr)
                .await
                .map_err(|source| ForwardError::Bind {
                    port: rule.listen_port,
                    source,
                })?;

            info!(
                rule = %rule.label(),
                port = rule.listen_port,
                forward = %rule.forward_address,
                max_simultaneous = rule.max_simultaneous,
                "forwarding"
            );
            listeners.push((index, listener));
        }

        Ok(Self { handler, listeners })
    }

    /// Local addresses of the bound listeners, in rule order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|(_, l)| l.local_addr().ok())
            .collect()
    }

    /// Spawn one accept loop per listener.
    ///
    /// The loops run until the runtime shuts down.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        self.listeners
            .into_iter()
            .map(|(index, listener)| {
                let handler = self.handler.clone();
                tokio::spawn(accept_loop(listener, index, handler))
            })
            .collect()
    }
}

/// Bind one listener. [`BIND_ALL`] falls back to `0.0.0.0` on hosts where
/// IPv6 cannot be bound.
async fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Err(e) if addr.ip() == BIND_ALL && !port_unavailable(&e) => {
            debug!(port = addr.port(), error = %e, "IPv6 unavailable, listening on IPv4 only");
            TcpListener::bind((Ipv4Addr::UNSPECIFIED, addr.port())).await
        }
        result => result,
    }
}

/// Errors that would fail the same way on any address family.
fn port_unavailable(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied)
}

/// Accept connections forever, handing each one to its own task.
///
/// Accept errors are logged and never end the loop.
async fn accept_loop(listener: TcpListener, index: RuleIndex, handler: Arc<ConnectionHandler>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(index, peer = %peer, "inbound connection");
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(e) = handler.handle(stream, index).await {
                        warn!(index, peer = %peer, error = %e, "connection handling failed");
                    }
                });
            }
            Err(e) => {
                warn!(index, error = %e, "error on accepting connection");
            }
        }
    }
}
