//! Per-connection lifecycle.
//!
//! For every accepted inbound connection:
//!
//! 1. consult the [`AdmissionController`]; reject and close if the rule is full,
//! 2. dial the rule's forward address once (no retry); close on failure,
//! 3. count both half-connections (`+2`),
//! 4. spawn one byte pump per direction, each holding a
//!    [`HalfConnectionSlot`] that releases its unit when the pump task ends.
//!    The pumps share a close signal and one idle deadline per socket.
//!
//! The handler returns as soon as the pumps are spawned.

use crate::admission::AdmissionController;
use crate::counter::{ConnectionCounter, HalfConnectionSlot};
use crate::error::{ForwardError, ForwardResult};
use crate::pump::{pump, PumpLink, PumpReport, Termination};
use crate::rules::{IdleTimeout, RuleIndex, RuleTable};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

/// What happened to an inbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The rule was at its cap; the inbound connection was closed without
    /// dialing. `connections` is the number of established connections seen.
    Rejected { connections: usize },
    /// The forward target could not be reached; the inbound connection was
    /// closed.
    DialFailed,
    /// Both pumps are running.
    Relaying,
}

/// Shared state for handling inbound connections across all rules.
#[derive(Debug)]
pub struct ConnectionHandler {
    rules: Arc<RuleTable>,
    counter: Arc<ConnectionCounter>,
    admission: AdmissionController,
    idle: IdleTimeout,
}

impl ConnectionHandler {
    /// Create a handler with a fresh, zeroed counter for `rules`.
    pub fn new(rules: Arc<RuleTable>, idle: IdleTimeout) -> Self {
        let counter = Arc::new(ConnectionCounter::new(rules.len()));
        let admission = AdmissionController::new(rules.clone(), counter.clone());
        Self {
            rules,
            counter,
            admission,
            idle,
        }
    }

    pub fn rules(&self) -> &Arc<RuleTable> {
        &self.rules
    }

    pub fn counter(&self) -> &Arc<ConnectionCounter> {
        &self.counter
    }

    pub fn idle_timeout(&self) -> IdleTimeout {
        self.idle
    }

    /// Run admission and dial for `inbound`, then launch the relay.
    ///
    /// Rejections and dial failures are logged here and reported as
    /// [`HandleOutcome`]s; in both cases `inbound` is closed on return.
    ///
    /// # Errors
    ///
    /// Only for an `index` with no rule or a corrupted counter.
    pub async fn handle(
        &self,
        inbound: TcpStream,
        index: RuleIndex,
    ) -> ForwardResult<HandleOutcome> {
        let rule = self
            .rules
            .get(index)
            .ok_or(ForwardError::UnknownRule(index))?;
        let label = rule.label();

        let admission = self.admission.admit(index)?;
        if !admission.allowed {
            info!(
                rule = %label,
                port = rule.listen_port,
                connections = admission.connections(),
                "connection limit reached"
            );
            return Ok(HandleOutcome::Rejected {
                connections: admission.connections(),
            });
        }

        let outbound = match dial(&rule.forward_address).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(rule = %label, error = %e, "error dialing remote host");
                return Ok(HandleOutcome::DialFailed);
            }
        };

        let (upstream_slot, downstream_slot) = self.counter.claim_pair(index)?;

        let client = describe(inbound.peer_addr());
        let target = describe(outbound.peer_addr());
        trace!(rule = %label, peer = %client, forward = %target, "accepted connection");

        let (client_read, client_write) = inbound.into_split();
        let (target_read, target_write) = outbound.into_split();
        let (upstream, downstream) = PumpLink::pair();

        spawn_half(
            HalfConnection {
                rule: label.clone(),
                from: client.clone(),
                to: target.clone(),
                slot: upstream_slot,
            },
            client_read,
            target_write,
            self.idle,
            upstream,
        );
        spawn_half(
            HalfConnection {
                rule: label,
                from: target,
                to: client,
                slot: downstream_slot,
            },
            target_read,
            client_write,
            self.idle,
            downstream,
        );

        Ok(HandleOutcome::Relaying)
    }
}

/// Open the outbound connection. Attempted exactly once.
async fn dial(addr: &str) -> ForwardResult<TcpStream> {
    TcpStream::connect(addr)
        .await
        .map_err(|source| ForwardError::Dial {
            addr: addr.to_string(),
            source,
        })
}

fn describe(addr: std::io::Result<SocketAddr>) -> String {
    addr.map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// One relay direction and the counter unit it holds.
struct HalfConnection {
    rule: String,
    from: String,
    to: String,
    slot: HalfConnectionSlot,
}

impl HalfConnection {
    /// Log how the pump ended, then release the counter unit.
    fn finish(self, report: &PumpReport) {
        let HalfConnection { rule, from, to, slot } = self;
        let bytes = report.bytes_written;

        match &report.termination {
            Termination::Eof => {}
            Termination::TimedOut { .. } => {
                debug!(rule = %rule, from = %from, to = %to, bytes, "connection timed out");
            }
            Termination::DeadlineClosed { .. } => {
                trace!(
                    rule = %rule,
                    from = %from,
                    error = %report.termination,
                    "deadline on closed connection"
                );
            }
            Termination::DeadlineFailed { .. } => {
                warn!(rule = %rule, from = %from, error = %report.termination, "deadline failed");
            }
            Termination::Closed | Termination::ShortWrite { .. } | Termination::Io { .. } => {
                trace!(
                    rule = %rule,
                    from = %from,
                    error = %report.termination,
                    bytes,
                    "relay error"
                );
            }
        }

        drop(slot);
        trace!(rule = %rule, from = %from, bytes, "closed connection");
    }
}

fn spawn_half<R, W>(
    half: HalfConnection,
    source: R,
    destination: W,
    idle: IdleTimeout,
    link: PumpLink,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let report = pump(source, destination, idle, link).await;
        half.finish(&report);
    });
}
