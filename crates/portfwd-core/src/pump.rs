//! Byte pump: the copy loop for one half-connection.
//!
//! A pump reads from its source into a 32 KiB buffer and writes exactly the
//! bytes read to its destination until one of:
//!
//! - the source reaches end-of-stream,
//! - a read or write fails,
//! - a socket's idle deadline expires (when an [`IdleTimeout`] is configured),
//! - the sibling pump of the same connection fires the shared
//!   [`CloseSignal`].
//!
//! # Deadlines
//!
//! Deadlines belong to sockets, not pumps. Each socket of a connection has
//! one [`SocketDeadline`] that both pumps see: the pump reading from the
//! client and the pump writing to the client move the same deadline. With an
//! idle timeout configured, the source's deadline is set to `now + timeout`
//! before every read and the destination's before the write that follows a
//! non-empty read. A pending read or write waits on its socket's current
//! deadline, so traffic in either direction keeps both pumps alive.
//!
//! Arming fails if the connection has already been closed by the sibling
//! pump, which is the expected outcome during teardown.
//!
//! # Closing
//!
//! Both pumps of a connection share one [`CloseSignal`]. Whichever exits
//! first fires it; the other observes it in the read, write or deadline wait
//! it is blocked on and exits too. Each pump owns the read half of its source
//! and the write half of its destination, so once both have returned, both
//! sockets are closed.

use crate::rules::IdleTimeout;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::{self, Instant};

/// Size of the copy buffer (32 KiB).
pub const BUFFER_SIZE: usize = 32 * 1024;

/// Per-connection close flag shared by the two pumps of a connection.
///
/// Firing it is idempotent.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Returns `true` only for the call that fired it.
    pub fn close(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the signal has been fired.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        // `self` keeps the sender alive, so this only returns on close.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Idle deadline of one socket, shared by every pump that reads or writes it.
///
/// Setting it moves the deadline for all pending and future operations on
/// the socket. Unset means no deadline.
#[derive(Debug, Clone)]
pub struct SocketDeadline {
    tx: Arc<watch::Sender<Option<Instant>>>,
}

impl SocketDeadline {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self, at: Instant) {
        self.tx.send_replace(Some(at));
    }

    /// Resolve once the current deadline passes without having been moved.
    pub async fn expired(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            let Some(at) = current else {
                // `self` keeps the sender alive, so this only returns on a set.
                let _ = rx.changed().await;
                continue;
            };
            let fired = tokio::select! {
                _ = time::sleep_until(at) => true,
                _ = rx.changed() => false,
            };
            if fired && !rx.has_changed().unwrap_or(false) {
                return;
            }
        }
    }
}

impl Default for SocketDeadline {
    fn default() -> Self {
        Self::new()
    }
}

/// What a pump shares with its sibling: the close flag and the deadlines of
/// the two sockets it touches.
#[derive(Debug, Clone, Default)]
pub struct PumpLink {
    pub close: CloseSignal,
    /// Deadline of the socket the pump reads from.
    pub source: SocketDeadline,
    /// Deadline of the socket the pump writes to.
    pub destination: SocketDeadline,
}

impl PumpLink {
    /// A link for a pump with no sibling.
    pub fn new() -> Self {
        Self::default()
    }

    /// Links for both directions of one connection between sockets `a` and
    /// `b`. The first is for the pump copying `a` into `b`, the second for the
    /// pump copying `b` into `a`.
    pub fn pair() -> (Self, Self) {
        let close = CloseSignal::new();
        let a = SocketDeadline::new();
        let b = SocketDeadline::new();
        let forward = Self {
            close: close.clone(),
            source: a.clone(),
            destination: b.clone(),
        };
        let backward = Self {
            close,
            source: b,
            destination: a,
        };
        (forward, backward)
    }
}

/// Which end of the pump an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Destination,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => f.write_str("src"),
            Side::Destination => f.write_str("dest"),
        }
    }
}

/// Why a pump stopped.
///
/// Used for logging only: every variant leads to the same teardown.
#[derive(Debug)]
pub enum Termination {
    /// The source reached end-of-stream. Not an error.
    Eof,
    /// No read or write completed before the idle deadline.
    TimedOut { side: Side },
    /// A deadline could not be armed because the connection was already
    /// closed by the sibling pump.
    DeadlineClosed { side: Side },
    /// A deadline could not be armed for any other reason.
    DeadlineFailed { side: Side, reason: String },
    /// The sibling pump closed the connection while this one was blocked.
    Closed,
    /// The destination stopped accepting bytes before the whole chunk was
    /// written.
    ShortWrite { expected: usize, written: usize },
    /// A read or write failed.
    Io { side: Side, error: io::Error },
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Eof => f.write_str("end of stream"),
            Termination::TimedOut { side } => write!(f, "i/o timeout on {side}"),
            Termination::DeadlineClosed { side } => {
                write!(f, "cannot set timeout for {side}: use of closed connection")
            }
            Termination::DeadlineFailed { side, reason } => {
                write!(f, "cannot set timeout for {side}: {reason}")
            }
            Termination::Closed => f.write_str("use of closed connection"),
            Termination::ShortWrite { expected, written } => {
                write!(f, "short write ({written} of {expected} bytes)")
            }
            Termination::Io { side, error } => write!(f, "{side}: {error}"),
        }
    }
}

/// Outcome of one pump invocation.
#[derive(Debug)]
pub struct PumpReport {
    /// Bytes successfully written to the destination.
    pub bytes_written: u64,
    pub termination: Termination,
}

/// Copy `source` into `destination` until the half-connection ends.
///
/// Fires the link's close signal on the way out so the sibling pump stops as
/// well. Both endpoints are dropped when this returns.
pub async fn pump<R, W>(
    mut source: R,
    mut destination: W,
    idle: IdleTimeout,
    link: PumpLink,
) -> PumpReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut bytes_written = 0u64;
    let result = relay(&mut source, &mut destination, idle, &link, &mut bytes_written).await;
    let termination = match result {
        Ok(()) => Termination::Eof,
        Err(t) => t,
    };
    link.close.close();
    PumpReport {
        bytes_written,
        termination,
    }
}

async fn relay<R, W>(
    source: &mut R,
    destination: &mut W,
    idle: IdleTimeout,
    link: &PumpLink,
    bytes_written: &mut u64,
) -> Result<(), Termination>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        arm_deadline(idle, &link.close, &link.source, Side::Source)?;
        let read = source.read(&mut buf);
        let n = bounded(read, &link.source, &link.close, Side::Source).await?;
        if n == 0 {
            return Ok(());
        }

        arm_deadline(idle, &link.close, &link.destination, Side::Destination)?;
        let mut offset = 0;
        while offset < n {
            let w = bounded(
                destination.write(&buf[offset..n]),
                &link.destination,
                &link.close,
                Side::Destination,
            )
            .await?;
            if w == 0 {
                return Err(Termination::ShortWrite {
                    expected: n,
                    written: offset,
                });
            }
            offset += w;
            *bytes_written += w as u64;
        }
    }
}

/// Move the socket's deadline to `now + timeout`, if a timeout is set.
fn arm_deadline(
    idle: IdleTimeout,
    close: &CloseSignal,
    deadline: &SocketDeadline,
    side: Side,
) -> Result<(), Termination> {
    let Some(timeout) = idle.duration() else {
        return Ok(());
    };
    if close.is_closed() {
        return Err(Termination::DeadlineClosed { side });
    }
    let at = Instant::now()
        .checked_add(timeout)
        .ok_or_else(|| Termination::DeadlineFailed {
            side,
            reason: format!("deadline {timeout:?} from now is out of range"),
        })?;
    deadline.set(at);
    Ok(())
}

/// Run one I/O operation, bounded by the socket's deadline and the close
/// signal.
async fn bounded<T>(
    op: impl Future<Output = io::Result<T>>,
    deadline: &SocketDeadline,
    close: &CloseSignal,
    side: Side,
) -> Result<T, Termination> {
    tokio::select! {
        biased;
        result = op => result.map_err(|error| Termination::Io { side, error }),
        _ = close.closed() => Err(Termination::Closed),
        _ = deadline.expired() => Err(Termination::TimedOut { side }),
    }
}
