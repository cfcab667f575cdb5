use thiserror::Error;

/// Errors produced by the forwarding engine.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("config error: {0}")]
    Config(String),

    /// `rule` is the 1-based position of the rule in the table.
    #[error("rule number {rule} {reason}")]
    InvalidRule { rule: usize, reason: String },

    #[error("cannot listen on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown rule index: {0}")]
    UnknownRule(usize),

    #[error("connection count for rule index {index} cannot move from {count} by {delta}")]
    CounterUnderflow {
        index: usize,
        count: usize,
        delta: isize,
    },
}

pub type ForwardResult<T> = Result<T, ForwardError>;
