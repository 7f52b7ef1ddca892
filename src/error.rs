//! Error types shared by the dispatcher, units and loaders.
//!
//! Empty or full queues are never errors: callers block on them. What
//! surfaces here is transport breakage, cancellation and malformed input.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::types::ZoneId;

/// Failures of the in-process message transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer's mailbox has been dropped.
    #[error("peer disconnected")]
    Disconnected,

    /// No reply arrived within the request deadline.
    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

/// Errors seen by activities that talk to the dispatcher.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The dispatcher is shutting down and closed its queues.
    #[error("dispatcher closed")]
    Closed,

    #[error("zone {0} is not in the zone table")]
    UnknownZone(ZoneId),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl DispatchError {
    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            DispatchError::Transport(TransportError::Disconnected) => "transport_disconnected",
            DispatchError::Transport(TransportError::Timeout(_)) => "transport_timeout",
            DispatchError::Closed => "dispatcher_closed",
            DispatchError::UnknownZone(_) => "unknown_zone",
            DispatchError::UnexpectedReply(_) => "unexpected_reply",
        }
    }
}

/// Errors raised while loading the zone table.
#[derive(Error, Debug)]
pub enum ZoneError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("zone {0} defined twice")]
    Duplicate(ZoneId),
}

/// Errors raised while reading incident records.
#[derive(Error, Debug)]
pub enum IncidentError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

/// Setup and orchestration failures of a simulation run.
#[derive(Error, Debug)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("zone table: {0}")]
    Zones(#[from] ZoneError),

    #[error("incidents: {0}")]
    Incidents(#[from] IncidentError),

    #[error("could not spawn thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("at least one unit is required")]
    NoUnits,

    #[error("{0} thread panicked")]
    Panicked(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_convert_into_dispatch_errors() {
        let err: DispatchError = TransportError::Disconnected.into();
        assert_eq!(err.as_label(), "transport_disconnected");
        let err: DispatchError = TransportError::Timeout(Duration::from_millis(5)).into();
        assert_eq!(err.as_label(), "transport_timeout");
    }

    #[test]
    fn parse_errors_name_the_line() {
        let err = ZoneError::Parse {
            line: 3,
            reason: "expected 3 fields".to_string(),
        };
        assert_eq!(err.to_string(), "line 3: expected 3 fields");
    }
}
