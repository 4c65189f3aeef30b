//! Error taxonomy of the referee.
//!
//! Every variant except [`RefereeError::Configuration`] is scoped to a single run: the
//! scheduler catches it at the run boundary, logs it and drops the run from aggregation.
//! A configuration error aborts the whole batch before any process is spawned.

use std::{io, time::Duration};

use thiserror::Error;

/// Failure raised while setting up a batch or driving one run.
#[derive(Debug, Error)]
pub enum RefereeError {
    /// The executable of a judge or bot could not be started.
    #[error("could not launch {entity}: {source}")]
    Launch {
        /// Judge or bot name.
        entity: String,
        /// Underlying spawn error.
        #[source]
        source: io::Error,
    },

    /// A line was missing or did not follow the relay grammar.
    #[error("protocol violation from {entity}: {reason}")]
    Protocol {
        /// Judge or bot name.
        entity: String,
        /// What was wrong with the stream.
        reason: String,
    },

    /// The peer closed its input while the referee was writing to it.
    #[error("broken pipe while writing to {entity}: {source}")]
    BrokenPipe {
        /// Judge or bot name.
        entity: String,
        /// Underlying write error.
        #[source]
        source: io::Error,
    },

    /// No line arrived before the per-read deadline.
    #[error("{entity} did not answer within {after:?}")]
    Timeout {
        /// Judge or bot name.
        entity: String,
        /// The configured deadline.
        after: Duration,
    },

    /// The run was force-failed through its cancellation token.
    #[error("run cancelled while waiting on {entity}")]
    Cancelled {
        /// Judge or bot name.
        entity: String,
    },

    /// The batch cannot be scheduled at all.
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl RefereeError {
    pub(crate) fn protocol(entity: &str, reason: impl Into<String>) -> Self {
        RefereeError::Protocol {
            entity: entity.to_string(),
            reason: reason.into(),
        }
    }

    /// True when the error only invalidates the run it happened in.
    pub fn is_run_local(&self) -> bool {
        !matches!(self, RefereeError::Configuration(_))
    }

    /// Short name of the failure kind, used in logs and progress lines.
    pub fn kind(&self) -> &'static str {
        match self {
            RefereeError::Launch { .. } => "launch error",
            RefereeError::Protocol { .. } => "protocol error",
            RefereeError::BrokenPipe { .. } => "broken pipe",
            RefereeError::Timeout { .. } => "timeout",
            RefereeError::Cancelled { .. } => "cancelled",
            RefereeError::Configuration(_) => "configuration error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_configuration_errors_are_batch_fatal() {
        let launch = RefereeError::Launch {
            entity: "bot".into(),
            source: io::Error::new(io::ErrorKind::NotFound, "missing"),
        };
        assert!(launch.is_run_local());
        assert!(RefereeError::protocol("judge", "eof").is_run_local());
        assert!(!RefereeError::Configuration("no bots".into()).is_run_local());
    }

    #[test]
    fn messages_name_the_entity() {
        let err = RefereeError::protocol("judge", "expected an integer, got 'abc'");
        assert_eq!(
            err.to_string(),
            "protocol violation from judge: expected an integer, got 'abc'"
        );
        assert_eq!(err.kind(), "protocol error");
    }
}
