//! Error taxonomy shared by the client, transactions and remote handling.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use rpmostree_client::ShapeError;
use std::fmt;

/// Our generic result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a connection to the daemon could not be established or was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Problem {
    /// The caller is not allowed to talk to the daemon.
    AccessDenied,
    /// The daemon is not installed on this system.
    NotFound,
    /// The connection went away.
    Disconnected,
    Other,
}

impl Problem {
    /// Text suitable for showing in place of the deployment list.
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            Problem::AccessDenied => Some("Not authorized to update software on this system"),
            Problem::NotFound => Some("OSTree is not available on this system"),
            _ => None,
        }
    }

    /// Whether reconnecting could possibly help.
    pub fn is_final(&self) -> bool {
        matches!(self, Problem::NotFound)
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Problem::AccessDenied => "access-denied",
            Problem::NotFound => "not-found",
            Problem::Disconnected => "disconnected",
            Problem::Other => "internal-error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{message}")]
    Connection { problem: Problem, message: String },

    #[error("{0} not found")]
    NotFound(String),

    /// The daemon returned an error for a method call.
    #[error("{method} failed: {message}")]
    Call { method: String, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Process(String),

    #[error("transaction failed: {}", render_detail(.0))]
    Transaction(serde_json::Value),

    #[error("{running} is already in progress")]
    Busy { running: String },

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Connection failures with a well known cause carry the user facing
    /// text rather than the raw bus error.
    pub(crate) fn connection(problem: Problem, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = match problem.user_message() {
            Some(m) => {
                tracing::debug!("{problem}: {message}");
                m.to_string()
            }
            None => message,
        };
        Error::Connection { problem, message }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(message.into())
    }

    /// The connection problem, if this is a connection level failure.
    pub fn problem(&self) -> Option<Problem> {
        match self {
            Error::Connection { problem, .. } => Some(*problem),
            _ => None,
        }
    }
}

impl From<ShapeError> for Error {
    fn from(e: ShapeError) -> Self {
        Error::Protocol(e.to_string())
    }
}

fn render_detail(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        o => o.to_string(),
    }
}
