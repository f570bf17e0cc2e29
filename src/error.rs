//! Tagged error model (`spec.md` §4.8).
//!
//! Every error the crate surfaces to a caller is a [`GatewayError`] variant
//! with a stable string `code()`, an optional HTTP `status_code()`, and the
//! original cause attached via `#[source]` where one exists. Internal
//! plumbing (subprocess spawn, pipe copy, header parsing) uses
//! `anyhow::Result` the way the teacher's `smart_git` module does, and is
//! folded into the nearest variant at the module boundary.

use thiserror::Error;

/// The crate's tagged error type. See `spec.md` §4.8 for the kind table.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Frame length header unparseable, in `1..3`, or exceeds the buffer
    /// with no truncation tolerated.
    #[error("invalid pkt-line frame: {reason}")]
    InvalidPacket { reason: String },

    /// Stream ended with a partial frame outstanding.
    #[error("stream ended with an incomplete pkt-line frame")]
    IncompletePacket,

    /// Backend returned a <300 status with no body.
    #[error("backend returned status {status} with no response body")]
    InvalidBodyFor2xx { status: u16 },

    /// A frame matched the pkt-line header but not the service grammar.
    ///
    /// Per `spec.md` §9's Open Question resolution this variant is
    /// constructed but never raised by the bundled parser (unmatched
    /// frames are silently ignored); it remains available for embedders
    /// who want the stricter historical behaviour.
    #[error("pkt-line frame did not match the {service} command grammar: {line:?}")]
    MalformedCommand { service: &'static str, line: String },

    /// A serial `onUsable` middleware observer threw.
    #[error("onUsable middleware observer failed")]
    UsableSignalFailure {
        #[source]
        inner: anyhow::Error,
    },

    /// A parallel `onComplete` middleware observer threw.
    #[error("onComplete middleware observer failed")]
    CompleteSignalFailure {
        #[source]
        inner: anyhow::Error,
    },

    /// A local `git` subprocess exited non-zero when its output was
    /// expected.
    #[error("git {service} exited with status {exit_code:?}: {stderr}")]
    GitExecutionFailure {
        service: &'static str,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// An overridden controller method (`checkForAuth`, `checkIfEnabled`,
    /// `checkIfExists`) threw.
    #[error("overridden controller method {method_name} failed")]
    ProxyMethodFailure {
        method_name: &'static str,
        #[source]
        inner: anyhow::Error,
    },

    /// The backend's upstream HTTP call or local I/O failed outright.
    #[error("backend failed to serve the request")]
    BackendFailure {
        #[source]
        inner: anyhow::Error,
    },
}

impl GatewayError {
    /// Stable machine-readable code, suitable for logs and client-facing
    /// diagnostics.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPacket { .. } => "invalid_packet",
            Self::IncompletePacket => "incomplete_packet",
            Self::InvalidBodyFor2xx { .. } => "invalid_body_for_2xx",
            Self::MalformedCommand { .. } => "malformed_command",
            Self::UsableSignalFailure { .. } => "usable_signal_failure",
            Self::CompleteSignalFailure { .. } => "complete_signal_failure",
            Self::GitExecutionFailure { .. } => "git_execution_failure",
            Self::ProxyMethodFailure { .. } => "proxy_method_failure",
            Self::BackendFailure { .. } => "backend_failure",
        }
    }

    /// The HTTP status this error implies, if any. Controllers consult this
    /// when marking a context `Failure` after a backend throw (`spec.md`
    /// §4.6 `accept`).
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::InvalidPacket { .. }
            | Self::IncompletePacket
            | Self::InvalidBodyFor2xx { .. }
            | Self::MalformedCommand { .. } => Some(400),
            Self::GitExecutionFailure { .. }
            | Self::UsableSignalFailure { .. }
            | Self::CompleteSignalFailure { .. }
            | Self::ProxyMethodFailure { .. }
            | Self::BackendFailure { .. } => Some(500),
        }
    }
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;
