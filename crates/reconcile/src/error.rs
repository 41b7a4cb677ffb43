//! Error types for reconciling a service against its remote versions.

use thiserror::Error;

/// Broad classification of an [`Error`], used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// A record could not be reduced to an identity key
    Identity,
    /// The declared state or handler registry is malformed
    Configuration,
    /// A remote create/update/delete/batch call failed
    Mutation,
    /// The built version was rejected by remote validation
    Validation,
    /// Activation failed after a successful validation
    Activation,
    /// An asynchronous provisioning step failed or never finished
    Provisioning,
    /// Any other remote failure
    Remote,
}

impl ErrorCategory {
    /// Whether a draft version may have been left partially modified.
    pub fn leaves_draft(&self) -> bool {
        matches!(
            self,
            Self::Mutation | Self::Validation | Self::Activation | Self::Provisioning
        )
    }

    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Identity => "Record identity missing",
            Self::Configuration => "Invalid configuration",
            Self::Mutation => "Remote change rejected",
            Self::Validation => "Version failed validation",
            Self::Activation => "Version activation failed",
            Self::Provisioning => "Remote provisioning failed",
            Self::Remote => "Remote call failed",
        }
    }

    /// Get actionable advice for resolving this error category.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Identity => "Give every collection entry a non-empty identity field",
            Self::Configuration => "Fix the declared configuration and run again",
            Self::Mutation => {
                "Inspect the draft version; the next run clones or reuses it and retries"
            }
            Self::Validation => "Fix the reported problem; the draft is kept for inspection",
            Self::Activation => "The version is validated but inactive; run again to activate",
            Self::Provisioning => "Check the deployment status on the remote side",
            Self::Remote => "Check connectivity and credentials, then retry",
        }
    }
}

/// Errors returned by a [`Transport`](crate::Transport) implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The addressed remote object does not exist
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of object, e.g. "service" or "backends"
        kind: String,
        /// Identifier that was looked up
        id: String,
    },

    /// The remote side refused the request
    #[error("request rejected: {message}")]
    Rejected {
        /// Message supplied by the remote side
        message: String,
    },

    /// The remote side could not be reached or failed internally
    #[error("remote unavailable: {message}")]
    Unavailable {
        /// Details about the failure
        message: String,
    },
}

impl TransportError {
    /// Build a [`TransportError::NotFound`].
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Build a [`TransportError::Rejected`].
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// Whether the remote object was already absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors that can occur while diffing, processing or activating a version.
#[derive(Debug, Error)]
pub enum Error {
    /// A record could not be reduced to an identity key
    #[error("record has no usable identity in field `{field}`: {reason}")]
    Identity {
        /// Field the identity was read from
        field: String,
        /// Why the field could not be used
        reason: String,
    },

    /// A remote call outside of a handler's mutation loop failed
    #[error("remote call failed: {0}")]
    Transport(#[from] TransportError),

    /// A handler's remote create/update/delete failed
    #[error("{handler} `{identity}` on version {version}: {source}")]
    Mutation {
        /// State key of the handler that issued the call
        handler: String,
        /// Identity of the record (or batch range) being changed
        identity: String,
        /// Draft version the change targeted
        version: u32,
        /// Underlying remote error
        source: TransportError,
    },

    /// The built version failed remote validation
    #[error("version {version} is invalid: {message}")]
    Validation {
        /// Version that failed validation
        version: u32,
        /// Message supplied by the remote side, verbatim
        message: String,
    },

    /// Activation failed after the version validated
    #[error("activating version {version} failed: {source}")]
    Activation {
        /// Version that could not be activated
        version: u32,
        /// Underlying remote error
        source: TransportError,
    },

    /// An asynchronous step reached a terminal status other than the target
    #[error("{identity} on version {version} ended in status `{status}`: {message}")]
    DeploymentFailed {
        /// What was being waited for
        identity: String,
        /// Version the step belongs to
        version: u32,
        /// Terminal status observed
        status: String,
        /// Message associated with the status
        message: String,
    },

    /// An asynchronous step did not finish in time
    #[error("timed out after {elapsed_ms} ms waiting for {identity} on version {version} (last status `{last_status}`)")]
    Timeout {
        /// What was being waited for
        identity: String,
        /// Version the step belongs to
        version: u32,
        /// Last status observed before giving up
        last_status: String,
        /// Time spent waiting
        elapsed_ms: u128,
    },

    /// Batch dispatch was asked to use chunks of size zero
    #[error("batch size must be greater than zero")]
    InvalidBatchSize,

    /// A handler is registered before a handler it depends on
    #[error("handler `{handler}` depends on `{dependency}`, which is not registered before it")]
    HandlerOrder {
        /// Handler with the unmet dependency
        handler: String,
        /// Missing or misplaced dependency
        dependency: String,
    },

    /// The declared state does not match the registered schema
    #[error("invalid declared state: {0}")]
    Schema(String),

    /// A record could not be converted to or from its typed form
    #[error("invalid {kind} record `{identity}`: {reason}")]
    Record {
        /// State key of the collection
        kind: String,
        /// Identity of the record, if known
        identity: String,
        /// Conversion failure
        reason: String,
    },

    /// A state value has an unexpected shape
    #[error("state key `{key}`: {reason}")]
    State {
        /// Offending state key
        key: String,
        /// What was wrong with it
        reason: String,
    },
}

impl Error {
    /// Get the error category for reporting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Identity { .. } => ErrorCategory::Identity,
            Error::Mutation { .. } => ErrorCategory::Mutation,
            Error::Validation { .. } => ErrorCategory::Validation,
            Error::Activation { .. } => ErrorCategory::Activation,
            Error::DeploymentFailed { .. } | Error::Timeout { .. } => ErrorCategory::Provisioning,
            Error::Transport(_) => ErrorCategory::Remote,
            Error::InvalidBatchSize
            | Error::HandlerOrder { .. }
            | Error::Schema(_)
            | Error::Record { .. }
            | Error::State { .. } => ErrorCategory::Configuration,
        }
    }

    /// Whether the remote object addressed by this error was absent.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Transport(e) | Error::Mutation { source: e, .. } => e.is_not_found(),
            _ => false,
        }
    }
}

/// Result type for reconcile operations.
pub type Result<T> = std::result::Result<T, Error>;
