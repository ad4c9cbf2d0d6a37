//! Error types for the replication subsystem.

use crate::csn::Csn;
use thiserror::Error;

/// Errors that can occur in the replication subsystem.
#[derive(Debug, Error)]
pub enum ReplError {
    /// A distinguished name could not be parsed.
    #[error("invalid DN {dn:?}: {reason}")]
    InvalidDn {
        /// The offending DN text.
        dn: String,
        /// Why parsing failed.
        reason: String,
    },

    /// A CSN could not be decoded from its wire or string form.
    #[error("invalid CSN: {msg}")]
    InvalidCsn {
        /// Error message describing the issue.
        msg: String,
    },

    /// The historical attribute of an entry is malformed.
    #[error("historical decode error: {msg}")]
    HistoricalDecode {
        /// Error message describing the malformed value.
        msg: String,
    },

    /// A commit or removal referenced a CSN that is not pending.
    #[error("CSN {csn} is not pending")]
    NotPending {
        /// The CSN that was not found.
        csn: Csn,
    },

    /// No replication domain is registered for the given base DN.
    #[error("unknown replication domain: {base_dn}")]
    UnknownDomain {
        /// The base DN that was looked up.
        base_dn: String,
    },

    /// A replication domain is already registered for the given base DN.
    #[error("replication domain already registered: {base_dn}")]
    DomainExists {
        /// The base DN that is already taken.
        base_dn: String,
    },

    /// An internal channel was closed by its peer.
    #[error("channel closed: {msg}")]
    ChannelClosed {
        /// Which channel was closed.
        msg: String,
    },

    /// Configuration is invalid.
    #[error("configuration error: {msg}")]
    Config {
        /// Error message describing the invalid setting.
        msg: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Replication domain was shut down.
    #[error("replication domain shut down")]
    Shutdown,
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ReplError>;
