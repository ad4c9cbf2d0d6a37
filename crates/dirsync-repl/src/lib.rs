#![warn(missing_docs)]

//! dirsync replication subsystem: multi-master directory replication with
//! change sequence numbers, per-attribute historical ledgers and naming
//! conflict resolution.

pub mod backend;
pub mod config;
pub mod csn;
pub mod csn_generator;
pub mod dn;
pub mod domain;
pub mod entry;
pub mod error;
pub mod historical;
pub mod message;
pub mod operation;
pub mod pending;
pub mod registry;
pub mod resolver;
pub mod schema;
pub mod server_state;

pub use backend::{Backend, InMemoryBackend, ResultCode};
pub use config::{DomainConfig, ReplConfig};
pub use csn::{Csn, ReplicaId};
pub use domain::{DomainChannels, DomainMonitor, DomainState, ReplicationDomain};
pub use error::{ReplError, Result};
pub use message::UpdateMsg;
pub use registry::DomainRegistry;
