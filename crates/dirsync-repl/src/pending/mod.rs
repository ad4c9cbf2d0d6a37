//! Pending-change buffers.
//!
//! Local writes wait in [`LocalPendingChanges`] until every older local CSN
//! has committed, so the outbound stream is strictly CSN ordered. Remote
//! updates wait in [`RemotePendingChanges`] until the changes they depend on
//! have been replayed.

mod local;
mod remote;

pub use local::LocalPendingChanges;
pub use remote::RemotePendingChanges;
