//! Mountpath registry for the tidemark storage target.
//!
//! A *mountpath* is a directory that is the root of one mounted filesystem
//! used by the target. [`MountedFs`] tracks the available and disabled
//! mountpaths, maps object paths back to the mountpath that owns them, and
//! remembers the backing filesystem of each mountpath so that disk-level
//! services (utilization sampling, flush sizing) can key on it.
//!
//! The registry itself never pushes notifications; components that maintain
//! per-mountpath state consume [`MountpathEvent`] values through their own
//! ingress and ask the registry for identity via [`MountedFs::lookup`] and
//! [`MountedFs::resolve`].

mod mounted;
pub mod times;

pub use mounted::{FsError, MountedFs, MountpathInfo};

/// A requested change to the set of active mountpaths.
///
/// Carried as plain data so any long-running service can service the change
/// asynchronously from its own event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountpathEvent {
    Add(String),
    Remove(String),
    Enable(String),
    Disable(String),
}

impl MountpathEvent {
    /// The mountpath this event refers to.
    pub fn mountpath(&self) -> &str {
        match self {
            MountpathEvent::Add(m)
            | MountpathEvent::Remove(m)
            | MountpathEvent::Enable(m)
            | MountpathEvent::Disable(m) => m,
        }
    }
}
