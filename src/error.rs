//! Error type shared by every operation in the crate.
//!
//! Failures are grouped the same way the call boundary reports them:
//! handles that are not usable, allocations the backend refused,
//! bindings that could not be resolved, and work the backend rejected.
//! None of them are fatal; the object an operation was called on is
//! left as it was.

use std::path::PathBuf;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by [`crate::Context`], [`crate::Buffer`] and
/// [`crate::ComputeShader`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no suitable GPU adapter found: {0}")]
    NoAdapter(#[from] wgpu::RequestAdapterError),

    #[error("selected adapter '{0}' does not support compute shaders")]
    ComputeUnsupported(String),

    #[error("failed to request GPU device: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),

    #[error("failed to allocate a {size}-byte device buffer: {reason}")]
    Allocation { size: u64, reason: String },

    #[error("buffer has no device allocation")]
    Unallocated,

    #[error("buffer bound to slot {slot} has no device allocation (released or never sized)")]
    Released { slot: u32 },

    #[error("no kernel has been loaded")]
    NoKernel,

    #[error("binding '{tag}' is not declared in the kernel")]
    BindingNotFound { tag: String },

    #[error("slot {slot} is not declared in group 0 of the kernel")]
    SlotNotDeclared { slot: u32 },

    #[error("slot {slot} ('{name}') is declared by the kernel but has no buffer bound")]
    UnboundSlot { slot: u32, name: String },

    #[error("binding '{name}' lives in group {group}; only group 0 is addressable")]
    UnsupportedGroup { group: u32, name: String },

    #[error("entry point '{0}' is not a compute function of the kernel")]
    UnknownEntryPoint(String),

    #[error("dispatch of ({x}, {y}, {z}) work groups exceeds the per-dimension limit {limit}")]
    WorkgroupLimit { x: u32, y: u32, z: u32, limit: u32 },

    #[error("offset {offset} is not a multiple of {alignment} bytes")]
    Misaligned { offset: u64, alignment: u64 },

    #[error("range {offset}..{end} is outside the {capacity}-byte allocation")]
    OutOfBounds { offset: u64, end: u64, capacity: u64 },

    #[error("backend rejected the submitted work: {0}")]
    Submission(String),

    #[error("buffer mapping failed: {0}")]
    BufferMap(#[from] wgpu::BufferAsyncError),

    #[error("device poll failed: {0}")]
    Poll(#[from] wgpu::PollError),

    #[error("failed to read kernel file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("worker thread exited before reporting completion")]
    WorkerLost,
}

impl Error {
    /// True for the errors the binding layer reports: a tag or slot the
    /// kernel does not declare, or a declared slot left unbound.
    pub fn is_binding_error(&self) -> bool {
        matches!(
            self,
            Error::BindingNotFound { .. }
                | Error::SlotNotDeclared { .. }
                | Error::UnboundSlot { .. }
                | Error::UnsupportedGroup { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_errors_are_classified() {
        assert!(Error::BindingNotFound { tag: "inp".into() }.is_binding_error());
        assert!(Error::UnboundSlot { slot: 1, name: "out".into() }.is_binding_error());
        assert!(!Error::Unallocated.is_binding_error());
        assert!(!Error::Submission("boom".into()).is_binding_error());
    }

    #[test]
    fn messages_name_the_offending_binding() {
        let err = Error::UnboundSlot { slot: 3, name: "weights".into() };
        assert_eq!(
            err.to_string(),
            "slot 3 ('weights') is declared by the kernel but has no buffer bound"
        );
    }
}
