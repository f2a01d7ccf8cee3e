//! Error types for the bridge crate.

use thiserror::Error;

/// Bridge error type
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The engine rejected the module or failed to instantiate it
    #[error("instantiation failed: {0}")]
    InstantiationFailed(String),

    /// A required export was absent from the module
    #[error("missing export: {0}")]
    MissingExport(String),

    /// The placeholder name was never bound at load time
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    /// The handle was never registered by this bridge or has already been
    /// released (fabricated handle or use-after-release)
    #[error("unknown externref handle: {0}")]
    UnknownHandle(String),

    /// The sandboxed call trapped
    #[error("sandbox trap: {0}")]
    SandboxTrap(String),

    /// The call exceeded the configured wasm stack budget
    #[error("wasm stack exhausted")]
    StackExhausted,

    /// The identity bijection is broken; the instance is no longer trusted
    #[error("identity bridge consistency violation: {0}")]
    ConsistencyViolation(String),

    /// Linear memory access or scratch allocation failed
    #[error("memory error: {0}")]
    Memory(String),

    /// Argument list does not match the export's signature
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Operation on an instance that was already unloaded
    #[error("module instance already unloaded")]
    InstanceUnloaded,
}

impl BridgeError {
    /// Whether this error leaves the instance untrusted for further use.
    ///
    /// Only a broken bijection is fatal; everything else is recoverable at
    /// the call site.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::ConsistencyViolation(_))
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
