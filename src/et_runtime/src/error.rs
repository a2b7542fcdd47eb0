//! Error taxonomy of the host runtime.

use minion_rt::Fault;

/// Result of runtime API calls.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors during API calls.
///
/// Errors raised while an action executes are deferred on its stream and surface at the
/// next synchronization point of that stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Bad handle, null or out-of-range pointer, misaligned offset.
    #[error("invalid value: {0}")]
    InvalidValue(String),
    /// A memory region has no gap large enough.
    #[error("out of memory: {requested} bytes requested from the {region} region")]
    OutOfMemory {
        /// Region name.
        region: &'static str,
        /// Requested size in bytes.
        requested: u64,
    },
    /// The queried work has not executed yet.
    #[error("not ready")]
    NotReady,
    /// No registered image defines the kernel.
    #[error("unresolved kernel `{0}`")]
    UnresolvedKernel(String),
    /// Launch builder misuse or impossible launch geometry.
    #[error("launch configuration error: {0}")]
    ConfigurationError(String),
    /// The virtual queue rejected or lost a command.
    #[error("transport failure: {0}")]
    TransportFailure(String),
    /// The device reported a fault; the device is unusable afterwards.
    #[error("device fault: {0}")]
    DeviceFault(String),
}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::InvalidLaunch(msg) => Error::ConfigurationError(msg),
            fault => Error::DeviceFault(fault.to_string()),
        }
    }
}
