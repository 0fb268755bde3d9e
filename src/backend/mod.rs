//! The collaborator that actually owns mind-map documents.
//!
//! The core only ever goes through [`Backend`]: allocate a handle per session,
//! execute named actions against it, release it. Calls are blocking and are
//! always made from a worker thread.

pub mod memory;
pub mod process;
#[cfg(test)]
pub mod testing;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::SessionConfig;

pub use memory::MemoryBackend;
pub use process::ProcessBackend;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    Init(String),

    #[error("{0}")]
    Call(String),

    #[error("Session backend has already been released")]
    Released,

    #[error("Backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait Backend: Send + Sync + 'static {
    /// Exclusively owned by one session, never shared between two.
    type Handle: Send + 'static;

    fn name(&self) -> &'static str;

    /// One-time check at process startup.
    fn startup(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn init(&self, config: &SessionConfig) -> Result<Self::Handle, BackendError>;

    fn execute(
        &self,
        handle: &mut Self::Handle,
        action: &str,
        params: &Map<String, Value>,
    ) -> Result<Value, BackendError>;

    fn release(&self, handle: Self::Handle);

    /// Counterpart of `startup`, run once after every session is released.
    fn shutdown(&self) {}
}
