//! # Sandbox State
//!
//! Which handler owns the primary channel.
//!
//! `Uninitialized` accepts exactly one successful `Init`; `Ready` dispatches
//! calls for the rest of the sandbox's life. There is no way back.

use wasmtime::Instance;
use wasmtime::Memory;
use wasmtime::Store;

use crate::context::SandboxCtx;
use crate::imports::ImportSet;

/// Everything the handshake produced. Created once, never replaced.
pub struct Ready {
    pub(crate) store: Store<SandboxCtx>,
    pub(crate) instance: Instance,
    pub(crate) imports: ImportSet,
    /// The non-shared memory the import set declared, created in `store`.
    pub(crate) owned_memory: Option<Memory>,
}

pub enum SandboxState {
    Uninitialized,
    Ready(Ready),
}

impl SandboxState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// Installs the handshake result. Refuses to replace an existing instance.
    pub(crate) fn transition(&mut self, ready: Ready) -> Result<(), Ready> {
        match self {
            Self::Uninitialized => {
                *self = Self::Ready(ready);
                Ok(())
            }
            Self::Ready(_) => Err(ready),
        }
    }

    pub(crate) fn ready_mut(&mut self) -> Option<&mut Ready> {
        match self {
            Self::Ready(ready) => Some(ready),
            Self::Uninitialized => None,
        }
    }
}
