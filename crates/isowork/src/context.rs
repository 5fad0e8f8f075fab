//! Store context for the sandbox instance.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use wasmtime::StoreLimits;
use wasmtime::StoreLimitsBuilder;

use crate::config::SandboxConfig;

/// Per-sandbox state stored in the wasmtime `Store`.
///
/// The `terminated` flag is shared with the host handle. It is only read
/// from the epoch-deadline callback, so a running call notices it the next
/// time the engine epoch is bumped.
pub struct SandboxCtx {
    pub(crate) limits: StoreLimits,
    terminated: Arc<AtomicBool>,
}

impl SandboxCtx {
    pub fn new(config: &SandboxConfig, terminated: Arc<AtomicBool>) -> Self {
        let mut limits = StoreLimitsBuilder::new();
        if let Some(bytes) = config.memory_limit {
            limits = limits.memory_size(bytes);
        }

        Self {
            limits: limits.build(),
            terminated,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}
