//! # Sandbox Configuration
//!
//! Settings fixed at spawn time, and the engine settings every sandbox
//! relies on.

use wasmtime::Engine;

#[derive(Clone, Debug)]
pub struct SandboxConfig {
    /// Thread name and `sandbox` span field.
    pub name: String,
    /// Whether the host and sandbox run with cross-origin isolation.
    ///
    /// Only an explicit `Some(false)` withholds shared memory from the
    /// handshake reply; `None` means unknown and behaves like `Some(true)`.
    pub cross_origin_isolated: Option<bool>,
    /// Ceiling on linear memory growth, in bytes.
    pub memory_limit: Option<usize>,
    /// How many unread faults the host handle keeps before dropping the oldest.
    pub fault_capacity: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            name: "sandbox".to_string(),
            cross_origin_isolated: None,
            memory_limit: None,
            fault_capacity: 64,
        }
    }
}

impl SandboxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn cross_origin_isolated(mut self, isolated: bool) -> Self {
        self.cross_origin_isolated = Some(isolated);
        self
    }

    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn fault_capacity(mut self, capacity: usize) -> Self {
        self.fault_capacity = capacity;
        self
    }

    /// Whether the handshake may hand shared memory to the host.
    pub fn exposes_shared_memory(&self) -> bool {
        self.cross_origin_isolated != Some(false)
    }

    /// Builds an engine suitable for sandboxes.
    ///
    /// Threads are enabled for shared memories. Epoch interruption is how a
    /// discarded sandbox gets its thread back from a call that never returns.
    pub fn engine() -> wasmtime::Result<Engine> {
        let mut config = wasmtime::Config::new();
        config.wasm_threads(true);
        config.epoch_interruption(true);
        Engine::new(&config)
    }
}
