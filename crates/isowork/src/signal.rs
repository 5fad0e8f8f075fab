//! # Signal host component
//!
//! Lets a guest hand string messages to the host, typically its panic text.
//!
//! The guest imports `env.sig(fatptr: i64)`, where the high 32 bits are the
//! address of a UTF-8 string in the declared memory and the low 32 bits are
//! its length. Messages are logged under the `wasm` target and captured in
//! memory for inspection.

use std::sync::Arc;
use std::sync::Mutex;

use wasmtime::SharedMemory;
use wasmtime::Val;
use wasmtime::ValType;

use crate::imports::ImportSet;
use crate::memory;

/// Splits a fat pointer into `(address, length)`.
pub fn split_fat_ptr(value: i64) -> (usize, usize) {
    let value = value as u64;
    ((value >> 32) as usize, (value & 0xffff_ffff) as usize)
}

/// Captures messages signalled by the guest.
#[derive(Clone, Debug, Default)]
pub struct Signal {
    messages: Arc<Mutex<Vec<String>>>,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every message received so far.
    pub fn messages(&self) -> Vec<String> {
        match self.messages.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Adds `env.sig` to `imports`, reading strings out of `memory`.
    pub fn link(&self, imports: ImportSet, memory: SharedMemory) -> ImportSet {
        let messages = Arc::clone(&self.messages);

        imports.func("env", "sig", &[ValType::I64], &[], move |_caller, params, _results| {
            let Some(Val::I64(fat_ptr)) = params.first() else {
                return Err(wasmtime::Error::msg("sig expects a single i64 argument"));
            };
            let (ptr, len) = split_fat_ptr(*fat_ptr);

            // copy out first: the guest may keep writing to shared memory
            let bytes = memory::read_shared(&memory, ptr, Some(len))
                .map_err(|fault| wasmtime::Error::msg(fault.to_string()))?;
            let message = String::from_utf8_lossy(&bytes).into_owned();

            tracing::info!(target: "wasm", "{}", message);
            messages
                .lock()
                .map_err(|_| wasmtime::Error::msg("signal log poisoned"))?
                .push(message);
            Ok(())
        })
    }
}
