//! # Instance Initializer
//!
//! The one-shot handshake: resolve the import set, instantiate the module,
//! and work out which memory (if any) the host may view directly.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use wasmtime::Engine;
use wasmtime::Linker;
use wasmtime::SharedMemory;
use wasmtime::Store;
use wasmtime::UpdateDeadline;

use crate::config::SandboxConfig;
use crate::context::SandboxCtx;
use crate::fault::Fault;
use crate::imports::ImportResolver;
use crate::imports::ImportSet;
use crate::imports::MEMORY_NAME;
use crate::message::InitMessage;
use crate::state::Ready;

pub type Result<T> = std::result::Result<T, Fault>;

/// What the initializer needs from its sandbox.
pub(crate) struct Initializer<'a> {
    pub engine: &'a Engine,
    pub config: &'a SandboxConfig,
    pub resolver: &'a dyn ImportResolver,
    pub terminated: &'a Arc<AtomicBool>,
}

impl Initializer<'_> {
    /// Resolves imports and instantiates the module.
    pub async fn instantiate(&self, message: InitMessage) -> Result<Ready> {
        let InitMessage { module, imports_url } = message;

        let imports = match imports_url {
            Some(locator) => {
                let imports = self
                    .resolver
                    .resolve(&locator, self.engine)
                    .await
                    .map_err(|source| Fault::ImportResolution { locator: locator.clone(), source })?;
                if imports.is_empty() {
                    tracing::debug!(%locator, "locator resolved to no imports");
                }
                imports
            }
            None => ImportSet::new(),
        };

        let mut store = Store::new(self.engine, SandboxCtx::new(self.config, Arc::clone(self.terminated)));
        store.limiter(|ctx| &mut ctx.limits);

        // only a terminated sandbox stops; other sandboxes on the engine just re-arm
        store.set_epoch_deadline(1);
        store.epoch_deadline_callback(|ctx| {
            if ctx.data().is_terminated() {
                Err(wasmtime::Error::msg("sandbox terminated"))
            } else {
                Ok(UpdateDeadline::Continue(1))
            }
        });

        let mut linker = Linker::new(self.engine);
        let owned_memory = imports.install(&mut linker, &mut store).map_err(Fault::Link)?;

        let instance = linker
            .instantiate(&mut store, module.module())
            .map_err(Fault::Instantiation)?;

        tracing::info!(module = module.name(), imports = imports.len(), "instantiated");
        Ok(Ready {
            store,
            instance,
            imports,
            owned_memory,
        })
    }

    /// The memory to hand back in the handshake reply.
    ///
    /// Withheld when isolation is explicitly off. Only a shared memory can be
    /// handed over at all; an owned memory lives and dies with the store.
    pub fn exposed_memory(&self, ready: &mut Ready) -> Option<SharedMemory> {
        if !self.config.exposes_shared_memory() {
            return None;
        }
        // a declared owned memory is the sandbox memory, whatever is exported
        if ready.owned_memory.is_some() {
            return None;
        }
        ready
            .imports
            .declared_memory()
            .cloned()
            .or_else(|| ready.instance.get_shared_memory(&mut ready.store, MEMORY_NAME))
    }
}
