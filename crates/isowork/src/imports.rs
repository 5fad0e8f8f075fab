//! # Import Sets
//!
//! The values a module is instantiated against, and how a sandbox finds
//! them from a locator string.
//!
//! An `ImportSet` is a description, not a linker: wasmtime functions and
//! globals belong to a store, so the set is installed into the sandbox's own
//! `Linker` and `Store` at instantiation. A plain memory is likewise only a
//! type until the store creates it. Shared memories are the exception; they
//! are engine-level objects and the same handle can be given to the host.

use std::sync::Arc;

use dashmap::DashMap;
use wasmtime::Caller;
use wasmtime::Engine;
use wasmtime::FuncType;
use wasmtime::Global;
use wasmtime::GlobalType;
use wasmtime::Linker;
use wasmtime::Memory;
use wasmtime::MemoryType;
use wasmtime::Mutability;
use wasmtime::SharedMemory;
use wasmtime::Store;
use wasmtime::Val;
use wasmtime::ValType;

use crate::context::SandboxCtx;
use crate::value::Value;

/// Namespace and name under which a module's memory is declared.
pub const MEMORY_MODULE: &str = "env";
pub const MEMORY_NAME: &str = "memory";

/// A host function callable from the guest.
pub type HostFn =
    Arc<dyn Fn(Caller<'_, SandboxCtx>, &[Val], &mut [Val]) -> wasmtime::Result<()> + Send + Sync>;

/// One importable value.
#[derive(Clone)]
pub enum ImportValue {
    Func {
        params: Vec<ValType>,
        results: Vec<ValType>,
        func: HostFn,
    },
    Memory(SharedMemory),
    /// A non-shared memory, created in the sandbox store at instantiation.
    OwnedMemory(MemoryType),
    Global { value: Value, mutable: bool },
}

#[derive(Clone)]
pub struct Import {
    pub module: String,
    pub name: String,
    pub value: ImportValue,
}

/// The imports of one instantiation.
#[derive(Clone, Default)]
pub struct ImportSet {
    imports: Vec<Import>,
}

impl ImportSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.imports.is_empty()
    }

    pub fn len(&self) -> usize {
        self.imports.len()
    }

    pub fn define(mut self, module: impl Into<String>, name: impl Into<String>, value: ImportValue) -> Self {
        self.imports.push(Import {
            module: module.into(),
            name: name.into(),
            value,
        });
        self
    }

    pub fn func<F>(
        self,
        module: impl Into<String>,
        name: impl Into<String>,
        params: &[ValType],
        results: &[ValType],
        func: F,
    ) -> Self
    where
        F: Fn(Caller<'_, SandboxCtx>, &[Val], &mut [Val]) -> wasmtime::Result<()> + Send + Sync + 'static,
    {
        let value = ImportValue::Func {
            params: params.to_vec(),
            results: results.to_vec(),
            func: Arc::new(func),
        };
        self.define(module, name, value)
    }

    pub fn memory(self, module: impl Into<String>, name: impl Into<String>, memory: SharedMemory) -> Self {
        self.define(module, name, ImportValue::Memory(memory))
    }

    pub fn owned_memory(self, module: impl Into<String>, name: impl Into<String>, ty: MemoryType) -> Self {
        self.define(module, name, ImportValue::OwnedMemory(ty))
    }

    pub fn global(self, module: impl Into<String>, name: impl Into<String>, value: Value, mutable: bool) -> Self {
        self.define(module, name, ImportValue::Global { value, mutable })
    }

    /// The shared memory declared under `env`/`memory`, if the set provides one.
    pub fn declared_memory(&self) -> Option<&SharedMemory> {
        self.imports.iter().find_map(|import| match &import.value {
            ImportValue::Memory(memory) if import.module == MEMORY_MODULE && import.name == MEMORY_NAME => {
                Some(memory)
            }
            _ => None,
        })
    }

    /// Defines every import in the linker, creating store-bound items in `store`.
    ///
    /// Returns the owned memory created for `env`/`memory`, if any.
    pub(crate) fn install(
        &self,
        linker: &mut Linker<SandboxCtx>,
        store: &mut Store<SandboxCtx>,
    ) -> wasmtime::Result<Option<Memory>> {
        let mut declared = None;
        for import in &self.imports {
            let Import { module, name, value } = import;
            match value {
                ImportValue::Func { params, results, func } => {
                    let ty = FuncType::new(store.engine(), params.iter().cloned(), results.iter().cloned());
                    let func = Arc::clone(func);
                    linker.func_new(module, name, ty, move |caller, params, results| {
                        func(caller, params, results)
                    })?;
                }
                ImportValue::Memory(memory) => {
                    linker.define(&*store, module, name, memory.clone())?;
                }
                ImportValue::OwnedMemory(ty) => {
                    let memory = Memory::new(&mut *store, ty.clone())?;
                    linker.define(&*store, module, name, memory)?;
                    if module == MEMORY_MODULE && name == MEMORY_NAME {
                        declared = Some(memory);
                    }
                }
                ImportValue::Global { value, mutable } => {
                    let (ty, val) = global_parts(value);
                    let mutability = if *mutable { Mutability::Var } else { Mutability::Const };
                    let global = Global::new(&mut *store, GlobalType::new(ty, mutability), val)?;
                    linker.define(&*store, module, name, global)?;
                }
            }
        }
        Ok(declared)
    }
}

fn global_parts(value: &Value) -> (ValType, Val) {
    match *value {
        Value::I32(v) => (ValType::I32, Val::I32(v)),
        Value::I64(v) => (ValType::I64, Val::I64(v)),
        Value::F32(v) => (ValType::F32, Val::F32(v.to_bits())),
        Value::F64(v) => (ValType::F64, Val::F64(v.to_bits())),
    }
}

/// Turns an import locator into an import set.
///
/// Resolution happens on the sandbox thread, during the handshake, and is the
/// only point where the sandbox awaits anything.
#[async_trait::async_trait]
pub trait ImportResolver: Send + Sync + 'static {
    async fn resolve(&self, locator: &str, engine: &Engine) -> anyhow::Result<ImportSet>;
}

/// Resolver for sandboxes that never receive a locator.
pub struct NoImports;

#[async_trait::async_trait]
impl ImportResolver for NoImports {
    async fn resolve(&self, locator: &str, _engine: &Engine) -> anyhow::Result<ImportSet> {
        Err(anyhow::anyhow!("No import resolver configured for '{}'", locator))
    }
}

type ImportFactory = Arc<dyn Fn(&Engine) -> anyhow::Result<ImportSet> + Send + Sync>;

/// An in-process resolver: locators map to factories registered up front.
///
/// Each resolution runs the factory again, so every sandbox gets fresh
/// memories and host state.
#[derive(Clone, Default)]
pub struct ImportRegistry {
    factories: Arc<DashMap<String, ImportFactory>>,
}

impl ImportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, locator: impl Into<String>, factory: F)
    where
        F: Fn(&Engine) -> anyhow::Result<ImportSet> + Send + Sync + 'static,
    {
        self.factories.insert(locator.into(), Arc::new(factory));
    }

    pub fn contains(&self, locator: &str) -> bool {
        self.factories.contains_key(locator)
    }
}

#[async_trait::async_trait]
impl ImportResolver for ImportRegistry {
    async fn resolve(&self, locator: &str, engine: &Engine) -> anyhow::Result<ImportSet> {
        // clone out of the map so no shard lock is held while the factory runs
        let factory = self
            .factories
            .get(locator)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| anyhow::anyhow!("No import set registered for '{}'", locator))?;
        factory(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::SandboxConfig;

    #[test]
    fn test_declared_memory_is_env_memory() {
        let engine = SandboxConfig::engine().expect("engine");
        let memory = SharedMemory::new(&engine, MemoryType::shared(1, 2)).expect("shared memory");

        let other = ImportSet::new().memory("other", "memory", memory.clone());
        assert!(other.declared_memory().is_none());

        let set = ImportSet::new()
            .global("env", "base", Value::I32(16), false)
            .memory("env", "memory", memory);
        assert_eq!(set.len(), 2);
        assert!(set.declared_memory().is_some());

        // an owned memory is not a shared declared memory
        let owned = ImportSet::new().owned_memory("env", "memory", MemoryType::new(1, None));
        assert!(owned.declared_memory().is_none());
        assert!(!owned.is_empty());
        assert!(ImportSet::new().is_empty());
    }

    #[test]
    fn test_install_returns_owned_declared_memory() {
        let engine = SandboxConfig::engine().expect("engine");
        let terminated = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut store = Store::new(&engine, SandboxCtx::new(&SandboxConfig::default(), terminated));
        let mut linker = Linker::new(&engine);

        let elsewhere = ImportSet::new().owned_memory("other", "memory", MemoryType::new(1, None));
        assert!(elsewhere.install(&mut linker, &mut store).expect("install").is_none());

        let mut linker = Linker::new(&engine);
        let set = ImportSet::new().owned_memory("env", "memory", MemoryType::new(2, Some(4)));
        let memory = set.install(&mut linker, &mut store).expect("install").expect("declared");
        assert_eq!(memory.data_size(&store), 2 * 65536);
    }

    #[tokio::test]
    async fn test_registry_resolves_registered_locator() {
        let engine = SandboxConfig::engine().expect("engine");
        let registry = ImportRegistry::new();
        registry.register("math", |_engine| {
            Ok(ImportSet::new().global("env", "pi", Value::F64(std::f64::consts::PI), false))
        });

        assert!(registry.contains("math"));
        let set = registry.resolve("math", &engine).await.expect("resolve");
        assert_eq!(set.len(), 1);
    }

    #[tokio::test]
    async fn test_registry_rejects_unknown_locator() {
        let engine = SandboxConfig::engine().expect("engine");
        let registry = ImportRegistry::new();
        let err = registry.resolve("missing", &engine).await.err().expect("should fail");
        assert!(err.to_string().contains("missing"));
    }

    #[tokio::test]
    async fn test_no_imports_always_fails() {
        let engine = SandboxConfig::engine().expect("engine");
        assert!(NoImports.resolve("anything", &engine).await.is_err());
    }
}
