//! # Host Handle
//!
//! The host's side of a sandbox: compile a module, spawn the sandbox thread,
//! perform the handshake, then call exports and move bytes.
//!
//! Cancellation lives here, not in the sandbox. A timed-out call only stops
//! the host from waiting; the sandbox keeps running it. Dropping the
//! `Sandbox` is the only way to get the thread back from a call that never
//! returns.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::oneshot;
use wasmtime::Engine;
use wasmtime::Module;
use wasmtime::SharedMemory;

use crate::config::SandboxConfig;
use crate::fault::Fault;
use crate::fault::FaultQueue;
use crate::imports::ImportResolver;
use crate::imports::NoImports;
use crate::message::Inbound;
use crate::message::InitMessage;
use crate::message::MemoryMessage;
use crate::message::MemoryPortSender;
use crate::message::Outbound;
use crate::message::RpcError;
use crate::message::RpcRequest;
use crate::message::RpcResponse;
use crate::port;
use crate::port::Port;
use crate::value::Value;
use crate::worker::Worker;

#[derive(Debug)]
pub enum Error {
    /// The module failed to compile.
    Compile(wasmtime::Error),
    /// The sandbox thread could not be started.
    Spawn(std::io::Error),
    /// The sandbox is gone.
    Closed,
    /// The sandbox dropped the message without answering; see its faults.
    NoReply,
    /// The host stopped waiting.
    Timeout,
    /// The call was answered with an error payload.
    Remote(RpcError),
    /// The reply did not match the request.
    Unexpected(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compile(e) => write!(f, "Compile error: {}", e),
            Self::Spawn(e) => write!(f, "Failed to spawn sandbox: {}", e),
            Self::Closed => write!(f, "Sandbox closed"),
            Self::NoReply => write!(f, "Sandbox dropped the request without a reply"),
            Self::Timeout => write!(f, "Request timed out"),
            Self::Remote(e) => write!(f, "Remote error: {}", e),
            Self::Unexpected(what) => write!(f, "Unexpected reply: {}", what),
        }
    }
}

impl std::error::Error for Error {}

impl From<port::Error> for Error {
    fn from(e: port::Error) -> Self {
        match e {
            port::Error::Disconnected => Self::Closed,
            port::Error::NoReply => Self::NoReply,
        }
    }
}

impl From<RpcError> for Error {
    fn from(e: RpcError) -> Self {
        Self::Remote(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A compiled module, ready to be sent to a sandbox on the same engine.
#[derive(Clone)]
pub struct ModuleHandle {
    module: Module,
    name: String,
}

impl ModuleHandle {
    /// Compiles binary or text (`.wat`) bytes.
    pub fn new(engine: &Engine, name: impl Into<String>, bytes: impl AsRef<[u8]>) -> Result<Self> {
        let module = Module::new(engine, bytes).map_err(Error::Compile)?;
        Ok(Self {
            module,
            name: name.into(),
        })
    }

    pub fn from_file(engine: &Engine, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("module")
            .to_string();
        let module = Module::from_file(engine, path).map_err(Error::Compile)?;
        Ok(Self { module, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Names of the exported functions.
    pub fn functions(&self) -> impl Iterator<Item = &str> {
        self.module
            .exports()
            .filter(|export| export.ty().func().is_some())
            .map(|export| export.name())
    }
}

/// Fluent builder for spawning a sandbox.
pub struct SandboxBuilder {
    engine: Engine,
    config: SandboxConfig,
    resolver: Arc<dyn ImportResolver>,
}

impl SandboxBuilder {
    pub fn new(engine: &Engine) -> Self {
        Self {
            engine: engine.clone(),
            config: SandboxConfig::default(),
            resolver: Arc::new(NoImports),
        }
    }

    pub fn config(mut self, config: SandboxConfig) -> Self {
        self.config = config;
        self
    }

    pub fn resolver(mut self, resolver: impl ImportResolver) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Starts the sandbox thread. It waits for the handshake.
    pub fn spawn(self) -> Result<Sandbox> {
        let (primary, listener) = port::channel();
        let faults = Arc::new(FaultQueue::new(self.config.fault_capacity));
        let terminated = Arc::new(AtomicBool::new(false));

        let name = self.config.name.clone();
        let worker = Worker::new(
            self.engine.clone(),
            self.config,
            self.resolver,
            Arc::clone(&terminated),
            listener,
            Arc::clone(&faults),
        );

        let span_name = name.clone();
        std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                let _span = tracing::info_span!("sandbox", name = %span_name).entered();
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        tracing::error!("failed to start sandbox runtime: {}", e);
                        return;
                    }
                };
                runtime.block_on(worker.run());
            })
            .map_err(Error::Spawn)?;

        Ok(Sandbox {
            engine: self.engine,
            primary,
            faults,
            terminated,
        })
    }
}

/// Result of a successful handshake.
pub struct Initialized {
    /// The sandbox memory itself, when it is shared and isolation allows it.
    pub memory: Option<SharedMemory>,
    /// Copy-in/copy-out access to sandbox memory.
    pub channel: MemoryChannel,
}

/// Host handle to a running sandbox. Dropping it terminates the sandbox.
pub struct Sandbox {
    engine: Engine,
    primary: Port<Inbound, Outbound>,
    faults: Arc<FaultQueue>,
    terminated: Arc<AtomicBool>,
}

impl Sandbox {
    pub fn builder(engine: &Engine) -> SandboxBuilder {
        SandboxBuilder::new(engine)
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Sends the handshake. A sandbox that faults during setup never replies,
    /// which surfaces here as `Error::NoReply`.
    pub async fn init(&self, module: &ModuleHandle, imports_url: Option<&str>) -> Result<Initialized> {
        let (rx, channel) = self.post_init(module, imports_url)?;
        let outbound = rx.await.map_err(|_| Error::NoReply)?;
        Self::finish_init(outbound, channel)
    }

    /// `init` raced against a timer.
    pub async fn init_timeout(
        &self,
        module: &ModuleHandle,
        imports_url: Option<&str>,
        timeout: Duration,
    ) -> Result<Initialized> {
        let (rx, channel) = self.post_init(module, imports_url)?;
        let outbound = tokio::time::timeout(timeout, rx)
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|_| Error::NoReply)?;
        Self::finish_init(outbound, channel)
    }

    fn post_init(
        &self,
        module: &ModuleHandle,
        imports_url: Option<&str>,
    ) -> Result<(oneshot::Receiver<Outbound>, MemoryChannel)> {
        let (sender, port) = port::channel();
        let message = InitMessage {
            module: module.clone(),
            imports_url: imports_url.map(str::to_string),
        };
        let rx = self.primary.post(Inbound::Init { message, port })?;
        Ok((rx, MemoryChannel { port: sender }))
    }

    fn finish_init(outbound: Outbound, channel: MemoryChannel) -> Result<Initialized> {
        match outbound {
            Outbound::Ready(memory) => Ok(Initialized { memory, channel }),
            Outbound::Response(_) => Err(Error::Unexpected("call response to a handshake")),
        }
    }

    /// Posts a call and returns the raw response.
    pub async fn request(&self, request: RpcRequest) -> Result<RpcResponse> {
        let rx = self.primary.post(Inbound::Call(request))?;
        Self::response(rx.await.map_err(|_| Error::NoReply)?)
    }

    /// Calls an export. An error payload becomes `Error::Remote`.
    pub async fn call(&self, member: &str, args: impl IntoIterator<Item = Value>) -> Result<Vec<Value>> {
        let response = self.request(RpcRequest::new(member, args)).await?;
        Ok(response.into_result()?)
    }

    /// Calls an export, giving up after `timeout`. The call itself keeps running.
    pub async fn call_timeout(
        &self,
        member: &str,
        args: impl IntoIterator<Item = Value>,
        timeout: Duration,
    ) -> Result<Vec<Value>> {
        tokio::time::timeout(timeout, self.call(member, args))
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Posts every request before awaiting any reply. Results come back in
    /// request order.
    pub async fn batch(&self, requests: impl IntoIterator<Item = RpcRequest>) -> Vec<Result<Vec<Value>>> {
        let pending: Vec<_> = requests
            .into_iter()
            .map(|request| self.primary.post(Inbound::Call(request)))
            .collect();

        let mut results = Vec::with_capacity(pending.len());
        for rx in pending {
            let result = match rx {
                Ok(rx) => match rx.await {
                    Ok(outbound) => Self::response(outbound).and_then(|r| Ok(r.into_result()?)),
                    Err(_) => Err(Error::NoReply),
                },
                Err(e) => Err(e.into()),
            };
            results.push(result);
        }
        results
    }

    fn response(outbound: Outbound) -> Result<RpcResponse> {
        match outbound {
            Outbound::Response(response) => Ok(response),
            Outbound::Ready(_) => Err(Error::Unexpected("handshake reply to a call")),
        }
    }

    /// Waits for the next fault the sandbox reports. `None` once the
    /// sandbox thread has exited and every fault was taken.
    ///
    /// Unread faults are capped at `SandboxConfig::fault_capacity`; the
    /// oldest are dropped first.
    pub async fn next_fault(&self) -> Option<Fault> {
        self.faults.next().await
    }

    /// Returns a fault if one has already been reported.
    pub fn try_fault(&self) -> Option<Fault> {
        self.faults.try_pop()
    }

    /// Discards the sandbox, interrupting whatever it is running.
    pub fn terminate(self) {
        drop(self);
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.terminated.store(true, Ordering::Release);
        self.engine.increment_epoch();
    }
}

/// Where a `memcpy` takes its bytes from.
pub enum CopySource {
    /// Bytes from the host, moved into the sandbox.
    Bytes(Vec<u8>),
    /// An address in sandbox memory.
    Address(usize),
}

/// Host end of the memory port.
#[derive(Clone)]
pub struct MemoryChannel {
    port: MemoryPortSender,
}

impl MemoryChannel {
    /// Sends a raw memory message, well-formed or not.
    pub async fn send(&self, message: MemoryMessage) -> Result<Vec<u8>> {
        Ok(self.port.request(message).await?)
    }

    /// Writes `source` at `dest`. The buffer is moved into the sandbox and
    /// handed back once copied.
    pub async fn set(&self, dest: usize, source: Vec<u8>, count: Option<usize>) -> Result<Vec<u8>> {
        self.send(MemoryMessage::set(dest, source, count)).await
    }

    /// Reads `count` bytes at `source`, or everything up to the end of memory.
    pub async fn get(&self, source: usize, count: Option<usize>) -> Result<Vec<u8>> {
        self.send(MemoryMessage::get(source, count)).await
    }

    /// Copies into sandbox memory when a destination is given, out of it otherwise.
    pub async fn memcpy(&self, dest: Option<usize>, source: CopySource, count: Option<usize>) -> Result<Vec<u8>> {
        match (dest, source) {
            (Some(dest), CopySource::Bytes(bytes)) => self.set(dest, bytes, count).await,
            (None, CopySource::Address(address)) => self.get(address, count).await,
            (None, CopySource::Bytes(bytes)) => Ok(bytes),
            (Some(dest), CopySource::Address(address)) => {
                let bytes = self.get(address, count).await?;
                self.set(dest, bytes, count).await
            }
        }
    }
}
