//! # isowork
//!
//! Runs a WebAssembly module in a sandbox thread and talks to it only through
//! messages, as if its exports were local functions.
//!
//! ## Architecture
//!
//! The sandbox side is a small protocol handler with three parts:
//!
//! - **Initializer**: the one-shot handshake. Resolves an optional import set
//!   from a locator, instantiates the module, binds the memory port, and
//!   replies with the memory the host may view directly (or `None`).
//! - **Dispatcher**: owns the primary channel once the handshake is done.
//!   Calls exports by name; unknown names are answered with an error payload.
//! - **Memory channel**: a separate port for copying bytes in and out of
//!   linear memory, with no ordering relative to calls.
//!
//! Malformed protocol input is a *fault*: it is never answered, only logged
//! and published on the host's fault stream. Calling a member that is not a
//! function is a *domain error* and is answered as data.
//!
//! ## Example
//!
//! ```rust,no_run
//! use isowork::{ModuleHandle, Sandbox, SandboxConfig, Value};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = SandboxConfig::engine()?;
//! let module = ModuleHandle::from_file(&engine, "example.wasm")?;
//!
//! let sandbox = Sandbox::builder(&engine).spawn()?;
//! let session = sandbox.init(&module, None).await?;
//!
//! let fib = sandbox.call("fibonacci", [Value::I32(5)]).await?;
//! let bytes = session.channel.get(1024, Some(4)).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
mod dispatch;
pub mod fault;
pub mod host;
pub mod imports;
mod init;
pub mod memory;
pub mod message;
pub mod port;
pub mod signal;
mod state;
pub mod value;
mod worker;

pub use config::SandboxConfig;
pub use fault::Fault;
pub use fault::FaultKind;
pub use host::CopySource;
pub use host::Initialized;
pub use host::MemoryChannel;
pub use host::ModuleHandle;
pub use host::Sandbox;
pub use host::SandboxBuilder;
pub use imports::ImportRegistry;
pub use imports::ImportResolver;
pub use imports::ImportSet;
pub use message::MemoryMessage;
pub use message::RpcError;
pub use message::RpcRequest;
pub use message::RpcResponse;
pub use signal::Signal;
pub use value::Value;

#[cfg(test)]
mod tests;
