//! # Protocol Messages
//!
//! Everything that crosses the sandbox boundary.
//!
//! Primary channel: `Inbound::Init` once, then any number of `Inbound::Call`.
//! Replies are `Outbound::Ready` and `Outbound::Response` respectively.
//!
//! Memory port: `MemoryMessage` in, raw bytes out.

use wasmtime::SharedMemory;

use crate::fault::Fault;
use crate::host::ModuleHandle;
use crate::port::Envelope;
use crate::port::Listener;
use crate::port::Port;
use crate::value::Value;

/// Envelope type of the primary channel.
pub type PrimaryEnvelope = Envelope<Inbound, Outbound>;

/// Sandbox end of the memory port.
pub type MemoryPort = Listener<MemoryMessage, Vec<u8>>;

/// Host end of the memory port.
pub type MemoryPortSender = Port<MemoryMessage, Vec<u8>>;

/// Messages the sandbox accepts on its primary channel.
pub enum Inbound {
    /// The one-shot handshake. The port is moved into the sandbox with it.
    Init { message: InitMessage, port: MemoryPort },
    Call(RpcRequest),
}

/// Replies the sandbox posts on its primary channel.
pub enum Outbound {
    /// Answer to `Init`: the memory the host may view directly, if any.
    Ready(Option<SharedMemory>),
    Response(RpcResponse),
}

/// The handshake payload.
#[derive(Clone)]
pub struct InitMessage {
    pub module: ModuleHandle,
    /// Locator handed to the sandbox's import resolver.
    pub imports_url: Option<String>,
}

/// A call to an export by name.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub member: String,
    pub args: Vec<Value>,
}

impl RpcRequest {
    pub fn new(member: impl Into<String>, args: impl IntoIterator<Item = Value>) -> Self {
        Self {
            member: member.into(),
            args: args.into_iter().collect(),
        }
    }
}

/// The error payload of a failed call. Delivered as data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub message: String,
}

impl RpcError {
    pub fn not_a_function(member: &str) -> Self {
        Self {
            message: format!("{} is not a function", member),
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RpcError {}

/// What a call produced.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcResponse {
    /// The raw results of the export; empty when it returns nothing.
    Return(Vec<Value>),
    Error(RpcError),
}

impl RpcResponse {
    pub fn into_result(self) -> std::result::Result<Vec<Value>, RpcError> {
        match self {
            Self::Return(values) => Ok(values),
            Self::Error(e) => Err(e),
        }
    }
}

/// Copy bytes from the host into sandbox memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetRequest {
    pub dest: usize,
    /// Moved into the sandbox and moved back as the reply.
    pub source: Vec<u8>,
    pub count: Option<usize>,
}

/// Copy bytes out of sandbox memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetRequest {
    pub source: usize,
    /// Defaults to the rest of memory.
    pub count: Option<usize>,
}

/// The wire shape of a memory request. Exactly one field must be set.
///
/// The shape is kept loose on purpose so that a malformed request is
/// something a peer can actually send, and the sandbox rejects it loudly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryMessage {
    pub get: Option<GetRequest>,
    pub set: Option<SetRequest>,
}

impl MemoryMessage {
    pub fn set(dest: usize, source: Vec<u8>, count: Option<usize>) -> Self {
        Self {
            get: None,
            set: Some(SetRequest { dest, source, count }),
        }
    }

    pub fn get(source: usize, count: Option<usize>) -> Self {
        Self {
            get: Some(GetRequest { source, count }),
            set: None,
        }
    }
}

/// A validated memory request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryRequest {
    Set(SetRequest),
    Get(GetRequest),
}

impl TryFrom<MemoryMessage> for MemoryRequest {
    type Error = Fault;

    fn try_from(message: MemoryMessage) -> std::result::Result<Self, Fault> {
        match (message.get, message.set) {
            (None, Some(set)) => Ok(Self::Set(set)),
            (Some(get), None) => Ok(Self::Get(get)),
            _ => Err(Fault::InvalidMemoryRequest),
        }
    }
}
