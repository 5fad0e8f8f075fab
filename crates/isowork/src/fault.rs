//! # Sandbox Faults
//!
//! Failures that are never answered. A fault drops the reply slot of the
//! message being processed, is logged, and is published to the host's fault
//! stream. The sandbox keeps serving later messages.
//!
//! Contrast with `RpcResponse::Error`, which is an ordinary reply: a call to
//! an unknown member is the caller's mistake, a malformed memory request is
//! a broken peer.
//!
//! Published faults wait in a bounded `FaultQueue` until the host takes them.
//! A host that never drains the queue loses the oldest faults first.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::sync::Notify;

/// Coarse classification of a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The handshake failed; the sandbox is still uninitialized.
    Setup,
    /// A message violated the protocol.
    Protocol,
    /// A dispatched export trapped.
    Execution,
}

#[derive(Debug)]
pub enum Fault {
    ImportResolution { locator: String, source: anyhow::Error },
    Link(wasmtime::Error),
    Instantiation(wasmtime::Error),
    NotInitialized { member: String },
    MemoryNotDefined,
    InvalidMemoryRequest,
    OutOfBounds { offset: usize, len: usize, size: usize },
    SourceOverflow { count: usize, len: usize },
    Signature { member: String, reason: String },
    Trap { member: String, source: wasmtime::Error },
}

impl Fault {
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::ImportResolution { .. } | Self::Link(_) | Self::Instantiation(_) => FaultKind::Setup,
            Self::Trap { .. } => FaultKind::Execution,
            _ => FaultKind::Protocol,
        }
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ImportResolution { locator, source } => {
                write!(f, "Failed to resolve imports '{}': {}", locator, source)
            }
            Self::Link(e) => write!(f, "Linker error: {}", e),
            Self::Instantiation(e) => write!(f, "Instantiation error: {}", e),
            Self::NotInitialized { member } => {
                write!(f, "Call to '{}' before the sandbox was initialized", member)
            }
            Self::MemoryNotDefined => write!(f, "Linear memory is not defined"),
            Self::InvalidMemoryRequest => write!(f, "Invalid memory request"),
            Self::OutOfBounds { offset, len, size } => write!(
                f,
                "Memory access out of bounds: {} bytes at {} in a memory of {} bytes",
                len, offset, size
            ),
            Self::SourceOverflow { count, len } => {
                write!(f, "Source of {} bytes does not fit in a count of {}", len, count)
            }
            Self::Signature { member, reason } => {
                write!(f, "Cannot call '{}': {}", member, reason)
            }
            Self::Trap { member, source } => write!(f, "Call to '{}' trapped: {}", member, source),
        }
    }
}

impl std::error::Error for Fault {}

/// Faults published by a sandbox and not yet taken by the host.
pub struct FaultQueue {
    capacity: usize,
    faults: Mutex<VecDeque<Fault>>,
    ready: Notify,
    closed: AtomicBool,
}

impl FaultQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            faults: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Queues a fault, evicting the oldest one when full.
    pub fn push(&self, fault: Fault) {
        {
            let mut faults = self.lock();
            if faults.len() >= self.capacity {
                if let Some(oldest) = faults.pop_front() {
                    tracing::warn!(dropped = %oldest, "fault queue full, dropping oldest");
                }
            }
            faults.push_back(fault);
        }
        self.ready.notify_one();
    }

    pub fn try_pop(&self) -> Option<Fault> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Marks the publisher gone. Queued faults can still be taken.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.ready.notify_waiters();
        self.ready.notify_one();
    }

    /// Waits for the next fault. `None` once closed and drained.
    pub async fn next(&self) -> Option<Fault> {
        loop {
            if let Some(fault) = self.try_pop() {
                return Some(fault);
            }
            if self.closed.load(Ordering::Acquire) {
                return self.try_pop();
            }
            self.ready.notified().await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Fault>> {
        match self.faults.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
