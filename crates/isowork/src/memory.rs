//! # Memory Access Channel
//!
//! Serves byte-range copies between the host and the sandbox's linear memory
//! over the memory port, independently of the primary channel.
//!
//! ## Invariants
//!
//! - The declared (imported) memory wins over an exported `memory`.
//! - No memory at all is a protocol fault, checked before the request shape.
//! - A request with neither or both of `get`/`set` is a protocol fault.
//! - On `set`, the reply is the very buffer the host sent, moved back.
//! - On `get`, the reply is a fresh buffer.

use std::cell::UnsafeCell;

use wasmtime::Memory;
use wasmtime::SharedMemory;

use crate::fault::Fault;
use crate::imports::MEMORY_NAME;
use crate::message::GetRequest;
use crate::message::MemoryMessage;
use crate::message::MemoryRequest;
use crate::message::SetRequest;
use crate::state::Ready;

pub type Result<T> = std::result::Result<T, Fault>;

/// The memory a request operates on.
pub(crate) enum LinearMemory {
    /// Bound to the sandbox store.
    Owned(Memory),
    /// Engine-level, possibly also viewed by the host.
    Shared(SharedMemory),
}

/// Finds the memory requests should use.
pub(crate) fn resolve(ready: &mut Ready) -> Result<LinearMemory> {
    if let Some(memory) = ready.imports.declared_memory() {
        return Ok(LinearMemory::Shared(memory.clone()));
    }
    if let Some(memory) = ready.owned_memory {
        return Ok(LinearMemory::Owned(memory));
    }
    if let Some(memory) = ready.instance.get_memory(&mut ready.store, MEMORY_NAME) {
        return Ok(LinearMemory::Owned(memory));
    }
    if let Some(memory) = ready.instance.get_shared_memory(&mut ready.store, MEMORY_NAME) {
        return Ok(LinearMemory::Shared(memory));
    }
    Err(Fault::MemoryNotDefined)
}

/// Handles one memory message and produces the buffer to reply with.
pub(crate) fn handle(ready: &mut Ready, message: MemoryMessage) -> Result<Vec<u8>> {
    let memory = resolve(ready)?;

    match MemoryRequest::try_from(message)? {
        MemoryRequest::Set(SetRequest { dest, source, count }) => {
            let count = count.unwrap_or(source.len());
            if source.len() > count {
                return Err(Fault::SourceOverflow { count, len: source.len() });
            }
            check_range(dest, count, memory.size(ready))?;
            memory.write(ready, dest, &source)?;
            tracing::debug!(dest, count, "memory set");
            Ok(source)
        }
        MemoryRequest::Get(GetRequest { source, count }) => {
            let bytes = memory.read(ready, source, count)?;
            tracing::debug!(source, count = bytes.len(), "memory get");
            Ok(bytes)
        }
    }
}

impl LinearMemory {
    fn size(&self, ready: &Ready) -> usize {
        match self {
            Self::Owned(memory) => memory.data_size(&ready.store),
            Self::Shared(memory) => memory.data().len(),
        }
    }

    fn write(&self, ready: &mut Ready, offset: usize, bytes: &[u8]) -> Result<()> {
        match self {
            Self::Owned(memory) => {
                let size = memory.data_size(&ready.store);
                memory.write(&mut ready.store, offset, bytes).map_err(|_| Fault::OutOfBounds {
                    offset,
                    len: bytes.len(),
                    size,
                })
            }
            Self::Shared(memory) => write_shared(memory, offset, bytes),
        }
    }

    fn read(&self, ready: &Ready, offset: usize, count: Option<usize>) -> Result<Vec<u8>> {
        match self {
            Self::Owned(memory) => {
                let data = memory.data(&ready.store);
                let end = check_range(offset, count.unwrap_or(data.len().saturating_sub(offset)), data.len())?;
                Ok(data[offset..end].to_vec())
            }
            Self::Shared(memory) => read_shared(memory, offset, count),
        }
    }
}

/// Returns the end of `[offset, offset + len)` if it lies within `size`.
fn check_range(offset: usize, len: usize, size: usize) -> Result<usize> {
    offset
        .checked_add(len)
        .filter(|end| *end <= size)
        .ok_or(Fault::OutOfBounds { offset, len, size })
}

fn shared_range(memory: &SharedMemory, offset: usize, len: usize) -> Result<&[UnsafeCell<u8>]> {
    let data = memory.data();
    let end = check_range(offset, len, data.len())?;
    Ok(&data[offset..end])
}

/// Copies bytes out of a shared memory. `None` reads to the end.
pub fn read_shared(memory: &SharedMemory, offset: usize, count: Option<usize>) -> Result<Vec<u8>> {
    let size = memory.data().len();
    let len = count.unwrap_or(size.saturating_sub(offset));
    let cells = shared_range(memory, offset, len)?;

    let mut bytes = vec![0u8; len];
    // SAFETY: `cells` is in bounds and `bytes` is a distinct allocation. Shared
    // memory may be written concurrently; like any unsynchronized access to a
    // shared buffer the copy sees some interleaving of those writes.
    unsafe {
        std::ptr::copy_nonoverlapping(UnsafeCell::raw_get(cells.as_ptr()), bytes.as_mut_ptr(), len);
    }
    Ok(bytes)
}

/// Copies bytes into a shared memory.
pub fn write_shared(memory: &SharedMemory, offset: usize, bytes: &[u8]) -> Result<()> {
    let cells = shared_range(memory, offset, bytes.len())?;
    // SAFETY: as in `read_shared`; the cells are interior-mutable.
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), UnsafeCell::raw_get(cells.as_ptr()), bytes.len());
    }
    Ok(())
}
