//! # Sandbox Worker
//!
//! The event loop that owns a sandbox: its state, its primary channel, and
//! (after the handshake) its memory port.
//!
//! The loop is single-threaded. It waits on both queues at once and handles
//! whichever message comes first to completion before looking again, so a
//! running call holds up both channels.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use wasmtime::Engine;

use crate::config::SandboxConfig;
use crate::dispatch;
use crate::fault::Fault;
use crate::fault::FaultQueue;
use crate::imports::ImportResolver;
use crate::init::Initializer;
use crate::memory;
use crate::message::Inbound;
use crate::message::InitMessage;
use crate::message::MemoryMessage;
use crate::message::MemoryPort;
use crate::message::Outbound;
use crate::message::PrimaryEnvelope;
use crate::port::Envelope;
use crate::port::Listener;
use crate::port::Reply;
use crate::state::SandboxState;

enum Event {
    Primary(Option<PrimaryEnvelope>),
    Memory(Option<Envelope<MemoryMessage, Vec<u8>>>),
}

pub(crate) struct Worker {
    engine: Engine,
    config: SandboxConfig,
    resolver: Arc<dyn ImportResolver>,
    terminated: Arc<AtomicBool>,
    primary: Listener<Inbound, Outbound>,
    memory: Option<MemoryPort>,
    faults: Arc<FaultQueue>,
    state: SandboxState,
}

impl Worker {
    pub fn new(
        engine: Engine,
        config: SandboxConfig,
        resolver: Arc<dyn ImportResolver>,
        terminated: Arc<AtomicBool>,
        primary: Listener<Inbound, Outbound>,
        faults: Arc<FaultQueue>,
    ) -> Self {
        Self {
            engine,
            config,
            resolver,
            terminated,
            primary,
            memory: None,
            faults,
            state: SandboxState::Uninitialized,
        }
    }

    /// Runs until the host drops its end of the primary channel.
    pub async fn run(mut self) {
        loop {
            let event = tokio::select! {
                envelope = self.primary.recv() => Event::Primary(envelope),
                envelope = next_memory(&mut self.memory) => Event::Memory(envelope),
            };

            match event {
                Event::Primary(Some(envelope)) => self.on_primary(envelope).await,
                Event::Primary(None) => break,
                Event::Memory(Some(envelope)) => self.on_memory(envelope),
                Event::Memory(None) => {
                    tracing::debug!("memory port closed");
                    self.memory = None;
                }
            }
        }
        tracing::info!("primary channel closed, sandbox exiting");
    }

    async fn on_primary(&mut self, envelope: PrimaryEnvelope) {
        let (inbound, reply) = envelope.into_parts();
        match inbound {
            Inbound::Init { message, port } => self.on_init(message, port, reply).await,
            Inbound::Call(request) => {
                let Some(ready) = self.state.ready_mut() else {
                    self.fault(Fault::NotInitialized { member: request.member });
                    return;
                };
                match dispatch::dispatch(ready, request) {
                    Ok(response) => reply.send(Outbound::Response(response)),
                    Err(fault) => self.fault(fault),
                }
            }
        }
    }

    async fn on_init(&mut self, message: InitMessage, port: MemoryPort, reply: Reply<Outbound>) {
        if self.state.is_ready() {
            tracing::warn!("ignoring repeated initialization");
            return;
        }

        let initializer = Initializer {
            engine: &self.engine,
            config: &self.config,
            resolver: self.resolver.as_ref(),
            terminated: &self.terminated,
        };

        let mut ready = match initializer.instantiate(message).await {
            Ok(ready) => ready,
            Err(fault) => {
                self.fault(fault);
                return;
            }
        };

        // the port is live before the host learns the handshake finished
        self.memory = Some(port);
        let memory = initializer.exposed_memory(&mut ready);
        reply.send(Outbound::Ready(memory));

        if self.state.transition(ready).is_err() {
            tracing::warn!("sandbox already initialized, discarding new instance");
        }
    }

    fn on_memory(&mut self, envelope: Envelope<MemoryMessage, Vec<u8>>) {
        let (message, reply) = envelope.into_parts();
        // the port only exists once the sandbox is ready
        let Some(ready) = self.state.ready_mut() else {
            return;
        };
        match memory::handle(ready, message) {
            Ok(bytes) => reply.send(bytes),
            Err(fault) => self.fault(fault),
        }
    }

    fn fault(&self, fault: Fault) {
        tracing::error!(kind = ?fault.kind(), "{}", fault);
        self.faults.push(fault);
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.faults.close();
    }
}

async fn next_memory(port: &mut Option<MemoryPort>) -> Option<Envelope<MemoryMessage, Vec<u8>>> {
    match port {
        Some(port) => port.recv().await,
        None => std::future::pending().await,
    }
}
