//! Tests for the handshake, dispatcher, and memory handler without a sandbox thread.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use wasmtime::Engine;
use wasmtime::MemoryType;
use wasmtime::SharedMemory;

use crate::config::SandboxConfig;
use crate::dispatch::dispatch;
use crate::fault::Fault;
use crate::fault::FaultKind;
use crate::host::ModuleHandle;
use crate::imports::ImportRegistry;
use crate::imports::ImportSet;
use crate::imports::NoImports;
use crate::init::Initializer;
use crate::memory;
use crate::message::InitMessage;
use crate::message::MemoryMessage;
use crate::message::RpcRequest;
use crate::message::RpcResponse;
use crate::state::Ready;
use crate::state::SandboxState;
use crate::value::Value;

const COUNTER: &str = r#"
(module
  (memory (export "memory") 1)
  (global $count (mut i32) (i32.const 0))
  (global (export "LIMIT") i32 (i32.const 10))
  (func (export "bump") (param $by i32) (result i32)
    (global.set $count (i32.add (global.get $count) (local.get $by)))
    (global.get $count))
  (func (export "scale") (param $x f64) (param $k f64) (result f64)
    (f64.mul (local.get $x) (local.get $k)))
  (func (export "pair") (result i32 i64)
    (i32.const 1)
    (i64.const 2))
  (func (export "boom")
    unreachable)
  (func (export "takes_ref") (param externref)))
"#;

const PLAIN: &str = r#"
(module
  (import "env" "memory" (memory 1))
  (memory $scratch 1)
  (export "memory" (memory $scratch))
  (func (export "byte") (param $ptr i32) (result i32)
    (i32.load8_u (local.get $ptr))))
"#;

const IMPORTED: &str = r#"
(module
  (import "env" "memory" (memory 1 4 shared))
  (import "env" "base" (global $base i32))
  (func (export "base") (result i32)
    (global.get $base)))
"#;

fn engine() -> Engine {
    SandboxConfig::engine().expect("engine")
}

async fn ready_with(engine: &Engine, config: &SandboxConfig, wat: &str, imports_url: Option<&str>) -> Result<Ready, Fault> {
    let registry = ImportRegistry::new();
    registry.register("base", |engine| {
        let memory = SharedMemory::new(engine, MemoryType::shared(1, 4))?;
        Ok(ImportSet::new()
            .memory("env", "memory", memory)
            .global("env", "base", Value::I32(64), false))
    });
    registry.register("plain", |_engine| {
        Ok(ImportSet::new().owned_memory("env", "memory", MemoryType::new(1, Some(2))))
    });

    let terminated = Arc::new(AtomicBool::new(false));
    let initializer = Initializer {
        engine,
        config,
        resolver: &registry,
        terminated: &terminated,
    };
    let module = ModuleHandle::new(engine, "test", wat).expect("compile");
    initializer
        .instantiate(InitMessage {
            module,
            imports_url: imports_url.map(str::to_string),
        })
        .await
}

async fn ready(wat: &str) -> Ready {
    let engine = engine();
    ready_with(&engine, &SandboxConfig::default(), wat, None)
        .await
        .expect("instantiate")
}

fn call(ready: &mut Ready, member: &str, args: impl IntoIterator<Item = Value>) -> Result<RpcResponse, Fault> {
    dispatch(ready, RpcRequest::new(member, args))
}

// --- Dispatcher ---

#[tokio::test]
async fn test_dispatch_keeps_instance_state() {
    let mut ready = ready(COUNTER).await;

    let first = call(&mut ready, "bump", [Value::I32(3)]).expect("bump");
    let second = call(&mut ready, "bump", [Value::I32(4)]).expect("bump");

    assert_eq!(first, RpcResponse::Return(vec![Value::I32(3)]));
    assert_eq!(second, RpcResponse::Return(vec![Value::I32(7)]));
}

#[tokio::test]
async fn test_dispatch_missing_args_are_zero() {
    let mut ready = ready(COUNTER).await;
    let response = call(&mut ready, "bump", []).expect("bump");
    assert_eq!(response, RpcResponse::Return(vec![Value::I32(0)]));
}

#[tokio::test]
async fn test_dispatch_coerces_and_ignores_extra_args() {
    let mut ready = ready(COUNTER).await;
    let response = call(&mut ready, "scale", [Value::I32(3), Value::F32(0.5), Value::I64(99)]).expect("scale");
    assert_eq!(response, RpcResponse::Return(vec![Value::F64(1.5)]));
}

#[tokio::test]
async fn test_dispatch_multi_value_result() {
    let mut ready = ready(COUNTER).await;
    let response = call(&mut ready, "pair", []).expect("pair");
    assert_eq!(response, RpcResponse::Return(vec![Value::I32(1), Value::I64(2)]));
}

#[tokio::test]
async fn test_dispatch_unknown_and_non_function_members_are_data() {
    let mut ready = ready(COUNTER).await;

    for member in ["missing", "LIMIT", "memory"] {
        let response = call(&mut ready, member, []).expect("answered");
        let err = response.into_result().expect_err("error payload");
        assert_eq!(err.message, format!("{} is not a function", member));
    }
}

#[tokio::test]
async fn test_dispatch_trap_is_execution_fault() {
    let mut ready = ready(COUNTER).await;

    let fault = call(&mut ready, "boom", []).expect_err("trap");
    assert!(matches!(fault, Fault::Trap { ref member, .. } if member == "boom"));
    assert_eq!(fault.kind(), FaultKind::Execution);

    // the instance is still usable
    let response = call(&mut ready, "bump", [Value::I32(1)]).expect("bump");
    assert_eq!(response, RpcResponse::Return(vec![Value::I32(1)]));
}

#[tokio::test]
async fn test_dispatch_reference_param_is_signature_fault() {
    let mut ready = ready(COUNTER).await;
    let fault = call(&mut ready, "takes_ref", []).expect_err("signature");
    assert!(matches!(fault, Fault::Signature { .. }));
    assert_eq!(fault.kind(), FaultKind::Execution);
}

// --- Initializer ---

#[tokio::test]
async fn test_init_without_locator_fails_to_link_imports() {
    let engine = engine();
    let fault = ready_with(&engine, &SandboxConfig::default(), IMPORTED, None)
        .await
        .err()
        .expect("missing imports");
    assert!(matches!(fault, Fault::Instantiation(_)));
    assert_eq!(fault.kind(), FaultKind::Setup);
}

#[tokio::test]
async fn test_init_unknown_locator_is_setup_fault() {
    let engine = engine();
    let fault = ready_with(&engine, &SandboxConfig::default(), COUNTER, Some("nowhere"))
        .await
        .err()
        .expect("unknown locator");
    assert!(matches!(fault, Fault::ImportResolution { ref locator, .. } if locator == "nowhere"));
    assert_eq!(fault.kind(), FaultKind::Setup);
}

#[tokio::test]
async fn test_init_with_resolved_imports() {
    let engine = engine();
    let config = SandboxConfig::default();
    let mut ready = ready_with(&engine, &config, IMPORTED, Some("base")).await.expect("instantiate");

    let response = call(&mut ready, "base", []).expect("base");
    assert_eq!(response, RpcResponse::Return(vec![Value::I32(64)]));

    let terminated = Arc::new(AtomicBool::new(false));
    let initializer = Initializer {
        engine: &engine,
        config: &config,
        resolver: &NoImports,
        terminated: &terminated,
    };
    let exposed = initializer.exposed_memory(&mut ready).expect("shared memory");
    assert_eq!(exposed.data().len(), 65536);
}

#[tokio::test]
async fn test_init_owned_memory_is_not_exposed() {
    let engine = engine();
    let config = SandboxConfig::default();
    let mut ready = ready_with(&engine, &config, COUNTER, None).await.expect("instantiate");

    let terminated = Arc::new(AtomicBool::new(false));
    let initializer = Initializer {
        engine: &engine,
        config: &config,
        resolver: &NoImports,
        terminated: &terminated,
    };
    assert!(initializer.exposed_memory(&mut ready).is_none());
}

#[tokio::test]
async fn test_init_isolation_off_withholds_shared_memory() {
    let engine = engine();
    let config = SandboxConfig::default().cross_origin_isolated(false);
    let mut ready = ready_with(&engine, &config, IMPORTED, Some("base")).await.expect("instantiate");

    let terminated = Arc::new(AtomicBool::new(false));
    let initializer = Initializer {
        engine: &engine,
        config: &config,
        resolver: &NoImports,
        terminated: &terminated,
    };
    assert!(initializer.exposed_memory(&mut ready).is_none());
}

// --- State ---

#[tokio::test]
async fn test_state_transitions_once() {
    let mut state = SandboxState::Uninitialized;
    assert!(!state.is_ready());
    assert!(state.ready_mut().is_none());

    state.transition(ready(COUNTER).await).ok().expect("first transition");
    assert!(state.is_ready());

    assert!(state.transition(ready(COUNTER).await).is_err());
    assert!(state.ready_mut().is_some());
}

// --- Memory handler ---

#[tokio::test]
async fn test_memory_set_then_get_owned() {
    let mut ready = ready(COUNTER).await;

    let source = b"abc".to_vec();
    let ptr = source.as_ptr();
    let echoed = memory::handle(&mut ready, MemoryMessage::set(100, source, None)).expect("set");
    // the same allocation comes back
    assert_eq!(echoed.as_ptr(), ptr);

    let bytes = memory::handle(&mut ready, MemoryMessage::get(100, Some(3))).expect("get");
    assert_eq!(bytes, b"abc");
}

#[tokio::test]
async fn test_memory_get_without_count_reads_to_end() {
    let mut ready = ready(COUNTER).await;
    let bytes = memory::handle(&mut ready, MemoryMessage::get(65530, None)).expect("get");
    assert_eq!(bytes.len(), 6);
}

#[tokio::test]
async fn test_memory_set_count_shorter_than_source_faults() {
    let mut ready = ready(COUNTER).await;
    let fault = memory::handle(&mut ready, MemoryMessage::set(0, vec![1, 2, 3, 4], Some(2))).expect_err("overflow");
    assert!(matches!(fault, Fault::SourceOverflow { count: 2, len: 4 }));
}

#[tokio::test]
async fn test_memory_out_of_bounds_faults() {
    let mut ready = ready(COUNTER).await;

    let fault = memory::handle(&mut ready, MemoryMessage::get(65535, Some(2))).expect_err("get");
    assert!(matches!(fault, Fault::OutOfBounds { .. }));

    let fault = memory::handle(&mut ready, MemoryMessage::set(65535, vec![0; 2], None)).expect_err("set");
    assert!(matches!(fault, Fault::OutOfBounds { .. }));
    assert_eq!(fault.kind(), FaultKind::Protocol);
}

#[tokio::test]
async fn test_memory_malformed_requests_fault() {
    let mut ready = ready(COUNTER).await;

    let fault = memory::handle(&mut ready, MemoryMessage::default()).expect_err("neither");
    assert!(matches!(fault, Fault::InvalidMemoryRequest));

    let both = MemoryMessage {
        get: MemoryMessage::get(0, Some(1)).get,
        set: MemoryMessage::set(0, vec![1], None).set,
    };
    let fault = memory::handle(&mut ready, both).expect_err("both");
    assert!(matches!(fault, Fault::InvalidMemoryRequest));
}

#[tokio::test]
async fn test_memory_missing_is_checked_before_shape() {
    let mut ready = ready(r#"(module (func (export "noop")))"#).await;
    let fault = memory::handle(&mut ready, MemoryMessage::default()).expect_err("no memory");
    assert!(matches!(fault, Fault::MemoryNotDefined));
}

#[tokio::test]
async fn test_memory_prefers_declared_memory() {
    let engine = engine();
    let mut ready = ready_with(&engine, &SandboxConfig::default(), IMPORTED, Some("base"))
        .await
        .expect("instantiate");

    memory::handle(&mut ready, MemoryMessage::set(8, b"shared".to_vec(), None)).expect("set");

    let declared = ready.imports.declared_memory().cloned().expect("declared");
    let bytes = memory::read_shared(&declared, 8, Some(6)).expect("read");
    assert_eq!(bytes, b"shared");
}

#[tokio::test]
async fn test_memory_owned_declared_memory_wins_over_export() {
    let engine = engine();
    let config = SandboxConfig::default();
    let mut ready = ready_with(&engine, &config, PLAIN, Some("plain")).await.expect("instantiate");
    assert!(ready.owned_memory.is_some());

    memory::handle(&mut ready, MemoryMessage::set(32, vec![0x7f], None)).expect("set");

    // "byte" reads memory 0, the imported one
    let response = call(&mut ready, "byte", [Value::I32(32)]).expect("byte");
    assert_eq!(response, RpcResponse::Return(vec![Value::I32(0x7f)]));

    let terminated = Arc::new(AtomicBool::new(false));
    let initializer = Initializer {
        engine: &engine,
        config: &config,
        resolver: &NoImports,
        terminated: &terminated,
    };
    assert!(initializer.exposed_memory(&mut ready).is_none());
}
