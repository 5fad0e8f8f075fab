//! # RPC Dispatcher
//!
//! Resolves a member name to an exported function and runs it to
//! completion on the sandbox thread.
//!
//! A name that does not resolve to a function is answered with an error
//! payload. Anything that goes wrong once a function was found (an
//! unsupported signature, a trap) is a fault and is not answered.

use wasmtime::Val;

use crate::fault::Fault;
use crate::message::RpcError;
use crate::message::RpcRequest;
use crate::message::RpcResponse;
use crate::state::Ready;
use crate::value::Value;

pub type Result<T> = std::result::Result<T, Fault>;

pub(crate) fn dispatch(ready: &mut Ready, request: RpcRequest) -> Result<RpcResponse> {
    let RpcRequest { member, args } = request;

    let Some(func) = ready.instance.get_func(&mut ready.store, &member) else {
        tracing::debug!(%member, "not a function");
        return Ok(RpcResponse::Error(RpcError::not_a_function(&member)));
    };

    let ty = func.ty(&ready.store);

    let mut params = Vec::with_capacity(ty.params().len());
    for (i, param) in ty.params().enumerate() {
        let val = Value::coerce(args.get(i), &param).ok_or_else(|| Fault::Signature {
            member: member.clone(),
            reason: format!("parameter {} has unsupported type {}", i, param),
        })?;
        params.push(val);
    }

    let mut results = vec![Val::I32(0); ty.results().len()];

    tracing::debug!(%member, args = args.len(), "dispatch");
    func.call(&mut ready.store, &params, &mut results)
        .map_err(|source| Fault::Trap {
            member: member.clone(),
            source,
        })?;

    let values = results
        .iter()
        .map(Value::from_val)
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| Fault::Signature {
            member: member.clone(),
            reason: "result has an unsupported type".to_string(),
        })?;

    Ok(RpcResponse::Return(values))
}
