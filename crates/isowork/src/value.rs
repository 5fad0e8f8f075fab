//! # Call Values
//!
//! The plain data that travels with calls across the sandbox boundary.
//!
//! `wasmtime::Val` can hold store-bound references, so it never leaves the
//! sandbox thread. Calls carry `Value` instead and are converted at the
//! dispatcher, in both directions.

use wasmtime::Val;
use wasmtime::ValType;

/// A numeric WebAssembly value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Value {
    /// Converts a result produced by wasmtime. Returns `None` for vectors and references.
    pub fn from_val(val: &Val) -> Option<Self> {
        match val {
            Val::I32(v) => Some(Self::I32(*v)),
            Val::I64(v) => Some(Self::I64(*v)),
            Val::F32(bits) => Some(Self::F32(f32::from_bits(*bits))),
            Val::F64(bits) => Some(Self::F64(f64::from_bits(*bits))),
            _ => None,
        }
    }

    /// Builds the parameter for a slot of type `ty`.
    ///
    /// A missing argument becomes zero (`NaN` for floats); numbers are cast
    /// to the slot type. Returns `None` when `ty` is not numeric.
    pub fn coerce(arg: Option<&Value>, ty: &ValType) -> Option<Val> {
        let val = match (ty, arg) {
            (ValType::I32, None) => Val::I32(0),
            (ValType::I64, None) => Val::I64(0),
            (ValType::F32, None) => Val::F32(f32::NAN.to_bits()),
            (ValType::F64, None) => Val::F64(f64::NAN.to_bits()),
            (ValType::I32, Some(v)) => Val::I32(v.as_i64() as i32),
            (ValType::I64, Some(v)) => Val::I64(v.as_i64()),
            (ValType::F32, Some(v)) => Val::F32((v.as_f64() as f32).to_bits()),
            (ValType::F64, Some(v)) => Val::F64(v.as_f64().to_bits()),
            _ => return None,
        };
        Some(val)
    }

    pub fn as_i32(&self) -> i32 {
        self.as_i64() as i32
    }

    pub fn as_i64(&self) -> i64 {
        match *self {
            Self::I32(v) => v as i64,
            Self::I64(v) => v,
            Self::F32(v) => v as i64,
            Self::F64(v) => v as i64,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::I32(v) => v as f64,
            Self::I64(v) => v as f64,
            Self::F32(v) => v as f64,
            Self::F64(v) => v,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::I32(v) => write!(f, "{}i32", v),
            Self::I64(v) => write!(f, "{}i64", v),
            Self::F32(v) => write!(f, "{}f32", v),
            Self::F64(v) => write!(f, "{}f64", v),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::I32(v as i32)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::F32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}
