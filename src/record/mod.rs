//! Compact record envelope and argument typing
//!
//! A compact record is a CBOR array `[format_id, arg0, arg1, ...]` emitted
//! by the device. Arguments carry just enough shape to recover the C type
//! the firmware passed to its logging call.

pub mod classify;
pub mod unpack;

pub use classify::classify;
pub use unpack::unpack;

/// One argument of a logging call, typed the way the device pushed it.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedArgument {
    /// `int`, and anything narrower after promotion
    Int32(i32),
    /// `long long`
    Int64(i64),
    /// `double` (floats are promoted)
    Double(f64),
    /// `char *`, passed as a sandbox address of a NUL-terminated copy
    StringRef(String),
}

impl TypedArgument {
    /// Bytes the argument occupies in a va_list, excluding padding.
    pub fn slot_size(&self) -> usize {
        match self {
            TypedArgument::Int32(_) => 4,
            TypedArgument::Int64(_) | TypedArgument::Double(_) => 8,
            TypedArgument::StringRef(_) => crate::wasm::runtime::POINTER_WIDTH,
        }
    }

    /// Whether the slot must start on an 8-byte boundary.
    pub fn needs_wide_alignment(&self) -> bool {
        matches!(self, TypedArgument::Int64(_) | TypedArgument::Double(_))
    }
}

impl From<i32> for TypedArgument {
    fn from(value: i32) -> Self {
        TypedArgument::Int32(value)
    }
}

impl From<i64> for TypedArgument {
    fn from(value: i64) -> Self {
        TypedArgument::Int64(value)
    }
}

impl From<f64> for TypedArgument {
    fn from(value: f64) -> Self {
        TypedArgument::Double(value)
    }
}

impl From<&str> for TypedArgument {
    fn from(value: &str) -> Self {
        TypedArgument::StringRef(value.to_string())
    }
}

impl From<String> for TypedArgument {
    fn from(value: String) -> Self {
        TypedArgument::StringRef(value)
    }
}

/// A decoded compact record.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactRecord {
    pub format_id: i64,
    pub arguments: Vec<TypedArgument>,
}
