//! C-level types of the format module mapped to WebAssembly types

use wasm_encoder::ValType;

use crate::wasm::runtime::routines;

/// C types crossing function boundaries inside the format module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WasmType {
    /// Address in linear memory (wasm32 pointer)
    Ptr,
    /// `int`, `size_t`, flags and characters
    Int,
    /// `unsigned long long` magnitudes
    Long,
    /// `double`
    Double,
}

impl WasmType {
    /// Convert to wasm-encoder ValType
    pub fn to_val_type(self) -> ValType {
        match self {
            WasmType::Ptr => ValType::I32,
            WasmType::Int => ValType::I32,
            WasmType::Long => ValType::I64,
            WasmType::Double => ValType::F64,
        }
    }
}

/// Function signature in WebAssembly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSignature {
    pub params: Vec<WasmType>,
    pub results: Vec<WasmType>,
}

impl FunctionSignature {
    /// Signature of the routine at `index` (see [`routines`]).
    /// Returns `None` for indices outside the module.
    pub fn for_routine(index: u32) -> Option<Self> {
        use WasmType::{Double, Int, Long, Ptr};

        let (params, results) = match index {
            routines::MALLOC => (vec![Int], vec![Ptr]),
            routines::FREE => (vec![Ptr], vec![]),
            routines::LIVE_ALLOCATIONS => (vec![], vec![Int]),
            // out, cap, fmt, va -> untruncated length
            routines::VSNPRINTF => (vec![Ptr, Int, Ptr, Ptr], vec![Int]),
            routines::PUT => (vec![Int], vec![]),
            routines::PAD => (vec![Int, Int], vec![]),
            routines::STRNLEN => (vec![Ptr, Int], vec![Int]),
            routines::PUT_BYTES => (vec![Ptr, Int], vec![]),
            routines::COUNT_DIGITS => (vec![Long, Int], vec![Int]),
            routines::PUT_DIGITS => (vec![Long, Int, Int], vec![]),
            routines::POW10 => (vec![Int], vec![Long]),
            routines::FLAG_BIT => (vec![Int], vec![Int]),
            routines::SIGN_CHAR => (vec![Int, Int], vec![Int]),
            routines::BEGIN_FIELD => (vec![Int, Int, Int, Int], vec![]),
            routines::END_FIELD => (vec![Int, Int, Int], vec![]),
            // magnitude, negative, base, flags, width, precision, uppercase
            routines::FMT_INT => (vec![Long, Int, Int, Int, Int, Int, Int], vec![]),
            routines::LOAD_DECIMAL => (vec![Double], vec![]),
            // negative, flags, width, precision, uppercase, strip zeros
            routines::FMT_EXP => (vec![Int, Int, Int, Int, Int, Int], vec![]),
            routines::FMT_FIXED => (vec![Int, Int, Int, Int, Int], vec![]),
            routines::FMT_SPECIAL => (vec![Int, Int, Int, Int, Int], vec![]),
            routines::FMT_FLOAT => (vec![Double, Int, Int, Int, Int], vec![]),
            // digit position -> digit
            routines::DIGIT_AT => (vec![Int], vec![Int]),
            routines::LEAD_DIGIT => (vec![], vec![Int]),
            routines::ROUND_AT => (vec![Int], vec![]),
            // first position, count
            routines::PUT_DECIMALS => (vec![Int, Int], vec![]),
            // first position, last position -> position
            routines::LAST_NONZERO => (vec![Int, Int], vec![Int]),
            _ => return None,
        };

        Some(Self { params, results })
    }
}
