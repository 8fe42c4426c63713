//! Runtime contract between the host and the sandboxed format module

/// Exported symbol names the host binds to
pub mod exports {
    pub const MEMORY: &str = "memory";
    pub const MALLOC: &str = "malloc";
    pub const FREE: &str = "free";
    pub const LIVE_ALLOCATIONS: &str = "live_allocations";
    pub const VSNPRINTF: &str = "vsnprintf";
}

/// Function indices inside the generated module.
/// Each function also owns the type at the same index.
pub mod routines {
    pub const MALLOC: u32 = 0;
    pub const FREE: u32 = 1;
    pub const LIVE_ALLOCATIONS: u32 = 2;
    pub const VSNPRINTF: u32 = 3;
    pub const PUT: u32 = 4;
    pub const PAD: u32 = 5;
    pub const STRNLEN: u32 = 6;
    pub const PUT_BYTES: u32 = 7;
    pub const COUNT_DIGITS: u32 = 8;
    pub const PUT_DIGITS: u32 = 9;
    pub const POW10: u32 = 10;
    pub const FLAG_BIT: u32 = 11;
    pub const SIGN_CHAR: u32 = 12;
    pub const BEGIN_FIELD: u32 = 13;
    pub const END_FIELD: u32 = 14;
    pub const FMT_INT: u32 = 15;
    pub const LOAD_DECIMAL: u32 = 16;
    pub const FMT_EXP: u32 = 17;
    pub const FMT_FIXED: u32 = 18;
    pub const FMT_SPECIAL: u32 = 19;
    pub const FMT_FLOAT: u32 = 20;
    pub const DIGIT_AT: u32 = 21;
    pub const LEAD_DIGIT: u32 = 22;
    pub const ROUND_AT: u32 = 23;
    pub const PUT_DECIMALS: u32 = 24;
    pub const LAST_NONZERO: u32 = 25;

    pub const COUNT: u32 = 26;
}

/// Memory layout for the linear memory
pub mod memory {
    /// Initial memory size in WASM pages (64KB each)
    pub const INITIAL_PAGES: u32 = 1;

    /// Maximum memory size in WASM pages
    pub const MAX_PAGES: u32 = 64;

    /// log2 of the WASM page size
    pub const PAGE_SHIFT: u32 = 16;

    /// Current end of the bump heap; zero until the first allocation
    pub const HEAP_TOP: u32 = 16;

    /// Number of blocks handed out and not yet freed
    pub const LIVE_COUNT: u32 = 20;

    /// Output cursor state of the running `vsnprintf`
    pub const OUT_BASE: u32 = 24;
    pub const OUT_CAP: u32 = 28;
    pub const OUT_POS: u32 = 32;

    /// NUL-terminated text printed for a null `%s` argument
    pub const NULL_TEXT: u32 = 48;
    pub const NULL_TEXT_BYTES: &[u8] = b"(null)\0";

    /// Exact decimal expansion of the double being formatted.
    /// Base 10^9 limbs, most significant first; the first
    /// `DECIMAL_INT_LIMBS` hold the integer part.
    pub const DECIMAL_BASE: u32 = 64;
    pub const DECIMAL_LIMBS: u32 = 156;
    pub const DECIMAL_INT_LIMBS: u32 = 36;
    pub const LIMB_DIGITS: u32 = 9;
    pub const LIMB_RADIX: u32 = 1_000_000_000;

    /// First byte of the heap
    pub const HEAP_BASE: u32 = DECIMAL_BASE + DECIMAL_LIMBS * 4;

    /// Every block starts with `[magic: u32, size: u32]`
    pub const BLOCK_HEADER: u32 = 8;
    pub const BLOCK_ALIGN: u32 = 8;
    pub const MAGIC_LIVE: i32 = 0x4C49_5645;
    pub const MAGIC_FREED: i32 = 0x4652_4545;
}

/// Conversion flag bits parsed from a format directive
pub mod flags {
    pub const LEFT: i32 = 1;
    pub const PLUS: i32 = 2;
    pub const SPACE: i32 = 4;
    pub const ZERO: i32 = 8;
    pub const ALT: i32 = 16;
}

/// Width of a pointer in the sandbox address space
pub const POINTER_WIDTH: usize = 4;
