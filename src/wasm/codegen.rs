//! WebAssembly code generation for the sandboxed format module
//!
//! The module is self-contained: no imports, one linear memory, a bump
//! allocator and a `vsnprintf` that reads its arguments from a wasm32
//! va_list buffer. Anything the formatter cannot interpret traps with
//! `unreachable`, which the host reports as a render fault.
//!
//! Floats are printed from an exact decimal expansion held in base-1e9
//! limbs at [`memory::DECIMAL_BASE`], rounded half-even at the last kept
//! digit.

use wasm_encoder::{
    BlockType, CodeSection, ConstExpr, DataSection, ExportKind, ExportSection, Function,
    FunctionSection, Instruction as WasmInst, MemArg, MemorySection, MemoryType, Module,
    TypeSection, ValType,
};

use crate::wasm::runtime::{exports, flags, memory, routines};
use crate::wasm::types::FunctionSignature;

/// WebAssembly code generator
pub struct WasmCodeGen {
    max_pages: u32,
}

impl WasmCodeGen {
    pub fn new() -> Self {
        Self {
            max_pages: memory::MAX_PAGES,
        }
    }

    /// Cap on linear memory growth, in 64KB pages
    pub fn with_max_pages(mut self, pages: u32) -> Self {
        self.max_pages = pages.max(memory::INITIAL_PAGES);
        self
    }

    /// Generate the complete format module
    pub fn generate(&self) -> Result<Vec<u8>, String> {
        let mut module = Module::new();

        // 1. Type section: one signature per routine, same index
        let mut types = TypeSection::new();
        for index in 0..routines::COUNT {
            let sig = FunctionSignature::for_routine(index)
                .ok_or_else(|| format!("No signature for routine {}", index))?;
            types.ty().function(
                sig.params.iter().map(|t| t.to_val_type()).collect::<Vec<_>>(),
                sig.results.iter().map(|t| t.to_val_type()).collect::<Vec<_>>(),
            );
        }

        // 2. Function section
        let mut functions = FunctionSection::new();
        for index in 0..routines::COUNT {
            functions.function(index);
        }

        // 3. Memory section: heap, va buffers and output all live here
        let mut memories = MemorySection::new();
        memories.memory(MemoryType {
            minimum: memory::INITIAL_PAGES.into(),
            maximum: Some(self.max_pages.into()),
            memory64: false,
            shared: false,
            page_size_log2: None,
        });

        // 4. Export section
        let mut exported = ExportSection::new();
        exported.export(exports::MEMORY, ExportKind::Memory, 0);
        exported.export(exports::MALLOC, ExportKind::Func, routines::MALLOC);
        exported.export(exports::FREE, ExportKind::Func, routines::FREE);
        exported.export(
            exports::LIVE_ALLOCATIONS,
            ExportKind::Func,
            routines::LIVE_ALLOCATIONS,
        );
        exported.export(exports::VSNPRINTF, ExportKind::Func, routines::VSNPRINTF);

        // 5. Code section
        let mut codes = CodeSection::new();
        for index in 0..routines::COUNT {
            let body = self.routine(index)?;
            codes.function(&body);
        }

        // 6. Data section: constant text
        let mut data = DataSection::new();
        data.active(
            0,
            &ConstExpr::i32_const(memory::NULL_TEXT as i32),
            memory::NULL_TEXT_BYTES.iter().copied(),
        );

        module.section(&types);
        module.section(&functions);
        module.section(&memories);
        module.section(&exported);
        module.section(&codes);
        module.section(&data);

        Ok(module.finish())
    }

    /// Generate and run the module through the validator
    pub fn generate_validated(&self) -> Result<Vec<u8>, String> {
        let bytes = self.generate()?;
        wasmparser::Validator::new()
            .validate_all(&bytes)
            .map_err(|e| format!("Generated module failed validation: {}", e))?;
        Ok(bytes)
    }

    fn routine(&self, index: u32) -> Result<Function, String> {
        match index {
            routines::MALLOC => malloc(),
            routines::FREE => free(),
            routines::LIVE_ALLOCATIONS => live_allocations(),
            routines::VSNPRINTF => vsnprintf(),
            routines::PUT => put(),
            routines::PAD => pad(),
            routines::STRNLEN => strnlen(),
            routines::PUT_BYTES => put_bytes(),
            routines::COUNT_DIGITS => count_digits(),
            routines::PUT_DIGITS => put_digits(),
            routines::POW10 => pow10(),
            routines::FLAG_BIT => flag_bit(),
            routines::SIGN_CHAR => sign_char(),
            routines::BEGIN_FIELD => begin_field(),
            routines::END_FIELD => end_field(),
            routines::FMT_INT => fmt_int(),
            routines::LOAD_DECIMAL => load_decimal(),
            routines::FMT_EXP => fmt_exp(),
            routines::FMT_FIXED => fmt_fixed(),
            routines::FMT_SPECIAL => fmt_special(),
            routines::FMT_FLOAT => fmt_float(),
            routines::DIGIT_AT => digit_at(),
            routines::LEAD_DIGIT => lead_digit(),
            routines::ROUND_AT => round_at(),
            routines::PUT_DECIMALS => put_decimals(),
            routines::LAST_NONZERO => last_nonzero(),
            _ => Err(format!("Unknown routine index {}", index)),
        }
    }
}

impl Default for WasmCodeGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Function body under construction with named structured-control labels
struct Body {
    func: Function,
    labels: Vec<&'static str>,
    error: Option<String>,
}

impl Body {
    fn new(locals: &[(u32, ValType)]) -> Self {
        Self {
            func: Function::new(locals.iter().copied()),
            labels: Vec::new(),
            error: None,
        }
    }

    fn op(&mut self, inst: WasmInst<'_>) -> &mut Self {
        self.func.instruction(&inst);
        self
    }

    fn ops(&mut self, insts: &[WasmInst<'_>]) -> &mut Self {
        for inst in insts {
            self.func.instruction(inst);
        }
        self
    }

    fn block(&mut self, label: &'static str) -> &mut Self {
        self.labels.push(label);
        self.op(WasmInst::Block(BlockType::Empty))
    }

    fn looped(&mut self, label: &'static str) -> &mut Self {
        self.labels.push(label);
        self.op(WasmInst::Loop(BlockType::Empty))
    }

    /// Pops the i32 condition
    fn if_(&mut self) -> &mut Self {
        self.labels.push("if");
        self.op(WasmInst::If(BlockType::Empty))
    }

    fn else_(&mut self) -> &mut Self {
        self.op(WasmInst::Else)
    }

    fn end(&mut self) -> &mut Self {
        if self.labels.pop().is_none() {
            self.fail("end without open block".to_string());
        }
        self.op(WasmInst::End)
    }

    fn br(&mut self, label: &'static str) -> &mut Self {
        let depth = self.depth(label);
        self.op(WasmInst::Br(depth))
    }

    fn br_if(&mut self, label: &'static str) -> &mut Self {
        let depth = self.depth(label);
        self.op(WasmInst::BrIf(depth))
    }

    fn depth(&mut self, label: &'static str) -> u32 {
        match self.labels.iter().rev().position(|l| *l == label) {
            Some(depth) => depth as u32,
            None => {
                self.fail(format!("branch to unknown label `{}`", label));
                0
            }
        }
    }

    fn f64_const(&mut self, value: f64) -> &mut Self {
        self.ops(&[
            WasmInst::I64Const(value.to_bits() as i64),
            WasmInst::F64ReinterpretI64,
        ])
    }

    /// `local += delta`
    fn bump(&mut self, local: u32, delta: i32) -> &mut Self {
        self.ops(&[
            WasmInst::LocalGet(local),
            WasmInst::I32Const(delta),
            WasmInst::I32Add,
            WasmInst::LocalSet(local),
        ])
    }

    /// Push the i32 stored at a fixed address
    fn load_cell(&mut self, addr: u32) -> &mut Self {
        self.ops(&[WasmInst::I32Const(0), WasmInst::I32Load(word(addr))])
    }

    /// Store `local` into a fixed address
    fn store_cell(&mut self, addr: u32, local: u32) -> &mut Self {
        self.ops(&[
            WasmInst::I32Const(0),
            WasmInst::LocalGet(local),
            WasmInst::I32Store(word(addr)),
        ])
    }

    fn fail(&mut self, message: String) {
        if self.error.is_none() {
            self.error = Some(message);
        }
    }

    fn finish(mut self) -> Result<Function, String> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        if !self.labels.is_empty() {
            return Err(format!("unclosed blocks: {:?}", self.labels));
        }
        self.func.instruction(&WasmInst::End);
        Ok(self.func)
    }
}

const fn byte(offset: u32) -> MemArg {
    MemArg {
        offset: offset as u64,
        align: 0,
        memory_index: 0,
    }
}

const fn word(offset: u32) -> MemArg {
    MemArg {
        offset: offset as u64,
        align: 2,
        memory_index: 0,
    }
}

const fn dword(offset: u32) -> MemArg {
    MemArg {
        offset: offset as u64,
        align: 3,
        memory_index: 0,
    }
}

const fn ch(c: u8) -> WasmInst<'static> {
    WasmInst::I32Const(c as i32)
}

use WasmInst as I;

/// `malloc(n) -> ptr`: bump allocation with a `[magic, size]` header
fn malloc() -> Result<Function, String> {
    const N: u32 = 0;
    const TOP: u32 = 1;
    const USER: u32 = 2;
    const END: u32 = 3;
    const HAVE: u32 = 4;

    let mut b = Body::new(&[(4, ValType::I32)]);

    // Oversized requests never fit in the capped memory
    b.ops(&[I::LocalGet(N), I::I32Const(0x0100_0000), I::I32GtU]);
    b.if_().ops(&[I::I32Const(0), I::Return]).end();

    b.load_cell(memory::HEAP_TOP).op(I::LocalSet(TOP));
    b.ops(&[I::LocalGet(TOP), I::I32Eqz]);
    b.if_()
        .ops(&[I::I32Const(memory::HEAP_BASE as i32), I::LocalSet(TOP)])
        .end();

    b.ops(&[
        I::LocalGet(TOP),
        I::I32Const(memory::BLOCK_HEADER as i32),
        I::I32Add,
        I::LocalSet(USER),
        I::LocalGet(USER),
        I::LocalGet(N),
        I::I32Const(memory::BLOCK_ALIGN as i32 - 1),
        I::I32Add,
        I::I32Const(-(memory::BLOCK_ALIGN as i32)),
        I::I32And,
        I::I32Add,
        I::LocalSet(END),
        I::MemorySize(0),
        I::I32Const(memory::PAGE_SHIFT as i32),
        I::I32Shl,
        I::LocalSet(HAVE),
    ]);

    // Grow by the missing whole pages
    b.ops(&[I::LocalGet(END), I::LocalGet(HAVE), I::I32GtU]);
    b.if_().ops(&[
        I::LocalGet(END),
        I::LocalGet(HAVE),
        I::I32Sub,
        I::I32Const((1 << memory::PAGE_SHIFT) - 1),
        I::I32Add,
        I::I32Const(memory::PAGE_SHIFT as i32),
        I::I32ShrU,
        I::MemoryGrow(0),
        I::I32Const(-1),
        I::I32Eq,
    ]);
    b.if_().ops(&[I::I32Const(0), I::Return]).end();
    b.end();

    b.ops(&[
        I::LocalGet(TOP),
        I::I32Const(memory::MAGIC_LIVE),
        I::I32Store(word(0)),
        I::LocalGet(TOP),
        I::LocalGet(N),
        I::I32Store(word(4)),
    ]);
    b.store_cell(memory::HEAP_TOP, END);
    b.ops(&[I::I32Const(0)])
        .load_cell(memory::LIVE_COUNT)
        .ops(&[
            I::I32Const(1),
            I::I32Add,
            I::I32Store(word(memory::LIVE_COUNT)),
            I::LocalGet(USER),
        ]);

    b.finish()
}

/// `free(ptr)`: traps unless `ptr` heads a live block
fn free() -> Result<Function, String> {
    const PTR: u32 = 0;
    const LIVE: u32 = 1;

    let mut b = Body::new(&[(1, ValType::I32)]);

    b.ops(&[I::LocalGet(PTR), I::I32Eqz]);
    b.if_().op(I::Return).end();

    b.ops(&[
        I::LocalGet(PTR),
        I::I32Const(memory::BLOCK_HEADER as i32),
        I::I32Sub,
        I::I32Load(word(0)),
        I::I32Const(memory::MAGIC_LIVE),
        I::I32Ne,
    ]);
    b.if_().op(I::Unreachable).end();

    b.ops(&[
        I::LocalGet(PTR),
        I::I32Const(memory::BLOCK_HEADER as i32),
        I::I32Sub,
        I::I32Const(memory::MAGIC_FREED),
        I::I32Store(word(0)),
    ]);
    b.load_cell(memory::LIVE_COUNT)
        .ops(&[I::I32Const(1), I::I32Sub, I::LocalSet(LIVE)]);
    b.store_cell(memory::LIVE_COUNT, LIVE);

    // Last block out resets the heap
    b.ops(&[I::LocalGet(LIVE), I::I32Eqz]);
    b.if_()
        .ops(&[
            I::I32Const(0),
            I::I32Const(memory::HEAP_BASE as i32),
            I::I32Store(word(memory::HEAP_TOP)),
        ])
        .end();

    b.finish()
}

fn live_allocations() -> Result<Function, String> {
    let mut b = Body::new(&[]);
    b.load_cell(memory::LIVE_COUNT);
    b.finish()
}

/// `put(c)`: append one byte, keeping room for the terminator
fn put() -> Result<Function, String> {
    const C: u32 = 0;
    const POS: u32 = 1;

    let mut b = Body::new(&[(1, ValType::I32)]);

    b.load_cell(memory::OUT_POS).op(I::LocalSet(POS));
    b.ops(&[I::LocalGet(POS), I::I32Const(1), I::I32Add])
        .load_cell(memory::OUT_CAP)
        .op(I::I32LtU);
    b.if_()
        .load_cell(memory::OUT_BASE)
        .ops(&[
            I::LocalGet(POS),
            I::I32Add,
            I::LocalGet(C),
            I::I32Store8(byte(0)),
        ])
        .end();
    b.ops(&[
        I::I32Const(0),
        I::LocalGet(POS),
        I::I32Const(1),
        I::I32Add,
        I::I32Store(word(memory::OUT_POS)),
    ]);

    b.finish()
}

/// `pad(c, count)`: repeat `c`; once the buffer is full only the count advances
fn pad() -> Result<Function, String> {
    const C: u32 = 0;
    const COUNT: u32 = 1;
    const POS: u32 = 2;

    let mut b = Body::new(&[(1, ValType::I32)]);

    b.block("done").looped("next");
    b.ops(&[I::LocalGet(COUNT), I::I32Const(0), I::I32LeS])
        .br_if("done");
    b.load_cell(memory::OUT_POS).op(I::LocalSet(POS));
    b.ops(&[I::LocalGet(POS), I::I32Const(1), I::I32Add])
        .load_cell(memory::OUT_CAP)
        .op(I::I32GeU);
    b.if_()
        .ops(&[
            I::I32Const(0),
            I::LocalGet(POS),
            I::LocalGet(COUNT),
            I::I32Add,
            I::I32Store(word(memory::OUT_POS)),
        ])
        .br("done")
        .end();
    b.ops(&[I::LocalGet(C), I::Call(routines::PUT)]);
    b.bump(COUNT, -1).br("next");
    b.end().end();

    b.finish()
}

/// `strnlen(ptr, limit)`: a negative limit means unbounded
fn strnlen() -> Result<Function, String> {
    const PTR: u32 = 0;
    const LIMIT: u32 = 1;
    const N: u32 = 2;

    let mut b = Body::new(&[(1, ValType::I32)]);

    b.block("done").looped("next");
    b.ops(&[
        I::LocalGet(LIMIT),
        I::I32Const(0),
        I::I32GeS,
        I::LocalGet(N),
        I::LocalGet(LIMIT),
        I::I32GeS,
        I::I32And,
    ])
    .br_if("done");
    b.ops(&[
        I::LocalGet(PTR),
        I::LocalGet(N),
        I::I32Add,
        I::I32Load8U(byte(0)),
        I::I32Eqz,
    ])
    .br_if("done");
    b.bump(N, 1).br("next");
    b.end().end();
    b.op(I::LocalGet(N));

    b.finish()
}

fn put_bytes() -> Result<Function, String> {
    const PTR: u32 = 0;
    const LEN: u32 = 1;
    const I_: u32 = 2;

    let mut b = Body::new(&[(1, ValType::I32)]);

    b.block("done").looped("next");
    b.ops(&[I::LocalGet(I_), I::LocalGet(LEN), I::I32GeU])
        .br_if("done");
    b.ops(&[
        I::LocalGet(PTR),
        I::LocalGet(I_),
        I::I32Add,
        I::I32Load8U(byte(0)),
        I::Call(routines::PUT),
    ]);
    b.bump(I_, 1).br("next");
    b.end().end();

    b.finish()
}

/// `count_digits(v, base)`: digits of unsigned `v`, at least one
fn count_digits() -> Result<Function, String> {
    const V: u32 = 0;
    const BASE: u32 = 1;
    const B64: u32 = 2;
    const D: u32 = 3;
    const N: u32 = 4;

    let mut b = Body::new(&[(2, ValType::I64), (1, ValType::I32)]);

    b.ops(&[
        I::LocalGet(BASE),
        I::I64ExtendI32U,
        I::LocalSet(B64),
        I::I64Const(1),
        I::LocalSet(D),
        I::I32Const(1),
        I::LocalSet(N),
    ]);
    b.block("done").looped("next");
    b.ops(&[
        I::LocalGet(V),
        I::LocalGet(D),
        I::I64DivU,
        I::LocalGet(B64),
        I::I64LtU,
    ])
    .br_if("done");
    b.ops(&[
        I::LocalGet(D),
        I::LocalGet(B64),
        I::I64Mul,
        I::LocalSet(D),
    ]);
    b.bump(N, 1).br("next");
    b.end().end();
    b.op(I::LocalGet(N));

    b.finish()
}

/// `put_digits(v, base, upper)`: most significant digit first
fn put_digits() -> Result<Function, String> {
    const V: u32 = 0;
    const BASE: u32 = 1;
    const UPPER: u32 = 2;
    const B64: u32 = 3;
    const D: u32 = 4;
    const DIGIT: u32 = 5;

    let mut b = Body::new(&[(2, ValType::I64), (1, ValType::I32)]);

    b.ops(&[
        I::LocalGet(BASE),
        I::I64ExtendI32U,
        I::LocalSet(B64),
        I::I64Const(1),
        I::LocalSet(D),
    ]);
    b.block("scaled").looped("grow");
    b.ops(&[
        I::LocalGet(V),
        I::LocalGet(D),
        I::I64DivU,
        I::LocalGet(B64),
        I::I64LtU,
    ])
    .br_if("scaled");
    b.ops(&[
        I::LocalGet(D),
        I::LocalGet(B64),
        I::I64Mul,
        I::LocalSet(D),
    ])
    .br("grow");
    b.end().end();

    b.looped("emit");
    b.ops(&[
        I::LocalGet(V),
        I::LocalGet(D),
        I::I64DivU,
        I::I32WrapI64,
        I::LocalSet(DIGIT),
        I::LocalGet(V),
        I::LocalGet(D),
        I::I64RemU,
        I::LocalSet(V),
        // '0' + digit, or 'a'/'A' + digit - 10
        I::LocalGet(DIGIT),
        I::I32Const(b'0' as i32),
        I::I32Add,
        I::LocalGet(DIGIT),
        I::I32Const(b'A' as i32 - 10),
        I::I32Const(b'a' as i32 - 10),
        I::LocalGet(UPPER),
        I::Select,
        I::I32Add,
        I::LocalGet(DIGIT),
        I::I32Const(10),
        I::I32LtU,
        I::Select,
        I::Call(routines::PUT),
        I::LocalGet(D),
        I::LocalGet(B64),
        I::I64DivU,
        I::LocalTee(D),
        I::I64Const(0),
        I::I64Ne,
    ])
    .br_if("emit");
    b.end();

    b.finish()
}

fn pow10() -> Result<Function, String> {
    const N: u32 = 0;
    const R: u32 = 1;

    let mut b = Body::new(&[(1, ValType::I64)]);

    b.ops(&[I::I64Const(1), I::LocalSet(R)]);
    b.block("done").looped("next");
    b.ops(&[I::LocalGet(N), I::I32Const(0), I::I32LeS])
        .br_if("done");
    b.ops(&[
        I::LocalGet(R),
        I::I64Const(10),
        I::I64Mul,
        I::LocalSet(R),
    ]);
    b.bump(N, -1).br("next");
    b.end().end();
    b.op(I::LocalGet(R));

    b.finish()
}

/// `flag_bit(c)`: bit for a flag character, 0 otherwise
fn flag_bit() -> Result<Function, String> {
    const C: u32 = 0;

    let mut b = Body::new(&[]);

    b.ops(&[
        I::I32Const(flags::LEFT),
        I::I32Const(flags::PLUS),
        I::I32Const(flags::SPACE),
        I::I32Const(flags::ZERO),
        I::I32Const(flags::ALT),
        I::I32Const(0),
        I::LocalGet(C),
        ch(b'#'),
        I::I32Eq,
        I::Select,
        I::LocalGet(C),
        ch(b'0'),
        I::I32Eq,
        I::Select,
        I::LocalGet(C),
        ch(b' '),
        I::I32Eq,
        I::Select,
        I::LocalGet(C),
        ch(b'+'),
        I::I32Eq,
        I::Select,
        I::LocalGet(C),
        ch(b'-'),
        I::I32Eq,
        I::Select,
    ]);

    b.finish()
}

/// `sign_char(negative, flags)`: '-', '+', ' ' or 0
fn sign_char() -> Result<Function, String> {
    const NEG: u32 = 0;
    const FLAGS: u32 = 1;

    let mut b = Body::new(&[]);

    b.ops(&[
        ch(b'-'),
        ch(b'+'),
        ch(b' '),
        I::I32Const(0),
        I::LocalGet(FLAGS),
        I::I32Const(flags::SPACE),
        I::I32And,
        I::Select,
        I::LocalGet(FLAGS),
        I::I32Const(flags::PLUS),
        I::I32And,
        I::Select,
        I::LocalGet(NEG),
        I::Select,
    ]);

    b.finish()
}

/// `begin_field(len, sign, flags, width)`: leading spaces, sign, zero fill
fn begin_field() -> Result<Function, String> {
    const LEN: u32 = 0;
    const SIGN: u32 = 1;
    const FLAGS: u32 = 2;
    const WIDTH: u32 = 3;

    let mut b = Body::new(&[]);

    b.ops(&[
        I::LocalGet(FLAGS),
        I::I32Const(flags::LEFT | flags::ZERO),
        I::I32And,
        I::I32Eqz,
    ]);
    b.if_()
        .ops(&[
            ch(b' '),
            I::LocalGet(WIDTH),
            I::LocalGet(LEN),
            I::I32Sub,
            I::Call(routines::PAD),
        ])
        .end();

    b.op(I::LocalGet(SIGN));
    b.if_()
        .ops(&[I::LocalGet(SIGN), I::Call(routines::PUT)])
        .end();

    b.ops(&[
        I::LocalGet(FLAGS),
        I::I32Const(flags::LEFT | flags::ZERO),
        I::I32And,
        I::I32Const(flags::ZERO),
        I::I32Eq,
    ]);
    b.if_()
        .ops(&[
            ch(b'0'),
            I::LocalGet(WIDTH),
            I::LocalGet(LEN),
            I::I32Sub,
            I::Call(routines::PAD),
        ])
        .end();

    b.finish()
}

/// `end_field(len, flags, width)`: trailing spaces for left-justified fields
fn end_field() -> Result<Function, String> {
    const LEN: u32 = 0;
    const FLAGS: u32 = 1;
    const WIDTH: u32 = 2;

    let mut b = Body::new(&[]);

    b.ops(&[I::LocalGet(FLAGS), I::I32Const(flags::LEFT), I::I32And]);
    b.if_()
        .ops(&[
            ch(b' '),
            I::LocalGet(WIDTH),
            I::LocalGet(LEN),
            I::I32Sub,
            I::Call(routines::PAD),
        ])
        .end();

    b.finish()
}

/// `fmt_int(magnitude, negative, base, flags, width, precision, upper)`
fn fmt_int() -> Result<Function, String> {
    const MAG: u32 = 0;
    const NEG: u32 = 1;
    const BASE: u32 = 2;
    const FLAGS: u32 = 3;
    const WIDTH: u32 = 4;
    const PREC: u32 = 5;
    const UPPER: u32 = 6;
    const SIGN: u32 = 7;
    const N: u32 = 8;
    const ZEROS: u32 = 9;
    const PREFIX: u32 = 10;
    const LEN: u32 = 11;

    let mut b = Body::new(&[(5, ValType::I32)]);

    b.ops(&[
        I::LocalGet(NEG),
        I::LocalGet(FLAGS),
        I::Call(routines::SIGN_CHAR),
        I::LocalSet(SIGN),
    ]);

    // Zero with an explicit zero precision prints no digits
    b.ops(&[
        I::LocalGet(MAG),
        I::I64Eqz,
        I::LocalGet(PREC),
        I::I32Eqz,
        I::I32And,
    ]);
    b.if_()
        .ops(&[I::I32Const(0), I::LocalSet(N)])
        .else_()
        .ops(&[
            I::LocalGet(MAG),
            I::LocalGet(BASE),
            I::Call(routines::COUNT_DIGITS),
            I::LocalSet(N),
        ])
        .end();

    b.ops(&[
        I::LocalGet(PREC),
        I::LocalGet(N),
        I::I32Sub,
        I::LocalTee(ZEROS),
        I::I32Const(0),
        I::I32LtS,
    ]);
    b.if_().ops(&[I::I32Const(0), I::LocalSet(ZEROS)]).end();

    b.ops(&[I::LocalGet(FLAGS), I::I32Const(flags::ALT), I::I32And]);
    b.if_();
    {
        b.ops(&[
            I::LocalGet(BASE),
            I::I32Const(16),
            I::I32Eq,
            I::LocalGet(MAG),
            I::I64Eqz,
            I::I32Eqz,
            I::I32And,
        ]);
        b.if_().ops(&[I::I32Const(2), I::LocalSet(PREFIX)]).end();

        // Octal alternate form: the first digit must be a zero
        b.ops(&[
            I::LocalGet(BASE),
            I::I32Const(8),
            I::I32Eq,
            I::LocalGet(ZEROS),
            I::I32Eqz,
            I::I32And,
            I::LocalGet(MAG),
            I::I64Eqz,
            I::I32Eqz,
            I::LocalGet(N),
            I::I32Eqz,
            I::I32Or,
            I::I32And,
        ]);
        b.if_().ops(&[I::I32Const(1), I::LocalSet(ZEROS)]).end();
    }
    b.end();

    b.ops(&[
        I::LocalGet(SIGN),
        I::I32Const(0),
        I::I32Ne,
        I::LocalGet(PREFIX),
        I::I32Add,
        I::LocalGet(ZEROS),
        I::I32Add,
        I::LocalGet(N),
        I::I32Add,
        I::LocalSet(LEN),
    ]);

    // '0' flag only applies without a precision
    b.ops(&[
        I::LocalGet(FLAGS),
        I::I32Const(flags::LEFT | flags::ZERO),
        I::I32And,
        I::I32Const(flags::ZERO),
        I::I32Eq,
        I::LocalGet(PREC),
        I::I32Const(0),
        I::I32LtS,
        I::I32And,
    ]);
    b.if_();
    b.ops(&[I::LocalGet(WIDTH), I::LocalGet(LEN), I::I32GtS]);
    b.if_()
        .ops(&[
            I::LocalGet(ZEROS),
            I::LocalGet(WIDTH),
            I::LocalGet(LEN),
            I::I32Sub,
            I::I32Add,
            I::LocalSet(ZEROS),
            I::LocalGet(WIDTH),
            I::LocalSet(LEN),
        ])
        .end();
    b.end();

    b.ops(&[
        I::LocalGet(LEN),
        I::LocalGet(SIGN),
        I::LocalGet(FLAGS),
        I::I32Const(!flags::ZERO),
        I::I32And,
        I::LocalGet(WIDTH),
        I::Call(routines::BEGIN_FIELD),
    ]);

    b.op(I::LocalGet(PREFIX));
    b.if_()
        .ops(&[
            ch(b'0'),
            I::Call(routines::PUT),
            ch(b'X'),
            ch(b'x'),
            I::LocalGet(UPPER),
            I::Select,
            I::Call(routines::PUT),
        ])
        .end();

    b.ops(&[ch(b'0'), I::LocalGet(ZEROS), I::Call(routines::PAD)]);

    b.op(I::LocalGet(N));
    b.if_()
        .ops(&[
            I::LocalGet(MAG),
            I::LocalGet(BASE),
            I::LocalGet(UPPER),
            I::Call(routines::PUT_DIGITS),
        ])
        .end();

    b.ops(&[
        I::LocalGet(LEN),
        I::LocalGet(FLAGS),
        I::LocalGet(WIDTH),
        I::Call(routines::END_FIELD),
    ]);

    b.finish()
}

/// Position of the units digit in the decimal buffer
const UNITS: i32 = (memory::DECIMAL_INT_LIMBS * memory::LIMB_DIGITS) as i32 - 1;

/// Digits the decimal buffer holds; later positions read as zero
const DIGITS: i32 = (memory::DECIMAL_LIMBS * memory::LIMB_DIGITS) as i32;

const LIMBS: i32 = memory::DECIMAL_LIMBS as i32;
const PER_LIMB: i32 = memory::LIMB_DIGITS as i32;
const RADIX: i32 = memory::LIMB_RADIX as i32;

/// Largest binary shift per pass: `limb << 29` and `remainder * RADIX` stay below 2^64
const MAX_SHIFT: i32 = 29;

/// Limb access; the buffer offset lives in the memarg
const LIMB: MemArg = word(memory::DECIMAL_BASE);

/// Emit the buffer-relative address of limb `index`
fn limb_addr(b: &mut Body, index: u32) -> &mut Body {
    b.ops(&[I::LocalGet(index), I::I32Const(2), I::I32Shl])
}

/// `load_decimal(x)`: exact decimal expansion of finite `x >= 0`
fn load_decimal() -> Result<Function, String> {
    const X: u32 = 0;
    const BITS: u32 = 1;
    const M: u32 = 2;
    const CARRY: u32 = 3;
    const CUR: u32 = 4;
    const E2: u32 = 5;
    const SHIFT: u32 = 6;
    const K: u32 = 7;

    let mut b = Body::new(&[(4, ValType::I64), (3, ValType::I32)]);

    b.ops(&[
        I::I32Const(memory::DECIMAL_BASE as i32),
        I::I32Const(0),
        I::I32Const(LIMBS * 4),
        I::MemoryFill(0),
        I::LocalGet(X),
        I::I64ReinterpretF64,
        I::LocalTee(BITS),
        I::I64Const((1 << 52) - 1),
        I::I64And,
        I::LocalSet(M),
        I::LocalGet(BITS),
        I::I64Const(52),
        I::I64ShrU,
        I::I32WrapI64,
        I::I32Const(0x7FF),
        I::I32And,
        I::LocalTee(E2),
    ]);
    // Subnormals have no implicit bit
    b.if_()
        .ops(&[
            I::LocalGet(M),
            I::I64Const(1 << 52),
            I::I64Or,
            I::LocalSet(M),
            I::LocalGet(E2),
            I::I32Const(1075),
            I::I32Sub,
            I::LocalSet(E2),
        ])
        .else_()
        .ops(&[I::I32Const(-1074), I::LocalSet(E2)])
        .end();

    b.ops(&[I::LocalGet(M), I::I64Eqz]);
    b.if_().op(I::Return).end();

    // x = m * 2^e2 with m < 2^53, which fits the two lowest integer limbs
    let low = memory::DECIMAL_BASE + (memory::DECIMAL_INT_LIMBS - 1) * 4;
    b.ops(&[
        I::I32Const(0),
        I::LocalGet(M),
        I::I64Const(RADIX.into()),
        I::I64RemU,
        I::I32WrapI64,
        I::I32Store(word(low)),
        I::I32Const(0),
        I::LocalGet(M),
        I::I64Const(RADIX.into()),
        I::I64DivU,
        I::I32WrapI64,
        I::I32Store(word(low - 4)),
    ]);

    // Multiply by 2^e2, least significant integer limb first
    b.block("up_done").looped("up");
    b.ops(&[I::LocalGet(E2), I::I32Const(0), I::I32LeS])
        .br_if("up_done");
    b.ops(&[
        I::LocalGet(E2),
        I::I32Const(MAX_SHIFT),
        I::LocalGet(E2),
        I::I32Const(MAX_SHIFT),
        I::I32LtS,
        I::Select,
        I::LocalSet(SHIFT),
        I::LocalGet(E2),
        I::LocalGet(SHIFT),
        I::I32Sub,
        I::LocalSet(E2),
        I::I64Const(0),
        I::LocalSet(CARRY),
        I::I32Const(memory::DECIMAL_INT_LIMBS as i32 - 1),
        I::LocalSet(K),
    ]);
    b.block("up_limbs_done").looped("up_limb");
    b.ops(&[I::LocalGet(K), I::I32Const(0), I::I32LtS])
        .br_if("up_limbs_done");
    limb_addr(&mut b, K);
    limb_addr(&mut b, K).ops(&[
        I::I32Load(LIMB),
        I::I64ExtendI32U,
        I::LocalGet(SHIFT),
        I::I64ExtendI32U,
        I::I64Shl,
        I::LocalGet(CARRY),
        I::I64Add,
        I::LocalTee(CUR),
        I::I64Const(RADIX.into()),
        I::I64RemU,
        I::I32WrapI64,
        I::I32Store(LIMB),
        I::LocalGet(CUR),
        I::I64Const(RADIX.into()),
        I::I64DivU,
        I::LocalSet(CARRY),
    ]);
    b.bump(K, -1).br("up_limb");
    b.end().end();
    b.br("up");
    b.end().end();

    // Divide by 2^-e2, most significant limb first; remainders move right
    b.block("down_done").looped("down");
    b.ops(&[I::LocalGet(E2), I::I32Const(0), I::I32GeS])
        .br_if("down_done");
    b.ops(&[
        I::I32Const(0),
        I::LocalGet(E2),
        I::I32Sub,
        I::LocalTee(SHIFT),
        I::I32Const(MAX_SHIFT),
        I::LocalGet(SHIFT),
        I::I32Const(MAX_SHIFT),
        I::I32LtS,
        I::Select,
        I::LocalSet(SHIFT),
        I::LocalGet(E2),
        I::LocalGet(SHIFT),
        I::I32Add,
        I::LocalSet(E2),
        I::I64Const(0),
        I::LocalSet(CARRY),
        I::I32Const(0),
        I::LocalSet(K),
    ]);
    b.block("down_limbs_done").looped("down_limb");
    b.ops(&[I::LocalGet(K), I::I32Const(LIMBS), I::I32GeS])
        .br_if("down_limbs_done");
    limb_addr(&mut b, K);
    b.ops(&[
        I::LocalGet(CARRY),
        I::I64Const(RADIX.into()),
        I::I64Mul,
    ]);
    limb_addr(&mut b, K).ops(&[
        I::I32Load(LIMB),
        I::I64ExtendI32U,
        I::I64Add,
        I::LocalTee(CUR),
        I::LocalGet(SHIFT),
        I::I64ExtendI32U,
        I::I64ShrU,
        I::I32WrapI64,
        I::I32Store(LIMB),
        I::LocalGet(CUR),
        I::I64Const(1),
        I::LocalGet(SHIFT),
        I::I64ExtendI32U,
        I::I64Shl,
        I::I64Const(1),
        I::I64Sub,
        I::I64And,
        I::LocalSet(CARRY),
    ]);
    b.bump(K, 1).br("down_limb");
    b.end().end();
    b.br("down");
    b.end().end();

    b.finish()
}

/// `digit_at(position) -> digit`; positions outside the buffer read as zero
fn digit_at() -> Result<Function, String> {
    const POS: u32 = 0;

    let mut b = Body::new(&[]);

    b.ops(&[I::LocalGet(POS), I::I32Const(DIGITS), I::I32GeU]);
    b.if_().ops(&[I::I32Const(0), I::Return]).end();

    b.ops(&[
        I::LocalGet(POS),
        I::I32Const(PER_LIMB),
        I::I32DivU,
        I::I32Const(2),
        I::I32Shl,
        I::I32Load(LIMB),
        I::I64ExtendI32U,
        I::I32Const(PER_LIMB - 1),
        I::LocalGet(POS),
        I::I32Const(PER_LIMB),
        I::I32RemU,
        I::I32Sub,
        I::Call(routines::POW10),
        I::I64DivU,
        I::I64Const(10),
        I::I64RemU,
        I::I32WrapI64,
    ]);

    b.finish()
}

/// `lead_digit() -> position` of the first nonzero digit; the units digit when zero
fn lead_digit() -> Result<Function, String> {
    const K: u32 = 0;
    const V: u32 = 1;

    let mut b = Body::new(&[(2, ValType::I32)]);

    b.block("zero").looped("scan");
    b.ops(&[I::LocalGet(K), I::I32Const(LIMBS), I::I32GeS])
        .br_if("zero");
    limb_addr(&mut b, K).ops(&[I::I32Load(LIMB), I::LocalTee(V)]);
    b.if_()
        .ops(&[
            I::LocalGet(K),
            I::I32Const(PER_LIMB),
            I::I32Mul,
            I::I32Const(PER_LIMB),
            I::I32Add,
            I::LocalGet(V),
            I::I64ExtendI32U,
            I::I32Const(10),
            I::Call(routines::COUNT_DIGITS),
            I::I32Sub,
            I::Return,
        ])
        .end();
    b.bump(K, 1).br("scan");
    b.end().end();
    b.op(I::I32Const(UNITS));

    b.finish()
}

/// `round_at(position)`: round half to even so that `position` holds the
/// last significant digit. Every later digit ends up zero.
fn round_at() -> Result<Function, String> {
    const CUT: u32 = 0;
    const NEXT: u32 = 1;
    const STICKY: u32 = 2;
    const K: u32 = 3;
    const KEEP: u32 = 4;
    const V: u32 = 5;

    let mut b = Body::new(&[(5, ValType::I32)]);

    b.ops(&[I::LocalGet(CUT), I::I32Const(DIGITS - 1), I::I32GeS]);
    b.if_().op(I::Return).end();

    // The digit after the cut, and whether anything nonzero follows it
    b.ops(&[
        I::LocalGet(CUT),
        I::I32Const(1),
        I::I32Add,
        I::Call(routines::DIGIT_AT),
        I::LocalSet(NEXT),
        I::LocalGet(CUT),
        I::I32Const(1),
        I::I32Add,
        I::I32Const(PER_LIMB),
        I::I32DivU,
        I::LocalSet(K),
    ]);
    limb_addr(&mut b, K).ops(&[
        I::I32Load(LIMB),
        I::I64ExtendI32U,
        I::I32Const(PER_LIMB - 1),
        I::LocalGet(CUT),
        I::I32Const(1),
        I::I32Add,
        I::I32Const(PER_LIMB),
        I::I32RemU,
        I::I32Sub,
        I::Call(routines::POW10),
        I::I64RemU,
        I::I64Const(0),
        I::I64Ne,
        I::LocalSet(STICKY),
    ]);
    b.block("scanned").looped("scan");
    b.bump(K, 1);
    b.ops(&[I::LocalGet(K), I::I32Const(LIMBS), I::I32GeS])
        .br_if("scanned");
    limb_addr(&mut b, K).ops(&[
        I::I32Load(LIMB),
        I::I32Const(0),
        I::I32Ne,
        I::LocalGet(STICKY),
        I::I32Or,
        I::LocalSet(STICKY),
    ]);
    b.br("scan");
    b.end().end();

    // Truncate after the cut
    b.ops(&[
        I::LocalGet(CUT),
        I::I32Const(PER_LIMB),
        I::I32DivU,
        I::LocalSet(K),
        I::I32Const(PER_LIMB - 1),
        I::LocalGet(CUT),
        I::I32Const(PER_LIMB),
        I::I32RemU,
        I::I32Sub,
        I::Call(routines::POW10),
        I::I32WrapI64,
        I::LocalSet(KEEP),
    ]);
    limb_addr(&mut b, K);
    limb_addr(&mut b, K).ops(&[
        I::I32Load(LIMB),
        I::LocalTee(V),
        I::LocalGet(V),
        I::LocalGet(KEEP),
        I::I32RemU,
        I::I32Sub,
        I::I32Store(LIMB),
        I::LocalGet(K),
        I::I32Const(1),
        I::I32Add,
        I::I32Const(2),
        I::I32Shl,
        I::I32Const(memory::DECIMAL_BASE as i32),
        I::I32Add,
        I::I32Const(0),
        I::I32Const(LIMBS - 1),
        I::LocalGet(K),
        I::I32Sub,
        I::I32Const(2),
        I::I32Shl,
        I::MemoryFill(0),
    ]);

    // Up when past half, or exactly half with an odd last digit
    b.ops(&[
        I::LocalGet(NEXT),
        I::I32Const(5),
        I::I32GtU,
        I::LocalGet(NEXT),
        I::I32Const(5),
        I::I32Eq,
        I::LocalGet(STICKY),
        I::LocalGet(CUT),
        I::Call(routines::DIGIT_AT),
        I::I32Const(1),
        I::I32And,
        I::I32Or,
        I::I32And,
        I::I32Or,
    ]);
    b.if_();
    {
        limb_addr(&mut b, K);
        limb_addr(&mut b, K).ops(&[
            I::I32Load(LIMB),
            I::LocalGet(KEEP),
            I::I32Add,
            I::I32Store(LIMB),
        ]);

        // The integer limbs have headroom, so the carry never leaves the buffer
        b.block("carried").looped("carry");
        limb_addr(&mut b, K)
            .ops(&[I::I32Load(LIMB), I::I32Const(RADIX), I::I32LtU])
            .br_if("carried");
        limb_addr(&mut b, K);
        limb_addr(&mut b, K).ops(&[
            I::I32Load(LIMB),
            I::I32Const(RADIX),
            I::I32Sub,
            I::I32Store(LIMB),
        ]);
        b.bump(K, -1);
        limb_addr(&mut b, K);
        limb_addr(&mut b, K).ops(&[
            I::I32Load(LIMB),
            I::I32Const(1),
            I::I32Add,
            I::I32Store(LIMB),
        ]);
        b.br("carry");
        b.end().end();
    }
    b.end();

    b.finish()
}

/// `put_decimals(from, count)`: buffer digits, then zeros past its end
fn put_decimals() -> Result<Function, String> {
    const FROM: u32 = 0;
    const COUNT: u32 = 1;
    const END: u32 = 2;
    const LIMIT: u32 = 3;

    let mut b = Body::new(&[(2, ValType::I32)]);

    b.ops(&[
        I::LocalGet(FROM),
        I::LocalGet(COUNT),
        I::I32Add,
        I::LocalTee(END),
        I::I32Const(DIGITS),
        I::LocalGet(END),
        I::I32Const(DIGITS),
        I::I32LtS,
        I::Select,
        I::LocalSet(LIMIT),
    ]);
    b.block("done").looped("next");
    b.ops(&[I::LocalGet(FROM), I::LocalGet(LIMIT), I::I32GeS])
        .br_if("done");
    b.ops(&[
        I::LocalGet(FROM),
        I::Call(routines::DIGIT_AT),
        ch(b'0'),
        I::I32Add,
        I::Call(routines::PUT),
    ]);
    b.bump(FROM, 1).br("next");
    b.end().end();
    b.ops(&[
        ch(b'0'),
        I::LocalGet(END),
        I::LocalGet(FROM),
        I::I32Sub,
        I::Call(routines::PAD),
    ]);

    b.finish()
}

/// `last_nonzero(from, to) -> position` of the last nonzero digit in
/// `from..=to`, or `from - 1`
fn last_nonzero() -> Result<Function, String> {
    const FROM: u32 = 0;
    const TO: u32 = 1;

    let mut b = Body::new(&[]);

    b.ops(&[
        I::LocalGet(TO),
        I::I32Const(DIGITS - 1),
        I::LocalGet(TO),
        I::I32Const(DIGITS - 1),
        I::I32LtS,
        I::Select,
        I::LocalSet(TO),
    ]);
    b.block("none").looped("scan");
    b.ops(&[I::LocalGet(TO), I::LocalGet(FROM), I::I32LtS])
        .br_if("none");
    b.ops(&[I::LocalGet(TO), I::Call(routines::DIGIT_AT)]);
    b.if_().ops(&[I::LocalGet(TO), I::Return]).end();
    b.bump(TO, -1).br("scan");
    b.end().end();
    b.ops(&[I::LocalGet(FROM), I::I32Const(1), I::I32Sub]);

    b.finish()
}

/// Emit `point = digits > 0 || alternate form`
fn decimal_point(b: &mut Body, digits: u32, flags_local: u32, point: u32) {
    b.ops(&[
        I::LocalGet(digits),
        I::I32Const(0),
        I::I32GtS,
        I::LocalGet(flags_local),
        I::I32Const(flags::ALT),
        I::I32And,
        I::I32Const(0),
        I::I32Ne,
        I::I32Or,
        I::LocalSet(point),
    ]);
}

/// `fmt_exp(negative, flags, width, precision, upper, strip)`: `d.ddde±xx`.
/// The buffer is already rounded to `precision + 1` significant digits.
fn fmt_exp() -> Result<Function, String> {
    const NEG: u32 = 0;
    const FLAGS: u32 = 1;
    const WIDTH: u32 = 2;
    const PREC: u32 = 3;
    const UPPER: u32 = 4;
    const STRIP: u32 = 5;
    const LEAD: u32 = 6;
    const E: u32 = 7;
    const POINT: u32 = 8;
    const AE: u32 = 9;
    const ED: u32 = 10;
    const LEN: u32 = 11;
    const SIGN: u32 = 12;

    let mut b = Body::new(&[(7, ValType::I32)]);

    b.ops(&[
        I::Call(routines::LEAD_DIGIT),
        I::LocalSet(LEAD),
        I::I32Const(UNITS),
        I::LocalGet(LEAD),
        I::I32Sub,
        I::LocalSet(E),
    ]);

    b.op(I::LocalGet(STRIP));
    b.if_()
        .ops(&[
            I::LocalGet(LEAD),
            I::I32Const(1),
            I::I32Add,
            I::LocalGet(LEAD),
            I::LocalGet(PREC),
            I::I32Add,
            I::Call(routines::LAST_NONZERO),
            I::LocalGet(LEAD),
            I::I32Sub,
            I::LocalSet(PREC),
        ])
        .end();
    decimal_point(&mut b, PREC, FLAGS, POINT);

    // Exponent magnitude, at least two digits
    b.ops(&[
        I::I32Const(0),
        I::LocalGet(E),
        I::I32Sub,
        I::LocalGet(E),
        I::LocalGet(E),
        I::I32Const(0),
        I::I32LtS,
        I::Select,
        I::LocalSet(AE),
        I::LocalGet(AE),
        I::I64ExtendI32U,
        I::I32Const(10),
        I::Call(routines::COUNT_DIGITS),
        I::LocalTee(ED),
        I::I32Const(2),
        I::LocalGet(ED),
        I::I32Const(2),
        I::I32GtS,
        I::Select,
        I::LocalSet(ED),
    ]);

    b.ops(&[
        I::LocalGet(NEG),
        I::LocalGet(FLAGS),
        I::Call(routines::SIGN_CHAR),
        I::LocalSet(SIGN),
        // sign + lead digit + point + digits + 'e' + exponent sign + exponent
        I::LocalGet(SIGN),
        I::I32Const(0),
        I::I32Ne,
        I::I32Const(3),
        I::I32Add,
        I::LocalGet(POINT),
        I::I32Add,
        I::LocalGet(PREC),
        I::I32Add,
        I::LocalGet(ED),
        I::I32Add,
        I::LocalSet(LEN),
        I::LocalGet(LEN),
        I::LocalGet(SIGN),
        I::LocalGet(FLAGS),
        I::LocalGet(WIDTH),
        I::Call(routines::BEGIN_FIELD),
        I::LocalGet(LEAD),
        I::I32Const(1),
        I::Call(routines::PUT_DECIMALS),
    ]);

    b.op(I::LocalGet(POINT));
    b.if_().ops(&[ch(b'.'), I::Call(routines::PUT)]).end();

    b.ops(&[
        I::LocalGet(LEAD),
        I::I32Const(1),
        I::I32Add,
        I::LocalGet(PREC),
        I::Call(routines::PUT_DECIMALS),
        ch(b'E'),
        ch(b'e'),
        I::LocalGet(UPPER),
        I::Select,
        I::Call(routines::PUT),
        ch(b'-'),
        ch(b'+'),
        I::LocalGet(E),
        I::I32Const(0),
        I::I32LtS,
        I::Select,
        I::Call(routines::PUT),
        ch(b'0'),
        I::LocalGet(ED),
        I::LocalGet(AE),
        I::I64ExtendI32U,
        I::I32Const(10),
        I::Call(routines::COUNT_DIGITS),
        I::I32Sub,
        I::Call(routines::PAD),
        I::LocalGet(AE),
        I::I64ExtendI32U,
        I::I32Const(10),
        I::I32Const(0),
        I::Call(routines::PUT_DIGITS),
        I::LocalGet(LEN),
        I::LocalGet(FLAGS),
        I::LocalGet(WIDTH),
        I::Call(routines::END_FIELD),
    ]);

    b.finish()
}

/// `fmt_fixed(negative, flags, width, precision, strip)`: `ddd.ddd`.
/// The buffer is already rounded to `precision` fraction digits.
fn fmt_fixed() -> Result<Function, String> {
    const NEG: u32 = 0;
    const FLAGS: u32 = 1;
    const WIDTH: u32 = 2;
    const PREC: u32 = 3;
    const STRIP: u32 = 4;
    const FIRST: u32 = 5;
    const POINT: u32 = 6;
    const SIGN: u32 = 7;
    const LEN: u32 = 8;

    let mut b = Body::new(&[(4, ValType::I32)]);

    // Integer digits start at the lead digit, or at the units digit below one
    b.ops(&[
        I::Call(routines::LEAD_DIGIT),
        I::LocalTee(FIRST),
        I::I32Const(UNITS),
        I::LocalGet(FIRST),
        I::I32Const(UNITS),
        I::I32LtS,
        I::Select,
        I::LocalSet(FIRST),
    ]);

    b.op(I::LocalGet(STRIP));
    b.if_()
        .ops(&[
            I::I32Const(UNITS + 1),
            I::I32Const(UNITS),
            I::LocalGet(PREC),
            I::I32Add,
            I::Call(routines::LAST_NONZERO),
            I::I32Const(UNITS),
            I::I32Sub,
            I::LocalSet(PREC),
        ])
        .end();
    decimal_point(&mut b, PREC, FLAGS, POINT);

    b.ops(&[
        I::LocalGet(NEG),
        I::LocalGet(FLAGS),
        I::Call(routines::SIGN_CHAR),
        I::LocalSet(SIGN),
        I::LocalGet(SIGN),
        I::I32Const(0),
        I::I32Ne,
        I::I32Const(UNITS + 1),
        I::LocalGet(FIRST),
        I::I32Sub,
        I::I32Add,
        I::LocalGet(POINT),
        I::I32Add,
        I::LocalGet(PREC),
        I::I32Add,
        I::LocalSet(LEN),
        I::LocalGet(LEN),
        I::LocalGet(SIGN),
        I::LocalGet(FLAGS),
        I::LocalGet(WIDTH),
        I::Call(routines::BEGIN_FIELD),
        I::LocalGet(FIRST),
        I::I32Const(UNITS + 1),
        I::LocalGet(FIRST),
        I::I32Sub,
        I::Call(routines::PUT_DECIMALS),
    ]);

    b.op(I::LocalGet(POINT));
    b.if_().ops(&[ch(b'.'), I::Call(routines::PUT)]).end();

    b.ops(&[
        I::I32Const(UNITS + 1),
        I::LocalGet(PREC),
        I::Call(routines::PUT_DECIMALS),
        I::LocalGet(LEN),
        I::LocalGet(FLAGS),
        I::LocalGet(WIDTH),
        I::Call(routines::END_FIELD),
    ]);

    b.finish()
}

/// `fmt_special(negative, flags, width, upper, is_inf)`: `nan` / `inf`
fn fmt_special() -> Result<Function, String> {
    const NEG: u32 = 0;
    const FLAGS: u32 = 1;
    const WIDTH: u32 = 2;
    const UPPER: u32 = 3;
    const IS_INF: u32 = 4;
    const SIGN: u32 = 5;
    const LEN: u32 = 6;
    const CASE: u32 = 7;

    let mut b = Body::new(&[(3, ValType::I32)]);

    b.ops(&[
        I::LocalGet(NEG),
        I::LocalGet(FLAGS),
        I::Call(routines::SIGN_CHAR),
        I::LocalTee(SIGN),
        I::I32Const(0),
        I::I32Ne,
        I::I32Const(3),
        I::I32Add,
        I::LocalSet(LEN),
        I::LocalGet(LEN),
        I::LocalGet(SIGN),
        I::LocalGet(FLAGS),
        I::I32Const(!flags::ZERO),
        I::I32And,
        I::LocalGet(WIDTH),
        I::Call(routines::BEGIN_FIELD),
        I::I32Const(0),
        I::I32Const(32),
        I::LocalGet(UPPER),
        I::Select,
        I::LocalSet(CASE),
    ]);

    let letters = |b: &mut Body, word: &[u8; 3]| {
        for &c in word {
            b.ops(&[
                ch(c),
                I::LocalGet(CASE),
                I::I32Add,
                I::Call(routines::PUT),
            ]);
        }
    };

    b.op(I::LocalGet(IS_INF));
    b.if_();
    letters(&mut b, b"INF");
    b.else_();
    letters(&mut b, b"NAN");
    b.end();

    b.ops(&[
        I::LocalGet(LEN),
        I::LocalGet(FLAGS),
        I::LocalGet(WIDTH),
        I::Call(routines::END_FIELD),
    ]);

    b.finish()
}

/// `fmt_float(value, conversion, flags, width, precision)` for `f e g` in either case
fn fmt_float() -> Result<Function, String> {
    const V: u32 = 0;
    const CONV: u32 = 1;
    const FLAGS: u32 = 2;
    const WIDTH: u32 = 3;
    const PREC: u32 = 4;
    const X: u32 = 5;
    const NEG: u32 = 6;
    const UPPER: u32 = 7;
    const LOWER: u32 = 8;
    const P: u32 = 9;
    const E: u32 = 10;
    const STRIP: u32 = 11;

    let mut b = Body::new(&[(1, ValType::F64), (6, ValType::I32)]);

    b.ops(&[
        I::LocalGet(V),
        I::I64ReinterpretF64,
        I::I64Const(0),
        I::I64LtS,
        I::LocalSet(NEG),
        I::LocalGet(V),
        I::F64Abs,
        I::LocalSet(X),
        I::LocalGet(CONV),
        ch(b'a'),
        I::I32LtU,
        I::LocalSet(UPPER),
        I::LocalGet(CONV),
        I::I32Const(0x20),
        I::I32Or,
        I::LocalSet(LOWER),
    ]);

    let special = |b: &mut Body, is_inf: i32| {
        b.if_()
            .ops(&[
                I::LocalGet(NEG),
                I::LocalGet(FLAGS),
                I::LocalGet(WIDTH),
                I::LocalGet(UPPER),
                I::I32Const(is_inf),
                I::Call(routines::FMT_SPECIAL),
                I::Return,
            ])
            .end();
    };

    b.ops(&[I::LocalGet(X), I::LocalGet(X), I::F64Ne]);
    special(&mut b, 0);
    b.op(I::LocalGet(X)).f64_const(f64::INFINITY).op(I::F64Eq);
    special(&mut b, 1);

    b.ops(&[I::LocalGet(PREC), I::I32Const(0), I::I32LtS]);
    b.if_().ops(&[I::I32Const(6), I::LocalSet(PREC)]).end();

    b.ops(&[I::LocalGet(X), I::Call(routines::LOAD_DECIMAL)]);

    b.ops(&[I::LocalGet(LOWER), ch(b'f'), I::I32Eq]);
    b.if_()
        .ops(&[
            I::I32Const(UNITS),
            I::LocalGet(PREC),
            I::I32Add,
            I::Call(routines::ROUND_AT),
            I::LocalGet(NEG),
            I::LocalGet(FLAGS),
            I::LocalGet(WIDTH),
            I::LocalGet(PREC),
            I::I32Const(0),
            I::Call(routines::FMT_FIXED),
            I::Return,
        ])
        .end();

    b.ops(&[I::LocalGet(LOWER), ch(b'e'), I::I32Eq]);
    b.if_()
        .ops(&[
            I::Call(routines::LEAD_DIGIT),
            I::LocalGet(PREC),
            I::I32Add,
            I::Call(routines::ROUND_AT),
            I::LocalGet(NEG),
            I::LocalGet(FLAGS),
            I::LocalGet(WIDTH),
            I::LocalGet(PREC),
            I::LocalGet(UPPER),
            I::I32Const(0),
            I::Call(routines::FMT_EXP),
            I::Return,
        ])
        .end();

    // %g: round to P significant digits first, then pick the style from
    // the exponent of the rounded value
    b.ops(&[
        I::I32Const(1),
        I::LocalGet(PREC),
        I::LocalGet(PREC),
        I::I32Eqz,
        I::Select,
        I::LocalSet(P),
        I::Call(routines::LEAD_DIGIT),
        I::LocalGet(P),
        I::I32Add,
        I::I32Const(1),
        I::I32Sub,
        I::Call(routines::ROUND_AT),
        I::I32Const(UNITS),
        I::Call(routines::LEAD_DIGIT),
        I::I32Sub,
        I::LocalSet(E),
        I::LocalGet(FLAGS),
        I::I32Const(flags::ALT),
        I::I32And,
        I::I32Eqz,
        I::LocalSet(STRIP),
        I::LocalGet(E),
        I::LocalGet(P),
        I::I32LtS,
        I::LocalGet(E),
        I::I32Const(-4),
        I::I32GeS,
        I::I32And,
    ]);
    b.if_()
        .ops(&[
            I::LocalGet(NEG),
            I::LocalGet(FLAGS),
            I::LocalGet(WIDTH),
            I::LocalGet(P),
            I::I32Const(1),
            I::I32Sub,
            I::LocalGet(E),
            I::I32Sub,
            I::LocalGet(STRIP),
            I::Call(routines::FMT_FIXED),
        ])
        .else_()
        .ops(&[
            I::LocalGet(NEG),
            I::LocalGet(FLAGS),
            I::LocalGet(WIDTH),
            I::LocalGet(P),
            I::I32Const(1),
            I::I32Sub,
            I::LocalGet(UPPER),
            I::LocalGet(STRIP),
            I::Call(routines::FMT_EXP),
        ])
        .end();

    b.finish()
}

/// Cap for widths and precisions taken from the format string or `*`
const FIELD_LIMIT: i32 = 10_000_000;

/// Emit a decimal field parse into `target` (digits only)
fn parse_count(b: &mut Body, p: u32, digit: u32, target: u32) {
    b.block("counted").looped("count");
    b.ops(&[
        I::LocalGet(p),
        I::I32Load8U(byte(0)),
        ch(b'0'),
        I::I32Sub,
        I::LocalTee(digit),
        I::I32Const(9),
        I::I32GtU,
    ])
    .br_if("counted");
    b.ops(&[I::LocalGet(target), I::I32Const(FIELD_LIMIT), I::I32LtS]);
    b.if_()
        .ops(&[
            I::LocalGet(target),
            I::I32Const(10),
            I::I32Mul,
            I::LocalGet(digit),
            I::I32Add,
            I::LocalSet(target),
        ])
        .end();
    b.bump(p, 1).br("count");
    b.end().end();
}

/// Emit `target = min(target, FIELD_LIMIT)`
fn clamp_field(b: &mut Body, target: u32) {
    b.ops(&[
        I::LocalGet(target),
        I::I32Const(FIELD_LIMIT),
        I::LocalGet(target),
        I::I32Const(FIELD_LIMIT),
        I::I32LtS,
        I::Select,
        I::LocalSet(target),
    ]);
}

/// Emit a test of `local` against any of `chars`, leaving an i32 on the stack
fn is_any(b: &mut Body, local: u32, chars: &[u8]) {
    for (i, &c) in chars.iter().enumerate() {
        b.ops(&[I::LocalGet(local), ch(c), I::I32Eq]);
        if i > 0 {
            b.op(I::I32Or);
        }
    }
}

/// `vsnprintf(out, cap, fmt, va) -> length`
fn vsnprintf() -> Result<Function, String> {
    const OUT: u32 = 0;
    const CAP: u32 = 1;
    const FMT: u32 = 2;
    const VA: u32 = 3;
    const P: u32 = 4;
    const C: u32 = 5;
    const FLAGS: u32 = 6;
    const WIDTH: u32 = 7;
    const PREC: u32 = 8;
    const LONGS: u32 = 9;
    const NARROW: u32 = 10;
    const BIT: u32 = 11;
    const IV: u32 = 12;
    const BASE: u32 = 13;
    const PTR: u32 = 14;
    const SLEN: u32 = 15;
    const LV: u32 = 16;

    let mut b = Body::new(&[(12, ValType::I32), (1, ValType::I64)]);

    // Take the next 4-byte slot
    let next_word = |b: &mut Body| {
        b.ops(&[I::LocalGet(VA), I::I32Load(word(0))]);
        b.bump(VA, 4);
    };
    // Take the next 8-byte slot, aligned to 8
    let align_va = |b: &mut Body| {
        b.ops(&[
            I::LocalGet(VA),
            I::I32Const(7),
            I::I32Add,
            I::I32Const(-8),
            I::I32And,
            I::LocalSet(VA),
        ]);
    };

    b.store_cell(memory::OUT_BASE, OUT);
    b.store_cell(memory::OUT_CAP, CAP);
    b.ops(&[
        I::I32Const(0),
        I::I32Const(0),
        I::I32Store(word(memory::OUT_POS)),
        I::LocalGet(FMT),
        I::LocalSet(P),
    ]);

    b.block("finish").looped("scan");
    b.ops(&[
        I::LocalGet(P),
        I::I32Load8U(byte(0)),
        I::LocalTee(C),
        I::I32Eqz,
    ])
    .br_if("finish");
    b.bump(P, 1);

    b.ops(&[I::LocalGet(C), ch(b'%'), I::I32Ne]);
    b.if_()
        .ops(&[I::LocalGet(C), I::Call(routines::PUT)])
        .br("scan")
        .end();

    b.ops(&[
        I::I32Const(0),
        I::LocalSet(FLAGS),
        I::I32Const(0),
        I::LocalSet(WIDTH),
        I::I32Const(-1),
        I::LocalSet(PREC),
        I::I32Const(0),
        I::LocalSet(LONGS),
        I::I32Const(0),
        I::LocalSet(NARROW),
    ]);

    // Flags
    b.block("flagged").looped("flag");
    b.ops(&[
        I::LocalGet(P),
        I::I32Load8U(byte(0)),
        I::Call(routines::FLAG_BIT),
        I::LocalTee(BIT),
        I::I32Eqz,
    ])
    .br_if("flagged");
    b.ops(&[
        I::LocalGet(FLAGS),
        I::LocalGet(BIT),
        I::I32Or,
        I::LocalSet(FLAGS),
    ]);
    b.bump(P, 1).br("flag");
    b.end().end();

    // Width
    b.ops(&[I::LocalGet(P), I::I32Load8U(byte(0)), ch(b'*'), I::I32Eq]);
    b.if_();
    {
        next_word(&mut b);
        b.op(I::LocalSet(WIDTH));
        b.bump(P, 1);
        // Negative `*` width means left-justify
        b.ops(&[I::LocalGet(WIDTH), I::I32Const(0), I::I32LtS]);
        b.if_()
            .ops(&[
                I::LocalGet(FLAGS),
                I::I32Const(flags::LEFT),
                I::I32Or,
                I::LocalSet(FLAGS),
                I::I32Const(0),
                I::LocalGet(WIDTH),
                I::I32Sub,
                I::LocalSet(WIDTH),
            ])
            .end();
        clamp_field(&mut b, WIDTH);
    }
    b.else_();
    parse_count(&mut b, P, C, WIDTH);
    b.end();

    // Precision
    b.ops(&[I::LocalGet(P), I::I32Load8U(byte(0)), ch(b'.'), I::I32Eq]);
    b.if_();
    {
        b.bump(P, 1).ops(&[I::I32Const(0), I::LocalSet(PREC)]);
        b.ops(&[I::LocalGet(P), I::I32Load8U(byte(0)), ch(b'*'), I::I32Eq]);
        b.if_();
        {
            next_word(&mut b);
            b.op(I::LocalSet(PREC));
            b.bump(P, 1);
            // Negative `*` precision is as if omitted
            b.ops(&[I::LocalGet(PREC), I::I32Const(0), I::I32LtS]);
            b.if_().ops(&[I::I32Const(-1), I::LocalSet(PREC)]).end();
            clamp_field(&mut b, PREC);
        }
        b.else_();
        parse_count(&mut b, P, C, PREC);
        b.end();
    }
    b.end();

    // Length modifiers
    b.looped("length");
    b.ops(&[I::LocalGet(P), I::I32Load8U(byte(0)), I::LocalSet(C)]);
    b.ops(&[I::LocalGet(C), ch(b'h'), I::I32Eq]);
    b.if_().bump(NARROW, 1).bump(P, 1).br("length").end();
    b.ops(&[I::LocalGet(C), ch(b'l'), I::I32Eq]);
    b.if_().bump(LONGS, 1).bump(P, 1).br("length").end();
    is_any(&mut b, C, b"jq");
    b.if_()
        .ops(&[I::I32Const(2), I::LocalSet(LONGS)])
        .bump(P, 1)
        .br("length")
        .end();
    // Pointer-sized and long double modifiers change nothing on wasm32
    is_any(&mut b, C, b"ztL");
    b.if_().bump(P, 1).br("length").end();
    b.end();

    b.ops(&[I::LocalGet(P), I::I32Load8U(byte(0)), I::LocalSet(C)]);
    b.bump(P, 1);

    b.block("dispatch");

    // Signed integers
    is_any(&mut b, C, b"di");
    b.if_();
    {
        b.ops(&[I::LocalGet(LONGS), I::I32Const(2), I::I32GeS]);
        b.if_();
        align_va(&mut b);
        b.ops(&[I::LocalGet(VA), I::I64Load(dword(0)), I::LocalSet(LV)]);
        b.bump(VA, 8);
        b.else_();
        next_word(&mut b);
        b.op(I::LocalSet(IV));
        b.ops(&[I::LocalGet(NARROW), I::I32Const(1), I::I32Eq]);
        b.if_()
            .ops(&[I::LocalGet(IV), I::I32Extend16S, I::LocalSet(IV)])
            .end();
        b.ops(&[I::LocalGet(NARROW), I::I32Const(2), I::I32GeS]);
        b.if_()
            .ops(&[I::LocalGet(IV), I::I32Extend8S, I::LocalSet(IV)])
            .end();
        b.ops(&[I::LocalGet(IV), I::I64ExtendI32S, I::LocalSet(LV)]);
        b.end();

        b.ops(&[
            I::I64Const(0),
            I::LocalGet(LV),
            I::I64Sub,
            I::LocalGet(LV),
            I::LocalGet(LV),
            I::I64Const(0),
            I::I64LtS,
            I::Select,
            I::LocalGet(LV),
            I::I64Const(0),
            I::I64LtS,
            I::I32Const(10),
            I::LocalGet(FLAGS),
            I::LocalGet(WIDTH),
            I::LocalGet(PREC),
            I::I32Const(0),
            I::Call(routines::FMT_INT),
        ]);
        b.br("dispatch");
    }
    b.end();

    // Unsigned integers
    is_any(&mut b, C, b"uxXo");
    b.if_();
    {
        b.ops(&[I::LocalGet(LONGS), I::I32Const(2), I::I32GeS]);
        b.if_();
        align_va(&mut b);
        b.ops(&[I::LocalGet(VA), I::I64Load(dword(0)), I::LocalSet(LV)]);
        b.bump(VA, 8);
        b.else_();
        next_word(&mut b);
        b.op(I::LocalSet(IV));
        b.ops(&[I::LocalGet(NARROW), I::I32Const(1), I::I32Eq]);
        b.if_()
            .ops(&[
                I::LocalGet(IV),
                I::I32Const(0xFFFF),
                I::I32And,
                I::LocalSet(IV),
            ])
            .end();
        b.ops(&[I::LocalGet(NARROW), I::I32Const(2), I::I32GeS]);
        b.if_()
            .ops(&[
                I::LocalGet(IV),
                I::I32Const(0xFF),
                I::I32And,
                I::LocalSet(IV),
            ])
            .end();
        b.ops(&[I::LocalGet(IV), I::I64ExtendI32U, I::LocalSet(LV)]);
        b.end();

        b.ops(&[
            I::I32Const(10),
            I::I32Const(8),
            I::I32Const(16),
            I::LocalGet(C),
            ch(b'o'),
            I::I32Eq,
            I::Select,
            I::LocalGet(C),
            ch(b'u'),
            I::I32Eq,
            I::Select,
            I::LocalSet(BASE),
            I::LocalGet(LV),
            I::I32Const(0),
            I::LocalGet(BASE),
            I::LocalGet(FLAGS),
            I::I32Const(!(flags::PLUS | flags::SPACE)),
            I::I32And,
            I::LocalGet(WIDTH),
            I::LocalGet(PREC),
            I::LocalGet(C),
            ch(b'X'),
            I::I32Eq,
            I::Call(routines::FMT_INT),
        ]);
        b.br("dispatch");
    }
    b.end();

    // Pointers print as %#x
    b.ops(&[I::LocalGet(C), ch(b'p'), I::I32Eq]);
    b.if_();
    {
        next_word(&mut b);
        b.ops(&[
            I::LocalSet(IV),
            I::LocalGet(IV),
            I::I64ExtendI32U,
            I::I32Const(0),
            I::I32Const(16),
            I::LocalGet(FLAGS),
            I::I32Const(flags::ALT),
            I::I32Or,
            I::I32Const(!(flags::PLUS | flags::SPACE)),
            I::I32And,
            I::LocalGet(WIDTH),
            I::LocalGet(PREC),
            I::I32Const(0),
            I::Call(routines::FMT_INT),
        ]);
        b.br("dispatch");
    }
    b.end();

    // Characters
    b.ops(&[I::LocalGet(C), ch(b'c'), I::I32Eq]);
    b.if_();
    {
        next_word(&mut b);
        b.ops(&[
            I::LocalSet(IV),
            I::I32Const(1),
            I::I32Const(0),
            I::LocalGet(FLAGS),
            I::I32Const(!flags::ZERO),
            I::I32And,
            I::LocalGet(WIDTH),
            I::Call(routines::BEGIN_FIELD),
            I::LocalGet(IV),
            I::I32Const(0xFF),
            I::I32And,
            I::Call(routines::PUT),
            I::I32Const(1),
            I::LocalGet(FLAGS),
            I::LocalGet(WIDTH),
            I::Call(routines::END_FIELD),
        ]);
        b.br("dispatch");
    }
    b.end();

    // Strings
    b.ops(&[I::LocalGet(C), ch(b's'), I::I32Eq]);
    b.if_();
    {
        next_word(&mut b);
        b.op(I::LocalSet(PTR));
        b.ops(&[I::LocalGet(PTR), I::I32Eqz]);
        b.if_()
            .ops(&[I::I32Const(memory::NULL_TEXT as i32), I::LocalSet(PTR)])
            .end();
        b.ops(&[
            I::LocalGet(PTR),
            I::LocalGet(PREC),
            I::Call(routines::STRNLEN),
            I::LocalSet(SLEN),
            I::LocalGet(SLEN),
            I::I32Const(0),
            I::LocalGet(FLAGS),
            I::I32Const(!flags::ZERO),
            I::I32And,
            I::LocalGet(WIDTH),
            I::Call(routines::BEGIN_FIELD),
            I::LocalGet(PTR),
            I::LocalGet(SLEN),
            I::Call(routines::PUT_BYTES),
            I::LocalGet(SLEN),
            I::LocalGet(FLAGS),
            I::LocalGet(WIDTH),
            I::Call(routines::END_FIELD),
        ]);
        b.br("dispatch");
    }
    b.end();

    // Doubles
    b.ops(&[
        I::LocalGet(C),
        I::I32Const(0x20),
        I::I32Or,
        I::LocalSet(IV),
    ]);
    is_any(&mut b, IV, b"feg");
    b.if_();
    {
        align_va(&mut b);
        b.ops(&[I::LocalGet(VA), I::F64Load(dword(0))]);
        b.bump(VA, 8);
        b.ops(&[
            I::LocalGet(C),
            I::LocalGet(FLAGS),
            I::LocalGet(WIDTH),
            I::LocalGet(PREC),
            I::Call(routines::FMT_FLOAT),
        ]);
        b.br("dispatch");
    }
    b.end();

    b.ops(&[I::LocalGet(C), ch(b'%'), I::I32Eq]);
    b.if_()
        .ops(&[ch(b'%'), I::Call(routines::PUT)])
        .br("dispatch")
        .end();

    // %n, %a, unknown conversions and a dangling '%'
    b.op(I::Unreachable);
    b.end();

    b.br("scan");
    b.end().end();

    // Terminate at min(pos, cap - 1)
    b.op(I::LocalGet(CAP));
    b.if_()
        .load_cell(memory::OUT_POS)
        .op(I::LocalSet(IV))
        .ops(&[
            I::LocalGet(OUT),
            I::LocalGet(IV),
            I::LocalGet(CAP),
            I::I32Const(1),
            I::I32Sub,
            I::LocalGet(IV),
            I::LocalGet(CAP),
            I::I32Const(1),
            I::I32Sub,
            I::I32LtU,
            I::Select,
            I::I32Add,
            I::I32Const(0),
            I::I32Store8(byte(0)),
        ])
        .end();
    b.load_cell(memory::OUT_POS);

    b.finish()
}
