//! WebAssembly sandbox: code generation and hosting

pub mod codegen;
pub mod engine;
pub mod runtime;
pub mod types;

pub use codegen::WasmCodeGen;
pub use engine::{EngineConfig, ImageOrigin, SandboxImage, SandboxInstance};
