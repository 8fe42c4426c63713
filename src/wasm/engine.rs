//! Sandbox hosting with wasmtime
//!
//! One compiled [`SandboxImage`] is shared by the whole process. Every
//! decoder instantiates it into its own [`SandboxInstance`], which owns a
//! store, a linear memory and the allocator state of the format module.

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};
use wasmtime::{Config, Engine, Instance, Memory, Module, Store, Trap, TypedFunc};

use crate::arena::SandboxMemory;
use crate::decoder::{CompactLogDecodeError, DecodeResult};
use crate::wasm::codegen::WasmCodeGen;
use crate::wasm::runtime::exports;

/// Fuel granted to every call into the sandbox
pub const DEFAULT_FUEL: u64 = 100_000_000;

/// Set to a truthy value to skip the precompiled artifact
pub const FORCE_JIT_ENV: &str = "COMPACT_LOG_FORCE_JIT";

/// Directory searched for the precompiled artifact
pub const ARTIFACT_DIR_ENV: &str = "COMPACT_LOG_ARTIFACT_DIR";

/// Overrides [`DEFAULT_FUEL`]
pub const FUEL_ENV: &str = "COMPACT_LOG_FUEL";

static SHARED_IMAGE: OnceCell<SandboxImage> = OnceCell::new();

/// Configuration for loading and running the sandbox.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Where to look for a precompiled native image.
    pub artifact_dir: Option<PathBuf>,
    /// Always compile the portable module, even if an artifact exists.
    pub force_jit: bool,
    /// Fuel budget per sandbox call.
    pub fuel: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            artifact_dir: None,
            force_jit: false,
            fuel: DEFAULT_FUEL,
        }
    }
}

impl EngineConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(value) = lookup(FORCE_JIT_ENV) {
            config.force_jit = is_truthy(&value);
        }
        if let Some(dir) = lookup(ARTIFACT_DIR_ENV).filter(|d| !d.trim().is_empty()) {
            config.artifact_dir = Some(PathBuf::from(dir));
        }
        if let Some(fuel) = lookup(FUEL_ENV) {
            match fuel.trim().parse::<u64>() {
                Ok(fuel) if fuel > 0 => config.fuel = fuel,
                _ => warn!(value = %fuel, "Ignoring invalid {}", FUEL_ENV),
            }
        }

        config
    }

    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = Some(dir.into());
        self
    }

    pub fn with_force_jit(mut self, force: bool) -> Self {
        self.force_jit = force;
        self
    }

    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel = fuel.max(1);
        self
    }

    /// Path of the precompiled artifact for this machine, if a directory is set.
    pub fn artifact_path(&self) -> Option<PathBuf> {
        self.artifact_dir.as_ref().map(|dir| dir.join(artifact_file_name()))
    }

    /// Create a Wasmtime Config from this configuration.
    pub fn to_wasmtime_config(&self) -> Config {
        let mut config = Config::new();

        // Fuel bounds every call into untrusted formatting
        config.consume_fuel(true);

        config.strategy(wasmtime::Strategy::Cranelift);

        config
    }
}

/// File name of the precompiled image for the running architecture and OS.
pub fn artifact_file_name() -> String {
    format!(
        "compact_log_printf-{}-{}.cwasm",
        std::env::consts::ARCH,
        std::env::consts::OS
    )
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// How the shared image was obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOrigin {
    Precompiled(PathBuf),
    JustInTime,
}

/// Compiled format module, immutable and shareable across threads.
pub struct SandboxImage {
    engine: Engine,
    module: Module,
    origin: ImageOrigin,
    fuel: u64,
}

impl SandboxImage {
    /// The process-wide image, built from the environment on first use.
    pub fn shared() -> DecodeResult<&'static SandboxImage> {
        SHARED_IMAGE.get_or_try_init(|| Self::load(&EngineConfig::from_env()))
    }

    /// Load an image, preferring a precompiled artifact.
    pub fn load(config: &EngineConfig) -> DecodeResult<Self> {
        let engine = Engine::new(&config.to_wasmtime_config())
            .map_err(|e| CompactLogDecodeError::SandboxError(format!("engine: {}", e)))?;

        if !config.force_jit {
            if let Some(path) = config.artifact_path() {
                if path.is_file() {
                    match Self::deserialize(&engine, &path) {
                        Ok(module) => {
                            info!(path = %path.display(), "Loaded precompiled sandbox image");
                            return Ok(Self {
                                engine,
                                module,
                                origin: ImageOrigin::Precompiled(path),
                                fuel: config.fuel,
                            });
                        }
                        Err(e) => {
                            warn!(
                                path = %path.display(),
                                error = %e,
                                "Precompiled sandbox image unusable, compiling instead"
                            );
                        }
                    }
                } else {
                    debug!(path = %path.display(), "No precompiled sandbox image");
                }
            }
        }

        let wasm = WasmCodeGen::new()
            .generate_validated()
            .map_err(CompactLogDecodeError::SandboxError)?;
        let module = Module::new(&engine, &wasm)
            .map_err(|e| CompactLogDecodeError::SandboxError(format!("compile: {}", e)))?;
        info!(bytes = wasm.len(), "Compiled sandbox image just in time");

        Ok(Self {
            engine,
            module,
            origin: ImageOrigin::JustInTime,
            fuel: config.fuel,
        })
    }

    fn deserialize(engine: &Engine, path: &Path) -> wasmtime::Result<Module> {
        // SAFETY: the artifact directory is trusted configuration and the
        // file is only ever produced by `precompile` for this engine setup.
        // wasmtime still rejects images built for another version or config.
        unsafe { Module::deserialize_file(engine, path) }
    }

    /// Produce the native image for this machine.
    pub fn precompile(config: &EngineConfig) -> DecodeResult<Vec<u8>> {
        let engine = Engine::new(&config.to_wasmtime_config())
            .map_err(|e| CompactLogDecodeError::SandboxError(format!("engine: {}", e)))?;
        let wasm = WasmCodeGen::new()
            .generate_validated()
            .map_err(CompactLogDecodeError::SandboxError)?;

        engine
            .precompile_module(&wasm)
            .map_err(|e| CompactLogDecodeError::SandboxError(format!("precompile: {}", e)))
    }

    /// Precompile and write the artifact the loader looks for into `dir`.
    pub fn write_artifact(config: &EngineConfig, dir: &Path) -> DecodeResult<PathBuf> {
        let image = Self::precompile(config)?;
        std::fs::create_dir_all(dir)?;
        let path = dir.join(artifact_file_name());
        std::fs::write(&path, image)?;
        info!(path = %path.display(), "Wrote precompiled sandbox image");
        Ok(path)
    }

    pub fn origin(&self) -> &ImageOrigin {
        &self.origin
    }

    /// Create a fresh instance with its own memory and heap.
    pub fn instantiate(&self) -> DecodeResult<SandboxInstance> {
        let mut store = Store::new(&self.engine, ());
        store.set_fuel(self.fuel).map_err(sandbox_error)?;

        let instance = Instance::new(&mut store, &self.module, &[]).map_err(sandbox_error)?;
        let memory = instance
            .get_memory(&mut store, exports::MEMORY)
            .ok_or_else(|| missing_export(exports::MEMORY))?;
        let malloc = instance
            .get_typed_func::<u32, u32>(&mut store, exports::MALLOC)
            .map_err(|_| missing_export(exports::MALLOC))?;
        let free = instance
            .get_typed_func::<u32, ()>(&mut store, exports::FREE)
            .map_err(|_| missing_export(exports::FREE))?;
        let live = instance
            .get_typed_func::<(), u32>(&mut store, exports::LIVE_ALLOCATIONS)
            .map_err(|_| missing_export(exports::LIVE_ALLOCATIONS))?;
        let vsnprintf = instance
            .get_typed_func::<(u32, u32, u32, u32), u32>(&mut store, exports::VSNPRINTF)
            .map_err(|_| missing_export(exports::VSNPRINTF))?;

        Ok(SandboxInstance {
            store,
            memory,
            malloc,
            free,
            live,
            vsnprintf,
            fuel: self.fuel,
            allocations: 0,
        })
    }
}

fn missing_export(name: &str) -> CompactLogDecodeError {
    CompactLogDecodeError::SandboxError(format!("missing export `{}`", name))
}

fn sandbox_error(e: wasmtime::Error) -> CompactLogDecodeError {
    CompactLogDecodeError::SandboxError(describe(&e))
}

fn describe(e: &wasmtime::Error) -> String {
    match e.downcast_ref::<Trap>() {
        Some(trap) => format!("trap: {}", trap),
        None => e.to_string(),
    }
}

/// One instantiation of the format module.
pub struct SandboxInstance {
    store: Store<()>,
    memory: Memory,
    malloc: TypedFunc<u32, u32>,
    free: TypedFunc<u32, ()>,
    live: TypedFunc<(), u32>,
    vsnprintf: TypedFunc<(u32, u32, u32, u32), u32>,
    fuel: u64,
    allocations: u64,
}

impl SandboxInstance {
    fn refuel(&mut self) -> DecodeResult<()> {
        self.store.set_fuel(self.fuel).map_err(sandbox_error)
    }

    /// Run `vsnprintf(out, cap, fmt, va)` and return the untruncated length.
    ///
    /// Any trap is reported as [`CompactLogDecodeError::RenderFaultError`];
    /// the instance stays usable for freeing memory afterwards.
    pub fn render(&mut self, out: u32, cap: u32, format: u32, va_args: u32) -> DecodeResult<u32> {
        self.refuel()?;
        self.vsnprintf
            .call(&mut self.store, (out, cap, format, va_args))
            .map_err(|e| CompactLogDecodeError::RenderFaultError(describe(&e)))
    }

    /// Number of sandbox blocks allocated and not yet freed.
    pub fn live_allocations(&mut self) -> DecodeResult<u32> {
        self.refuel()?;
        self.live.call(&mut self.store, ()).map_err(sandbox_error)
    }

    /// `malloc` calls made through this instance, failed ones included.
    pub fn allocations_requested(&self) -> u64 {
        self.allocations
    }

    /// Current size of linear memory in bytes.
    pub fn memory_size(&self) -> usize {
        self.memory.data_size(&self.store)
    }
}

impl SandboxMemory for SandboxInstance {
    fn alloc(&mut self, len: usize) -> DecodeResult<u32> {
        self.allocations += 1;
        let requested = u32::try_from(len)
            .map_err(|_| CompactLogDecodeError::AllocationError { requested: len })?;
        self.refuel()?;
        let addr = self
            .malloc
            .call(&mut self.store, requested)
            .map_err(sandbox_error)?;
        if addr == 0 {
            return Err(CompactLogDecodeError::AllocationError { requested: len });
        }
        Ok(addr)
    }

    fn free(&mut self, addr: u32) -> DecodeResult<()> {
        self.refuel()?;
        self.free.call(&mut self.store, addr).map_err(sandbox_error)
    }

    fn write(&mut self, addr: u32, bytes: &[u8]) -> DecodeResult<()> {
        let start = addr as usize;
        let dest = self
            .memory
            .data_mut(&mut self.store)
            .get_mut(start..start.saturating_add(bytes.len()))
            .ok_or(CompactLogDecodeError::MemoryError {
                addr,
                len: bytes.len(),
            })?;
        dest.copy_from_slice(bytes);
        Ok(())
    }

    fn read(&self, addr: u32, len: usize) -> DecodeResult<Vec<u8>> {
        let start = addr as usize;
        self.memory
            .data(&self.store)
            .get(start..start.saturating_add(len))
            .map(<[u8]>::to_vec)
            .ok_or(CompactLogDecodeError::MemoryError { addr, len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[]));
        assert!(!config.force_jit);
        assert!(config.artifact_dir.is_none());
        assert_eq!(config.fuel, DEFAULT_FUEL);
        assert!(config.artifact_path().is_none());
    }

    #[test]
    fn test_config_truthy_values() {
        for value in ["1", "true", "TRUE", "yes", " on "] {
            let config = EngineConfig::from_lookup(lookup(&[(FORCE_JIT_ENV, value)]));
            assert!(config.force_jit, "{value:?}");
        }
        for value in ["0", "false", "off", ""] {
            let config = EngineConfig::from_lookup(lookup(&[(FORCE_JIT_ENV, value)]));
            assert!(!config.force_jit, "{value:?}");
        }
    }

    #[test]
    fn test_config_artifact_dir_and_fuel() {
        let config = EngineConfig::from_lookup(lookup(&[
            (ARTIFACT_DIR_ENV, "/opt/decoder"),
            (FUEL_ENV, "12345"),
        ]));
        assert_eq!(config.fuel, 12345);
        let path = config.artifact_path().unwrap();
        assert!(path.starts_with("/opt/decoder"));
        assert!(path.to_string_lossy().ends_with(".cwasm"));
    }

    #[test]
    fn test_config_invalid_fuel_ignored() {
        let config = EngineConfig::from_lookup(lookup(&[(FUEL_ENV, "lots")]));
        assert_eq!(config.fuel, DEFAULT_FUEL);
        let config = EngineConfig::from_lookup(lookup(&[(FUEL_ENV, "0")]));
        assert_eq!(config.fuel, DEFAULT_FUEL);
    }

    #[test]
    fn test_artifact_name_matches_platform() {
        let name = artifact_file_name();
        assert!(name.starts_with("compact_log_printf-"));
        assert!(name.contains(std::env::consts::ARCH));
        assert!(name.contains(std::env::consts::OS));
    }

    #[test]
    fn test_jit_image_instantiates() {
        let image = SandboxImage::load(&EngineConfig::default().with_force_jit(true)).unwrap();
        assert_eq!(image.origin(), &ImageOrigin::JustInTime);

        let mut instance = image.instantiate().unwrap();
        assert_eq!(instance.live_allocations().unwrap(), 0);
        assert!(instance.memory_size() >= 65536);
    }

    #[test]
    fn test_alloc_write_read_free() {
        let image = SandboxImage::load(&EngineConfig::default()).unwrap();
        let mut instance = image.instantiate().unwrap();

        let addr = instance.alloc(5).unwrap();
        assert_ne!(addr, 0);
        assert_eq!(addr % 8, 0);
        instance.write(addr, b"hello").unwrap();
        assert_eq!(instance.read(addr, 5).unwrap(), b"hello");
        assert_eq!(instance.live_allocations().unwrap(), 1);

        instance.free(addr).unwrap();
        assert_eq!(instance.live_allocations().unwrap(), 0);
        assert_eq!(instance.allocations_requested(), 1);
    }

    #[test]
    fn test_double_free_is_sandbox_error() {
        let image = SandboxImage::load(&EngineConfig::default()).unwrap();
        let mut instance = image.instantiate().unwrap();

        let keep = instance.alloc(8).unwrap();
        let addr = instance.alloc(8).unwrap();
        instance.free(addr).unwrap();
        let result = instance.free(addr);
        assert!(matches!(
            result,
            Err(CompactLogDecodeError::SandboxError(_))
        ));

        instance.free(keep).unwrap();
        assert_eq!(instance.live_allocations().unwrap(), 0);
    }

    #[test]
    fn test_out_of_bounds_access() {
        let image = SandboxImage::load(&EngineConfig::default()).unwrap();
        let mut instance = image.instantiate().unwrap();
        let end = instance.memory_size() as u32;

        assert!(matches!(
            instance.read(end - 2, 4),
            Err(CompactLogDecodeError::MemoryError { .. })
        ));
        assert!(matches!(
            instance.write(end, b"x"),
            Err(CompactLogDecodeError::MemoryError { .. })
        ));
    }

    #[test]
    fn test_oversized_allocation_fails() {
        let image = SandboxImage::load(&EngineConfig::default()).unwrap();
        let mut instance = image.instantiate().unwrap();

        let result = instance.alloc(64 * 1024 * 1024);
        assert!(matches!(
            result,
            Err(CompactLogDecodeError::AllocationError { .. })
        ));
        assert_eq!(instance.live_allocations().unwrap(), 0);
    }
}
