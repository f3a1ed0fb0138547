//! WASM validation and compilation.
//!
//! Besides the header checks, compilation verifies the module's import and
//! export tables against the bridge ABI, so a mismatched guest is rejected
//! before any of its code runs.

use crate::alloc::ReleaseAbi;
use permbridge_core::{AbiNames, BindingStage, BridgeConfig, BridgeError, BridgeResult};
use wasmtime::{Config, Engine, ExternType, FuncType, Module, OptLevel, ValType};

/// WASM binary magic number
const WASM_MAGIC: &[u8; 4] = b"\0asm";

/// Supported binary format version
const WASM_VERSION: &[u8; 4] = b"\x01\x00\x00\x00";

/// Compilation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    /// Invalid WASM module
    #[error("Invalid WASM module: {0}")]
    InvalidModule(String),

    /// Size limit exceeded
    #[error("Module size {size} exceeds limit {limit}")]
    SizeLimitExceeded {
        /// Module size in bytes
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// Required export is absent
    #[error("Missing export '{0}'")]
    MissingExport(String),

    /// Export or import has the wrong type
    #[error("'{name}' has type {found}, expected {expected}")]
    SignatureMismatch {
        /// Item name
        name: String,
        /// Type found in the module
        found: String,
        /// Type the bridge requires
        expected: String,
    },

    /// Module imports something the host does not provide
    #[error("Unexpected import '{module}.{name}'")]
    UnexpectedImport {
        /// Import module
        module: String,
        /// Import name
        name: String,
    },
}

impl From<CompileError> for BridgeError {
    fn from(err: CompileError) -> Self {
        BridgeError::binding(BindingStage::Compile, err.to_string())
    }
}

/// Compiler for guest modules
pub struct WasmCompiler {
    engine: Engine,
    config: BridgeConfig,
}

impl WasmCompiler {
    /// Create a compiler and its engine
    ///
    /// # Errors
    ///
    /// Returns a binding failure if the engine cannot be configured
    pub fn new(config: BridgeConfig) -> BridgeResult<Self> {
        let mut wasm_config = Config::new();
        wasm_config.cranelift_opt_level(OptLevel::Speed);
        wasm_config.consume_fuel(config.max_fuel.is_some());

        let engine = Engine::new(&wasm_config)
            .map_err(|e| BridgeError::binding(BindingStage::Compile, format!("engine: {e}")))?;
        Ok(Self { engine, config })
    }

    /// Get the engine modules are compiled for
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Check the binary header and size
    ///
    /// # Errors
    ///
    /// Returns error if validation fails
    pub fn validate(&self, wasm_bytes: &[u8]) -> Result<(), CompileError> {
        if wasm_bytes.len() > self.config.max_module_bytes {
            return Err(CompileError::SizeLimitExceeded {
                size: wasm_bytes.len(),
                limit: self.config.max_module_bytes,
            });
        }

        if wasm_bytes.len() < 4 {
            return Err(CompileError::InvalidModule("Too small".to_string()));
        }
        if &wasm_bytes[0..4] != WASM_MAGIC {
            return Err(CompileError::InvalidModule(
                "Invalid magic number".to_string(),
            ));
        }

        if wasm_bytes.len() < 8 {
            return Err(CompileError::InvalidModule("Missing version".to_string()));
        }
        let version = &wasm_bytes[4..8];
        if version != WASM_VERSION {
            return Err(CompileError::InvalidModule(format!(
                "Unsupported version: {:?}",
                version
            )));
        }

        Ok(())
    }

    /// Compile a module and check it against the bridge ABI
    ///
    /// # Errors
    ///
    /// Returns a binding failure at the compile stage if the bytes are not a
    /// valid module or its imports and exports do not match the ABI
    pub fn compile(&self, wasm_bytes: &[u8]) -> BridgeResult<CompiledModule> {
        self.validate(wasm_bytes)?;

        let module = Module::new(&self.engine, wasm_bytes)
            .map_err(|e| CompileError::InvalidModule(format!("{e:#}")))?;

        let release_abi = check_exports(&module, &self.config.abi)?;
        check_imports(&module, &self.config.abi)?;

        tracing::debug!(
            bytes = wasm_bytes.len(),
            release_abi = ?release_abi,
            "compiled guest module"
        );

        Ok(CompiledModule {
            module,
            release_abi,
            size: wasm_bytes.len(),
        })
    }
}

/// Compiled module whose ABI has been checked
#[derive(Clone, Debug)]
pub struct CompiledModule {
    /// Compiled wasmtime module
    pub module: Module,
    /// Shape of the release export
    pub release_abi: ReleaseAbi,
    /// Module size in bytes
    pub size: usize,
}

fn check_exports(module: &Module, abi: &AbiNames) -> Result<ReleaseAbi, CompileError> {
    match module.get_export(&abi.memory) {
        Some(ExternType::Memory(_)) => {}
        Some(other) => {
            return Err(CompileError::SignatureMismatch {
                name: abi.memory.clone(),
                found: extern_kind(&other).to_string(),
                expected: "memory".to_string(),
            });
        }
        None => return Err(CompileError::MissingExport(abi.memory.clone())),
    }

    expect_func(module, &abi.allocate, &[ValType::I32], &[ValType::I32])?;
    expect_func(
        module,
        &abi.check_permission,
        &[ValType::I32, ValType::I32, ValType::I32],
        &[ValType::I32],
    )?;

    let release = export_func(module, &abi.release)?;
    if is_signature(&release, &[ValType::I32], &[]) {
        Ok(ReleaseAbi::Pointer)
    } else if is_signature(&release, &[ValType::I32, ValType::I32], &[]) {
        Ok(ReleaseAbi::Sized)
    } else {
        Err(CompileError::SignatureMismatch {
            name: abi.release.clone(),
            found: render(&release),
            expected: "(i32) -> () or (i32, i32) -> ()".to_string(),
        })
    }
}

fn check_imports(module: &Module, abi: &AbiNames) -> Result<(), CompileError> {
    for import in module.imports() {
        if import.module() != abi.import_module || import.name() != abi.import_lookup {
            return Err(CompileError::UnexpectedImport {
                module: import.module().to_string(),
                name: import.name().to_string(),
            });
        }
        let ExternType::Func(func) = import.ty() else {
            return Err(CompileError::SignatureMismatch {
                name: format!("{}.{}", import.module(), import.name()),
                found: extern_kind(&import.ty()).to_string(),
                expected: "func".to_string(),
            });
        };
        if !is_signature(&func, &[ValType::I32], &[ValType::I32]) {
            return Err(CompileError::SignatureMismatch {
                name: format!("{}.{}", import.module(), import.name()),
                found: render(&func),
                expected: "(i32) -> (i32)".to_string(),
            });
        }
    }
    Ok(())
}

fn export_func(module: &Module, name: &str) -> Result<FuncType, CompileError> {
    match module.get_export(name) {
        Some(ExternType::Func(func)) => Ok(func),
        Some(other) => Err(CompileError::SignatureMismatch {
            name: name.to_string(),
            found: extern_kind(&other).to_string(),
            expected: "func".to_string(),
        }),
        None => Err(CompileError::MissingExport(name.to_string())),
    }
}

fn expect_func(
    module: &Module,
    name: &str,
    params: &[ValType],
    results: &[ValType],
) -> Result<(), CompileError> {
    let func = export_func(module, name)?;
    if is_signature(&func, params, results) {
        Ok(())
    } else {
        Err(CompileError::SignatureMismatch {
            name: name.to_string(),
            found: render(&func),
            expected: format!(
                "({}) -> ({})",
                join(params.iter().cloned()),
                join(results.iter().cloned())
            ),
        })
    }
}

fn is_signature(func: &FuncType, params: &[ValType], results: &[ValType]) -> bool {
    func.params().len() == params.len()
        && func.results().len() == results.len()
        && func.params().zip(params).all(|(a, b)| ValType::eq(&a, b))
        && func.results().zip(results).all(|(a, b)| ValType::eq(&a, b))
}

fn render(func: &FuncType) -> String {
    format!("({}) -> ({})", join(func.params()), join(func.results()))
}

fn join(types: impl Iterator<Item = ValType>) -> String {
    types.map(|t| t.to_string()).collect::<Vec<_>>().join(", ")
}

fn extern_kind(ty: &ExternType) -> &'static str {
    match ty {
        ExternType::Func(_) => "func",
        ExternType::Global(_) => "global",
        ExternType::Table(_) => "table",
        ExternType::Memory(_) => "memory",
    }
}
