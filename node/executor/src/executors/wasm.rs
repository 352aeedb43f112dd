use agora_common::{crypto::sha256, ProofKind, TaskInput, TaskResult};
use anyhow::{bail, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};
use std::sync::Arc;
use wasmtime::{Config, Engine, Linker, Memory, MemoryType, Module, Store};

use super::{conclude, Completed, Executor, ExecutorError};

const MAX_MODULE_SIZE: usize = 24 * 1024;
const PAGE_SIZE: u64 = 65536;
const OUTPUT_LEN: usize = 32;

pub const DEFAULT_FUEL_LIMIT: u64 = 10_000_000;
pub const DEFAULT_MEM_LIMIT: u64 = 1024 * 1024;

/// Raw outcome of one sandboxed run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxRun {
    pub output: Vec<u8>,
    pub fuel_consumed: u64,
}

/// Deterministic Wasm sandbox
pub struct WasmSandbox {
    engine: Engine,
}

impl WasmSandbox {
    /// Create sandbox with deterministic settings
    pub fn new() -> Result<Self> {
        let mut config = Config::new();

        // Determinism settings
        config.wasm_threads(false);
        config.wasm_simd(false);
        config.wasm_relaxed_simd(false);
        config.wasm_reference_types(false);
        config.cranelift_nan_canonicalization(true);
        config.consume_fuel(true);

        // Memory limits
        config.static_memory_maximum_size(64 * 1024 * 1024);
        config.max_wasm_stack(1024 * 1024);

        let engine = Engine::new(&config)?;
        Ok(Self { engine })
    }

    /// Validate a binary module's size and header, then compile it
    pub fn validate(&self, wasm: &[u8]) -> Result<()> {
        check_size(wasm)?;
        if wasm.len() < 8 {
            bail!("module too small: {} bytes", wasm.len());
        }
        if &wasm[0..4] != b"\0asm" {
            bail!("invalid wasm magic");
        }
        if wasm[4..8] != [1, 0, 0, 0] {
            bail!("unsupported wasm version");
        }

        Module::new(&self.engine, wasm)?;
        Ok(())
    }

    /// Run `main(ptr, len)` over `input` and read 32 bytes at the returned
    /// pointer. Module text (WAT) is accepted as well as binary; the size
    /// limit applies to the source as given.
    pub fn run(
        &self,
        wasm: &[u8],
        input: &[u8],
        fuel_limit: u64,
        mem_limit: u64,
    ) -> Result<SandboxRun> {
        check_size(wasm)?;
        if fuel_limit == 0 || fuel_limit > u64::MAX / 2 {
            bail!("invalid fuel limit: {}", fuel_limit);
        }
        if !(PAGE_SIZE..=10 * 1024 * 1024).contains(&mem_limit) {
            bail!("invalid memory limit: {} bytes", mem_limit);
        }

        let module = Module::new(&self.engine, wasm)?;
        let mut store = Store::new(&self.engine, ());
        store.set_fuel(fuel_limit)?;

        let mut linker = Linker::new(&self.engine);
        let max_pages = (mem_limit / PAGE_SIZE) as u32;
        let memory = Memory::new(&mut store, MemoryType::new(1, Some(max_pages)))?;
        linker.define(&mut store, "env", "memory", memory)?;

        let instance = linker.instantiate(&mut store, &module)?;
        let main = instance.get_typed_func::<(i32, i32), i32>(&mut store, "main")?;

        memory.write(&mut store, 0, input)?;
        let output_ptr = main.call(&mut store, (0, input.len() as i32))?;

        let mut output = vec![0u8; OUTPUT_LEN];
        memory.read(&store, output_ptr as u32 as usize, &mut output)?;

        let fuel_consumed = fuel_limit - store.get_fuel()?;
        Ok(SandboxRun {
            output,
            fuel_consumed,
        })
    }
}

fn check_size(wasm: &[u8]) -> Result<()> {
    if wasm.len() > MAX_MODULE_SIZE {
        bail!("module exceeds 24KB limit: {} bytes", wasm.len());
    }
    Ok(())
}

/// Runs a caller-supplied module over the task input.
///
/// Payload: `{ "module": <base64 binary> | "wat": <text>, "input": <string or
/// JSON>, "fuelLimit"?: <u64> }`. Non-string input is fed as canonical JSON.
pub struct WasmExecutor {
    id: String,
    capabilities: Vec<String>,
    sandbox: Arc<WasmSandbox>,
}

impl WasmExecutor {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            capabilities: vec!["wasm-*".to_string()],
            sandbox: Arc::new(WasmSandbox::new()?),
        })
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    async fn run(&self, payload: &Value) -> Result<Completed, ExecutorError> {
        let (module, binary) = module_bytes(payload)?;
        let input = match payload.get("input") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::String(s)) => s.as_bytes().to_vec(),
            Some(other) => agora_common::crypto::canonical_json(other).into_bytes(),
        };
        let fuel_limit = payload
            .get("fuelLimit")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_FUEL_LIMIT);
        let module_hash = sha256(&module);

        let sandbox = self.sandbox.clone();
        let run = tokio::task::spawn_blocking(move || {
            if binary {
                sandbox.validate(&module)?;
            }
            sandbox.run(&module, &input, fuel_limit, DEFAULT_MEM_LIMIT)
        })
        .await
        .map_err(|e| ExecutorError::Sandbox(e.to_string()))?
        .map_err(|e| ExecutorError::Sandbox(format!("{:#}", e)))?;

        Ok(Completed {
            output: json!({
                "output": format!("0x{}", hex::encode(&run.output)),
                "fuelConsumed": run.fuel_consumed,
            }),
            evidence: json!({
                "moduleHash": format!("{:?}", module_hash),
                "fuelConsumed": run.fuel_consumed,
            }),
        })
    }
}

/// Module bytes and whether they are binary
fn module_bytes(payload: &Value) -> Result<(Vec<u8>, bool), ExecutorError> {
    if let Some(encoded) = payload.get("module").and_then(Value::as_str) {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| ExecutorError::InvalidInput(format!("module is not base64: {}", e)))?;
        return Ok((bytes, true));
    }
    if let Some(text) = payload.get("wat").and_then(Value::as_str) {
        return Ok((text.as_bytes().to_vec(), false));
    }
    Err(ExecutorError::InvalidInput(
        "payload carries neither `module` nor `wat`".into(),
    ))
}

#[async_trait]
impl Executor for WasmExecutor {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    fn proof_kind(&self) -> ProofKind {
        ProofKind::DeterministicReplay
    }

    async fn execute(&self, task: &TaskInput) -> TaskResult {
        let outcome = self.run(&task.payload).await;
        conclude(self, task, outcome)
    }
}
