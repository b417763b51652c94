use std::{
    path::PathBuf,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock},
};

use wasmtime::{
    Engine, Instance, Linker, Memory, MemoryAccessError, Module, Store, TypedFunc, WasmParams,
    WasmResults,
};
use wasmtime_wasi::{
    preview1::{self, WasiP1Ctx},
    I32Exit, WasiCtxBuilder,
};

use crate::{
    wasm::{EvaluationEngine, WasmEvaluationResponse, WasmInput},
    Error, Result,
};

/// Hosts the evaluation module with `wasmtime`.
///
/// A module instance is not safe for concurrent use, so each instance lives in its own slot.
/// With `pool_size == 1` all evaluations are serialized through a single slot; larger pools
/// let that many evaluations run in parallel.
pub struct WasmBridge {
    wasm_path: PathBuf,
    pool_size: usize,
    pool: RwLock<Option<Arc<SlotPool>>>,
}

/// One isolated module instance and its bound exports.
struct Slot {
    store: Store<WasiP1Ctx>,
    memory: Memory,
    malloc: TypedFunc<u32, u32>,
    free: TypedFunc<u32, ()>,
    evaluate: TypedFunc<(u32, u32), u64>,
}

struct SlotPool {
    slots: Mutex<Vec<Slot>>,
    available: Condvar,
}

impl WasmBridge {
    /// Create a bridge for the module at `wasm_path`. Nothing is loaded until
    /// [`EvaluationEngine::initialize`] is called.
    pub fn new(wasm_path: impl Into<PathBuf>, pool_size: usize) -> WasmBridge {
        WasmBridge {
            wasm_path: wasm_path.into(),
            pool_size: pool_size.max(1),
            pool: RwLock::new(None),
        }
    }

    /// `true` between a successful `initialize()` and `dispose()`.
    pub fn is_loaded(&self) -> bool {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn load(&self) -> Result<SlotPool> {
        if !self.wasm_path.exists() {
            return Err(Error::BridgeLoad(format!(
                "module not found at {}",
                self.wasm_path.display()
            )));
        }

        let engine = Engine::default();
        let module = Module::from_file(&engine, &self.wasm_path)
            .map_err(|err| Error::BridgeLoad(format!("{err:#}")))?;

        let slots = (0..self.pool_size)
            .map(|_| Slot::new(&engine, &module))
            .collect::<Result<Vec<_>>>()?;

        Ok(SlotPool {
            slots: Mutex::new(slots),
            available: Condvar::new(),
        })
    }
}

impl EvaluationEngine for WasmBridge {
    fn initialize(&self) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }

        // Build every slot before publishing the pool so a half-initialized bridge is never
        // visible.
        let pool = self.load()?;
        {
            let mut current = self.pool.write().unwrap_or_else(PoisonError::into_inner);
            if current.is_some() {
                // Another caller finished loading first; keep its pool.
                return Ok(());
            }
            *current = Some(Arc::new(pool));
        }

        log::debug!(target: "gofeatureflag",
            path = self.wasm_path.display().to_string(),
            pool_size = self.pool_size;
            "evaluation module initialized");
        Ok(())
    }

    fn evaluate(&self, input: &WasmInput<'_>) -> Result<WasmEvaluationResponse> {
        let pool = self
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::BridgeNotLoaded)?;

        let input_bytes = serde_json::to_vec(input)?;

        let mut slot = pool.acquire();
        slot.evaluate_bytes(&input_bytes)
    }

    fn dispose(&self) {
        let previous = self
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_some() {
            log::debug!(target: "gofeatureflag", "evaluation module disposed");
        }
    }
}

impl SlotPool {
    /// Block until a slot is free.
    fn acquire(&self) -> SlotGuard<'_> {
        let mut slots = lock(&self.slots);
        loop {
            if let Some(slot) = slots.pop() {
                return SlotGuard {
                    pool: self,
                    slot: Some(slot),
                };
            }
            slots = self
                .available
                .wait(slots)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn release(&self, slot: Slot) {
        lock(&self.slots).push(slot);
        self.available.notify_one();
    }
}

/// Returns its slot to the pool when dropped.
struct SlotGuard<'a> {
    pool: &'a SlotPool,
    slot: Option<Slot>,
}

impl std::ops::Deref for SlotGuard<'_> {
    type Target = Slot;

    fn deref(&self) -> &Slot {
        self.slot.as_ref().expect("slot is present until drop")
    }
}

impl std::ops::DerefMut for SlotGuard<'_> {
    fn deref_mut(&mut self) -> &mut Slot {
        self.slot.as_mut().expect("slot is present until drop")
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.release(slot);
        }
    }
}

impl Slot {
    fn new(engine: &Engine, module: &Module) -> Result<Slot> {
        let wasi = WasiCtxBuilder::new()
            .inherit_stdout()
            .inherit_stderr()
            .build_p1();
        let mut store = Store::new(engine, wasi);

        let mut linker: Linker<WasiP1Ctx> = Linker::new(engine);
        preview1::add_to_linker_sync(&mut linker, |ctx| ctx)
            .map_err(|err| Error::BridgeLoad(format!("{err:#}")))?;
        let instance = linker
            .instantiate(&mut store, module)
            .map_err(|err| Error::BridgeLoad(format!("{err:#}")))?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or(Error::BridgeExportMissing("memory"))?;
        let malloc = typed_export(&instance, &mut store, "malloc")?;
        let free = typed_export(&instance, &mut store, "free")?;
        let evaluate = typed_export(&instance, &mut store, "evaluate")?;

        run_start(&instance, &mut store)?;

        Ok(Slot {
            store,
            memory,
            malloc,
            free,
            evaluate,
        })
    }

    fn evaluate_bytes(&mut self, input: &[u8]) -> Result<WasmEvaluationResponse> {
        let len = u32::try_from(input.len())
            .map_err(|_| Error::BridgeCall("input does not fit in module memory".to_owned()))?;

        let ptr = self
            .malloc
            .call(&mut self.store, len + 1)
            .map_err(|err| Error::BridgeCall(format!("malloc: {err:#}")))?;
        if ptr == 0 {
            return Err(Error::BridgeInvalidResult(
                "malloc returned a null pointer".to_owned(),
            ));
        }

        let result = self.write_and_call(ptr, input);

        // Always free the input, otherwise the module leaks memory on every failed call.
        if let Err(err) = self.free.call(&mut self.store, ptr) {
            log::warn!(target: "gofeatureflag", "failed to free evaluation input: {:#}", err);
        }

        let packed = result?;
        let output = self.read_output(packed)?;
        Ok(serde_json::from_slice(output)?)
    }

    fn write_and_call(&mut self, ptr: u32, input: &[u8]) -> Result<u64> {
        let offset = ptr as usize;
        let write_error =
            |err: MemoryAccessError| Error::BridgeCall(format!("writing input: {err}"));
        self.memory
            .write(&mut self.store, offset, input)
            .map_err(write_error)?;
        self.memory
            .write(&mut self.store, offset + input.len(), &[0])
            .map_err(write_error)?;

        self.evaluate
            .call(&mut self.store, (ptr, input.len() as u32))
            .map_err(|err| Error::BridgeCall(format!("evaluate: {err:#}")))
    }

    fn read_output(&self, packed: u64) -> Result<&[u8]> {
        let output_ptr = (packed >> 32) as usize;
        let output_len = (packed & 0xFFFF_FFFF) as usize;
        if output_ptr == 0 || output_len == 0 {
            return Err(Error::BridgeInvalidResult(
                "evaluate returned a null or zero-length output".to_owned(),
            ));
        }

        self.memory
            .data(&self.store)
            .get(output_ptr..output_ptr + output_len)
            .ok_or_else(|| {
                Error::BridgeInvalidResult("output is outside of module memory".to_owned())
            })
    }
}

fn typed_export<Params, Results>(
    instance: &Instance,
    store: &mut Store<WasiP1Ctx>,
    name: &'static str,
) -> Result<TypedFunc<Params, Results>>
where
    Params: WasmParams,
    Results: WasmResults,
{
    instance
        .get_func(&mut *store, name)
        .ok_or(Error::BridgeExportMissing(name))?
        .typed(&*store)
        .map_err(|err| Error::BridgeLoad(format!("export {name:?}: {err:#}")))
}

/// Run the WASI `_start` routine, if the module has one. Exiting with code 0 is a success.
fn run_start(instance: &Instance, store: &mut Store<WasiP1Ctx>) -> Result<()> {
    let Some(start) = instance.get_func(&mut *store, "_start") else {
        return Ok(());
    };
    let start = start
        .typed::<(), ()>(&*store)
        .map_err(|err| Error::BridgeLoad(format!("export \"_start\": {err:#}")))?;

    match start.call(&mut *store, ()) {
        Ok(()) => Ok(()),
        Err(err) => match err.downcast_ref::<I32Exit>() {
            Some(I32Exit(0)) => Ok(()),
            Some(I32Exit(code)) => Err(Error::BridgeStartup(*code)),
            None => Err(Error::BridgeLoad(format!("_start: {err:#}"))),
        },
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl std::fmt::Debug for WasmBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmBridge")
            .field("wasm_path", &self.wasm_path)
            .field("pool_size", &self.pool_size)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
