//! C3 — one loaded guest instance and its lifecycle.
//!
//! A `Module` wraps a compiled+instantiated wasmtime `Instance` and walks
//! it through `Loading -> Ready -> Draining -> Closed`. The awkward part
//! is that a subscription created during `init` must be able to call back
//! into *this* instance later, from a bus worker task, without the
//! `Module` itself existing yet at registration time. We solve that by
//! splitting the guest-facing state (`GuestHandle`) from the `Module`
//! wrapper: the host bridge captures a `Weak<GuestHandle>`, so a late
//! callback against a closed module simply finds nothing to upgrade to.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use wasi_cap_std_sync::WasiCtxBuilder;
use wasmtime::{Engine, Instance, Linker, Memory, Store, Val};

use crate::bus::{Bus, Subscription};
use crate::error::HostError;
use crate::host_bridge;
use crate::ws_relay::WsRelay;
use crate::Logger;

pub const MAX_RESPONSE_BYTES: usize = 64 * 1024;

/// One append-only cleanup list, shared between a `Module` and the
/// `StoreData` captured by host functions so that `subscribe` can append
/// a canceller on the owning module's behalf.
pub type CleanupList = Arc<Mutex<Vec<Subscription>>>;

/// Data stored in the wasmtime `Store` for every module instance: the
/// WASI context, and the collaborators the host bridge needs to service
/// `publish`/`subscribe`/`ws_broadcast`/`log`.
pub struct StoreData {
    pub wasi: wasi_cap_std_sync::WasiCtx,
    pub module_name: Arc<str>,
    pub bus: Arc<Bus>,
    pub ws_relay: Arc<WsRelay>,
    pub logger: Logger,
    pub cleanups: CleanupList,
    pub guest: Arc<Mutex<Option<std::sync::Weak<GuestHandle>>>>,
}

/// The guest-facing exports this host is willing to call, resolved once
/// at load time. Every field is optional except `memory`; absence of a
/// given export means "this module is not capable of that role" (spec's
/// dynamic-dispatch-by-name strategy).
struct GuestExports {
    init: Option<wasmtime::Func>,
    drain: Option<wasmtime::Func>,
    handle: Option<wasmtime::Func>,
    on_message: Option<wasmtime::Func>,
    malloc: Option<wasmtime::Func>,
    memory: Memory,
}

/// The reentrant guest handle: shared between the owning `Module` (one
/// strong owner) and any bus subscriptions registered on its behalf
/// (weak owners, so a closed module's late callbacks see nothing).
pub struct GuestHandle {
    store: Mutex<Store<StoreData>>,
    instance: Instance,
    exports: GuestExports,
    name: Arc<str>,
    closed: AtomicBool,
    active: AtomicU32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Loading,
    Ready,
    Draining,
    Closed,
}

pub struct Module {
    pub name: String,
    guest: Arc<GuestHandle>,
    cleanups: CleanupList,
    state: Mutex<Lifecycle>,
}

/// Reads `len` bytes starting at `ptr` from guest linear memory. Returns
/// a `MemoryError` (not a panic) if the range is out of bounds, per the
/// error-handling design's "per-operation failure" disposition.
pub(crate) fn read_guest_bytes(
    store: impl wasmtime::AsContext,
    memory: &Memory,
    ptr: u32,
    len: u32,
    module: &str,
    operation: &'static str,
) -> Result<Vec<u8>, HostError> {
    let data = memory.data(store);
    let start = ptr as usize;
    let end = start.saturating_add(len as usize);
    if end > data.len() {
        return Err(HostError::Memory {
            module: module.to_string(),
            operation,
            detail: format!("range {}..{} out of bounds (memory size {})", start, end, data.len()),
        });
    }
    Ok(data[start..end].to_vec())
}

/// Writes `bytes` at `ptr` into guest linear memory.
pub(crate) fn write_guest_bytes(
    mut store: impl wasmtime::AsContextMut,
    memory: &Memory,
    ptr: u32,
    bytes: &[u8],
    module: &str,
    operation: &'static str,
) -> Result<(), HostError> {
    memory
        .write(&mut store, ptr as usize, bytes)
        .map_err(|e| HostError::Memory {
            module: module.to_string(),
            operation,
            detail: e.to_string(),
        })
}

impl GuestHandle {
    fn call_void(&self, name_for_errors: &str, func: &wasmtime::Func) -> Result<(), HostError> {
        let mut store = self.store.lock();
        func.call(&mut *store, &[], &mut [])
            .map_err(|e| HostError::Handle {
                name: self.name.to_string(),
                source: anyhow::anyhow!("{}: {}", name_for_errors, e),
            })
    }

    fn call_u32_result(&self, name_for_errors: &str, func: &wasmtime::Func) -> Result<u32, HostError> {
        let mut store = self.store.lock();
        let mut results = [Val::I32(0)];
        func.call(&mut *store, &[], &mut results)
            .map_err(|e| HostError::Handle {
                name: self.name.to_string(),
                source: anyhow::anyhow!("{}: {}", name_for_errors, e),
            })?;
        Ok(results[0].unwrap_i32() as u32)
    }

    /// `handle(ptr,len) -> u32`. Request bytes are first copied into
    /// guest memory via `malloc`, if present; otherwise `ptr` is 0 and
    /// only `len` is meaningful.
    fn call_handle(&self, request: &[u8]) -> Result<u32, HostError> {
        let func = match &self.exports.handle {
            Some(f) => f,
            None => return Ok(0),
        };
        let ptr = self.copy_into_guest(request)?;
        let mut store = self.store.lock();
        let mut results = [Val::I32(0)];
        func.call(
            &mut *store,
            &[Val::I32(ptr as i32), Val::I32(request.len() as i32)],
            &mut results,
        )
        .map_err(|e| HostError::Handle {
            name: self.name.to_string(),
            source: anyhow::anyhow!("handle: {}", e),
        })?;
        Ok(results[0].unwrap_i32() as u32)
    }

    fn copy_into_guest(&self, bytes: &[u8]) -> Result<u32, HostError> {
        let malloc = match &self.exports.malloc {
            Some(f) => f,
            None => return Ok(0),
        };
        let ptr = {
            let mut store = self.store.lock();
            let mut results = [Val::I32(0)];
            malloc
                .call(&mut *store, &[Val::I32(bytes.len() as i32)], &mut results)
                .map_err(|e| HostError::Handle {
                    name: self.name.to_string(),
                    source: anyhow::anyhow!("malloc: {}", e),
                })?;
            results[0].unwrap_i32() as u32
        };
        if ptr == 0 && !bytes.is_empty() {
            return Err(HostError::Memory {
                module: self.name.to_string(),
                operation: "malloc",
                detail: "malloc returned a null pointer for a non-empty buffer".to_string(),
            });
        }
        if !bytes.is_empty() {
            let mut store = self.store.lock();
            write_guest_bytes(&mut *store, &self.exports.memory, ptr, bytes, &self.name, "dispatch")?;
        }
        Ok(ptr)
    }

    /// Delivers one bus message to this guest's `on_message` export,
    /// following the host bridge's memory-exchange discipline: malloc a
    /// region sized for the payload, copy the payload in, then call
    /// `on_message(ptr, len)`. A module lacking either export silently
    /// drops the message (not an error); a memory failure aborts only
    /// this one delivery and does not touch the subscription.
    pub(crate) fn deliver_message(&self, payload: &[u8]) -> Result<(), HostError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let on_message = match &self.exports.on_message {
            Some(f) => f.clone(),
            None => return Ok(()),
        };
        if self.exports.malloc.is_none() {
            return Ok(());
        }
        let ptr = self.copy_into_guest(payload)?;
        let mut store = self.store.lock();
        on_message
            .call(
                &mut *store,
                &[Val::I32(ptr as i32), Val::I32(payload.len() as i32)],
                &mut [],
            )
            .map_err(|e| HostError::Handle {
                name: self.name.to_string(),
                source: anyhow::anyhow!("on_message: {}", e),
            })
    }

    /// Reads the response region starting at `ptr`: up to the first NUL
    /// byte, capped at `MAX_RESPONSE_BYTES`.
    fn read_response(&self, ptr: u32) -> Result<Vec<u8>, HostError> {
        let store = self.store.lock();
        let data = self.exports.memory.data(&*store);
        let start = ptr as usize;
        if start >= data.len() {
            return Err(HostError::Memory {
                module: self.name.to_string(),
                operation: "read_response",
                detail: format!("pointer {} out of bounds (memory size {})", start, data.len()),
            });
        }
        let end = (start + MAX_RESPONSE_BYTES).min(data.len());
        let region = &data[start..end];
        let nul = region.iter().position(|b| *b == 0).unwrap_or(region.len());
        Ok(region[..nul].to_vec())
    }
}

impl Module {
    /// Compiles and instantiates `bytes` under a fresh host bridge. No
    /// lifecycle state is observable outside the call until it returns
    /// `Ready`-bound (caller must still invoke `init`).
    pub fn load(
        name: &str,
        bytes: &[u8],
        engine: &Engine,
        cache_config_path: &std::path::Path,
        bus: Arc<Bus>,
        ws_relay: Arc<WsRelay>,
        logger: Logger,
    ) -> Result<Module, HostError> {
        let _ = cache_config_path; // engine already carries cache config; kept for call-site symmetry with wagi.
        let cleanups: CleanupList = Arc::new(Mutex::new(Vec::new()));
        let guest_cell: Arc<Mutex<Option<std::sync::Weak<GuestHandle>>>> = Arc::new(Mutex::new(None));
        let module_name: Arc<str> = Arc::from(name);

        let wasi = WasiCtxBuilder::new().build();
        let store_data = StoreData {
            wasi,
            module_name: module_name.clone(),
            bus,
            ws_relay,
            logger,
            cleanups: cleanups.clone(),
            guest: guest_cell.clone(),
        };
        let mut store = Store::new(engine, store_data);

        let mut linker: Linker<StoreData> = Linker::new(engine);
        wasi_cap_std_sync::add_to_linker(&mut linker, |s: &mut StoreData| &mut s.wasi).map_err(|e| {
            HostError::ModuleLoad {
                name: name.to_string(),
                source: e,
            }
        })?;
        host_bridge::register(&mut linker).map_err(|e| HostError::ModuleLoad {
            name: name.to_string(),
            source: e,
        })?;

        let wasm_module = wasmtime::Module::new(engine, bytes).map_err(|e| HostError::ModuleLoad {
            name: name.to_string(),
            source: e,
        })?;
        let instance = linker
            .instantiate(&mut store, &wasm_module)
            .map_err(|e| HostError::ModuleLoad {
                name: name.to_string(),
                source: e,
            })?;

        let memory = instance.get_memory(&mut store, "memory").ok_or_else(|| HostError::ModuleLoad {
            name: name.to_string(),
            source: anyhow::anyhow!("module does not export a 'memory'"),
        })?;

        let exports = GuestExports {
            init: instance.get_func(&mut store, "init"),
            drain: instance.get_func(&mut store, "drain"),
            handle: instance.get_func(&mut store, "handle"),
            on_message: instance.get_func(&mut store, "on_message"),
            malloc: instance.get_func(&mut store, "malloc"),
            memory,
        };

        let guest = Arc::new(GuestHandle {
            store: Mutex::new(store),
            instance,
            exports,
            name: module_name,
            closed: AtomicBool::new(false),
            active: AtomicU32::new(0),
        });
        *guest_cell.lock() = Some(Arc::downgrade(&guest));

        Ok(Module {
            name: name.to_string(),
            guest,
            cleanups,
            state: Mutex::new(Lifecycle::Loading),
        })
    }

    pub fn state(&self) -> Lifecycle {
        *self.state.lock()
    }

    /// Invokes `init` exactly once, if exported. Blocking guest call —
    /// callers on an async runtime should run this via `spawn_blocking`.
    pub fn init(&self) -> Result<(), HostError> {
        let result = match &self.guest.exports.init {
            Some(f) => self.guest.call_void("init", f),
            None => Ok(()),
        };
        let mut state = self.state.lock();
        match &result {
            Ok(()) => *state = Lifecycle::Ready,
            Err(_) => *state = Lifecycle::Closed,
        }
        result.map_err(|e| match e {
            HostError::Handle { name, source } => HostError::ModuleInit { name, source },
            other => other,
        })
    }

    /// `handle(ptr,len) -> ptr_into_response`. Valid in `Ready` and, so
    /// that a request which captured this `Arc<Module>` before a swap
    /// can still complete, in `Draining` — only a `Closed` module
    /// refuses to serve.
    pub fn handle(&self, request: &[u8]) -> Result<u32, HostError> {
        if !matches!(self.state(), Lifecycle::Ready | Lifecycle::Draining) {
            return Err(HostError::Protocol(format!(
                "module '{}' is not ready to handle requests",
                self.name
            )));
        }
        self.guest.active.fetch_add(1, Ordering::SeqCst);
        let result = self.guest.call_handle(request);
        self.guest.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Reads a response region produced by a prior `handle` call.
    pub fn read_response(&self, ptr: u32) -> Result<Vec<u8>, HostError> {
        self.guest.read_response(ptr)
    }

    /// Repeatedly invokes `drain()` until it reports 0 or `budget` is
    /// exceeded. A module with no `drain` export completes instantly.
    pub fn drain(&self, budget: Duration) -> Result<(), HostError> {
        *self.state.lock() = Lifecycle::Draining;
        let func = match &self.guest.exports.drain {
            Some(f) => f.clone(),
            None => return Ok(()),
        };
        let deadline = Instant::now() + budget;
        loop {
            let hint = self.guest.call_u32_result("drain", &func)?;
            if hint == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(HostError::DrainTimeout {
                    name: self.name.clone(),
                    budget_ms: budget.as_millis() as u64,
                });
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            std::thread::sleep(Duration::from_millis(hint as u64).min(remaining));
        }
    }

    /// Runs every registered cleanup in reverse registration order, then
    /// marks the module unreachable to further host-initiated calls.
    /// Idempotent; must run even after a failed `init`.
    pub fn close(&self) {
        if self.guest.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut cleanups = self.cleanups.lock();
        while let Some(sub) = cleanups.pop() {
            sub.cancel();
        }
        *self.state.lock() = Lifecycle::Closed;
    }

    pub fn instance(&self) -> Instance {
        self.guest.instance
    }

    #[cfg(test)]
    pub(crate) fn force_state_for_test(&self, state: Lifecycle) {
        *self.state.lock() = state;
    }

    #[cfg(test)]
    pub(crate) fn debug_read_i32(&self, addr: u32) -> i32 {
        let store = self.guest.store.lock();
        let data = self.guest.exports.memory.data(&*store);
        i32::from_le_bytes(data[addr as usize..addr as usize + 4].try_into().unwrap())
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bus::Bus;
    use crate::ws_relay::WsRelay;
    use std::sync::Arc as StdArc;

    // A module exporting nothing but `memory`: init/drain are no-ops,
    // handle always "passes through" (returns 0).
    const MINIMAL_WAT: &str = r#"
        (module
            (memory (export "memory") 1))
    "#;

    const DRAIN_LOOPS_WAT: &str = r#"
        (module
            (memory (export "memory") 1)
            (func (export "drain") (result i32)
                i32.const 100))
    "#;

    fn test_engine() -> Engine {
        let mut config = wasmtime::Config::default();
        config.wasm_multi_memory(true);
        Engine::new(&config).expect("engine")
    }

    fn load(name: &str, wat: &str) -> Module {
        let engine = test_engine();
        let bytes = wat::parse_str(wat).expect("valid wat");
        let bus = Bus::new();
        let ws = WsRelay::new();
        Module::load(
            name,
            &bytes,
            &engine,
            std::path::Path::new("/nonexistent"),
            bus,
            ws,
            StdArc::new(|_: &str| {}),
        )
        .expect("module loads")
    }

    #[test]
    fn minimal_module_inits_and_drains_instantly() {
        let m = load("minimal", MINIMAL_WAT);
        m.init().expect("init succeeds with no init export");
        assert_eq!(m.state(), Lifecycle::Ready);
        m.drain(Duration::from_millis(50)).expect("drain is instant with no export");
    }

    #[test]
    fn handle_with_no_export_passes_through() {
        let m = load("minimal", MINIMAL_WAT);
        m.init().unwrap();
        let ptr = m.handle(b"GET\n/\n").expect("handle succeeds");
        assert_eq!(ptr, 0);
    }

    #[test]
    fn drain_forced_close_after_budget_exceeded() {
        let m = load("sticky", DRAIN_LOOPS_WAT);
        m.init().unwrap();
        let started = Instant::now();
        let result = m.drain(Duration::from_millis(150));
        assert!(matches!(result, Err(HostError::DrainTimeout { .. })));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn handle_succeeds_while_draining_for_in_flight_requests() {
        // A request that captured this Arc<Module> before a swap must still
        // complete after the swap flips the old instance to Draining.
        let m = load("minimal", MINIMAL_WAT);
        m.init().unwrap();
        m.force_state_for_test(Lifecycle::Draining);
        let ptr = m.handle(b"GET\n/\n").expect("handle succeeds while draining");
        assert_eq!(ptr, 0);
    }

    #[test]
    fn handle_rejects_closed_module() {
        let m = load("minimal", MINIMAL_WAT);
        m.init().unwrap();
        m.close();
        let result = m.handle(b"GET\n/\n");
        assert!(matches!(result, Err(HostError::Protocol(_))));
    }

    #[test]
    fn close_is_idempotent() {
        let m = load("minimal", MINIMAL_WAT);
        m.close();
        m.close();
    }
}
