//! C2 — registers the four host-callable functions into a runtime
//! instance under the `env` namespace, and marshals memory between host
//! and guest for the pub/sub delivery path.

use wasmtime::{Caller, Linker, Memory};

use crate::module::{read_guest_bytes, write_guest_bytes, StoreData};

/// Registers `publish`, `subscribe`, `ws_broadcast`, and `log` into
/// `linker` under the `env` namespace.
pub fn register(linker: &mut Linker<StoreData>) -> anyhow::Result<()> {
    linker.func_wrap("env", "publish", publish)?;
    linker.func_wrap("env", "subscribe", subscribe)?;
    linker.func_wrap("env", "ws_broadcast", ws_broadcast)?;
    linker.func_wrap("env", "log", log)?;
    Ok(())
}

fn caller_memory(caller: &mut Caller<'_, StoreData>) -> anyhow::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| anyhow::anyhow!("guest does not export 'memory'"))
}

fn read_str(
    caller: &mut Caller<'_, StoreData>,
    memory: &Memory,
    ptr: u32,
    len: u32,
    operation: &'static str,
) -> anyhow::Result<String> {
    let module_name = caller.data().module_name.clone();
    let bytes = read_guest_bytes(&mut *caller, memory, ptr, len, &module_name, operation)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn read_bytes(
    caller: &mut Caller<'_, StoreData>,
    memory: &Memory,
    ptr: u32,
    len: u32,
    operation: &'static str,
) -> anyhow::Result<Vec<u8>> {
    let module_name = caller.data().module_name.clone();
    Ok(read_guest_bytes(&mut *caller, memory, ptr, len, &module_name, operation)?)
}

/// `publish(topic_ptr, topic_len, payload_ptr, payload_len)`. A memory
/// read failure drops this one publish; it never fails the guest call.
fn publish(
    mut caller: Caller<'_, StoreData>,
    topic_ptr: u32,
    topic_len: u32,
    payload_ptr: u32,
    payload_len: u32,
) {
    let memory = match caller_memory(&mut caller) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(error = %e, "publish: no guest memory");
            return;
        }
    };
    let topic = match read_str(&mut caller, &memory, topic_ptr, topic_len, "publish:topic") {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(error = %e, "publish: failed to read topic");
            return;
        }
    };
    let payload = match read_bytes(&mut caller, &memory, payload_ptr, payload_len, "publish:payload") {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "publish: failed to read payload");
            return;
        }
    };
    caller.data().bus.publish(&topic, payload);
}

/// `subscribe(topic_ptr, topic_len, handler_idx)`. `handler_idx` is
/// accepted but reserved: dispatch always targets the guest's exported
/// `on_message`. The resulting subscription's canceller is appended to
/// the calling module's cleanup list.
fn subscribe(mut caller: Caller<'_, StoreData>, topic_ptr: u32, topic_len: u32, _handler_idx: u32) {
    let memory = match caller_memory(&mut caller) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!(error = %e, "subscribe: no guest memory");
            return;
        }
    };
    let topic = match read_str(&mut caller, &memory, topic_ptr, topic_len, "subscribe:topic") {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(error = %e, "subscribe: failed to read topic");
            return;
        }
    };

    let data = caller.data();
    let bus = data.bus.clone();
    let guest = data.guest.clone();
    let module_name = data.module_name.clone();

    let handler: crate::bus::Handler = std::sync::Arc::new(move |payload: Vec<u8>| {
        let guest = guest.clone();
        let module_name = module_name.clone();
        Box::pin(async move {
            let weak = match guest.lock().clone() {
                Some(w) => w,
                None => {
                    tracing::error!(%module_name, "subscribe: owning module context unavailable");
                    return;
                }
            };
            let handle = match weak.upgrade() {
                Some(h) => h,
                None => return, // module closed; late callback silently dropped.
            };
            let handle2 = handle.clone();
            let result =
                tokio::task::spawn_blocking(move || handle2.deliver_message(&payload)).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(%module_name, error = %e, "on_message delivery failed"),
                Err(e) => tracing::warn!(%module_name, error = %e, "on_message delivery task panicked"),
            }
        })
    });

    let subscription = bus.subscribe(&topic, handler);
    caller.data().cleanups.lock().push(subscription);
}

/// `ws_broadcast(topic_ptr, topic_len, payload_ptr, payload_len)`.
fn ws_broadcast(
    mut caller: Caller<'_, StoreData>,
    topic_ptr: u32,
    topic_len: u32,
    payload_ptr: u32,
    payload_len: u32,
) {
    let memory = match caller_memory(&mut caller) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(error = %e, "ws_broadcast: no guest memory");
            return;
        }
    };
    let topic = match read_str(&mut caller, &memory, topic_ptr, topic_len, "ws_broadcast:topic") {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(error = %e, "ws_broadcast: failed to read topic");
            return;
        }
    };
    let payload = match read_bytes(&mut caller, &memory, payload_ptr, payload_len, "ws_broadcast:payload") {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "ws_broadcast: failed to read payload");
            return;
        }
    };
    caller.data().ws_relay.broadcast(&topic, payload);
}

/// `log(msg_ptr, msg_len)` — forwards guest text to the logging sink
/// with a `[module_name]` prefix.
fn log(mut caller: Caller<'_, StoreData>, msg_ptr: u32, msg_len: u32) {
    let memory = match caller_memory(&mut caller) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(error = %e, "log: no guest memory");
            return;
        }
    };
    let msg = match read_str(&mut caller, &memory, msg_ptr, msg_len, "log:msg") {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(error = %e, "log: failed to read message");
            return;
        }
    };
    let module_name = caller.data().module_name.clone();
    (caller.data().logger)(&format!("[{}] {}", module_name, msg));
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bus::Bus;
    use crate::module::Module;
    use crate::ws_relay::WsRelay;
    use std::sync::Arc;

    // sender: on init, publish "events" with a literal payload.
    // receiver: on init, subscribe to "events"; on_message writes the
    // payload length into a well-known memory offset so the test can
    // observe it without a second import.
    const SENDER_WAT: &str = r#"
        (module
            (import "env" "publish" (func $publish (param i32 i32 i32 i32)))
            (memory (export "memory") 1)
            (data (i32.const 0) "events")
            (data (i32.const 16) "hello from sender")
            (func (export "init")
                (call $publish (i32.const 0) (i32.const 6) (i32.const 16) (i32.const 17))))
    "#;

    const RECEIVER_WAT: &str = r#"
        (module
            (import "env" "subscribe" (func $subscribe (param i32 i32 i32)))
            (memory (export "memory") 1)
            (data (i32.const 0) "events")
            (global $next (mut i32) (i32.const 1024))
            (func (export "init")
                (call $subscribe (i32.const 0) (i32.const 6) (i32.const 0)))
            (func (export "malloc") (param $size i32) (result i32)
                (local $p i32)
                (local.set $p (global.get $next))
                (global.set $next (i32.add (global.get $next) (local.get $size)))
                (local.get $p))
            (func (export "on_message") (param $ptr i32) (param $len i32)
                (i32.store (i32.const 2048) (local.get $len))))
    "#;

    fn test_engine() -> wasmtime::Engine {
        let mut config = wasmtime::Config::default();
        config.wasm_multi_memory(true);
        wasmtime::Engine::new(&config).expect("engine")
    }

    #[tokio::test]
    async fn subscriber_receives_cross_module_publish() {
        let engine = test_engine();
        let bus = Bus::new();
        let ws = WsRelay::new();
        let logger: crate::Logger = Arc::new(|_: &str| {});

        let receiver_bytes = wat::parse_str(RECEIVER_WAT).expect("valid wat");
        let receiver = Module::load(
            "receiver",
            &receiver_bytes,
            &engine,
            std::path::Path::new("/nonexistent"),
            bus.clone(),
            ws.clone(),
            logger.clone(),
        )
        .expect("receiver loads");
        receiver.init().expect("receiver inits");

        let sender_bytes = wat::parse_str(SENDER_WAT).expect("valid wat");
        let sender = Module::load(
            "sender",
            &sender_bytes,
            &engine,
            std::path::Path::new("/nonexistent"),
            bus.clone(),
            ws.clone(),
            logger,
        )
        .expect("sender loads");
        sender.init().expect("sender inits");

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // on_message recorded the payload length ("hello from sender" = 17 bytes)
        // at a fixed address, proving the malloc/copy/on_message sequence ran.
        assert_eq!(receiver.debug_read_i32(2048), 17);
        let _ = sender;
    }
}
