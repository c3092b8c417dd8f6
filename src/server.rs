//! C6 — the top-level coordinator: owns the module table, sequences
//! hot-swaps, dispatches `/m/{name}` requests through the middleware
//! pipeline and the endpoint module, and consumes file-event
//! notifications from either the internal watcher or an external
//! driver.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use parking_lot::Mutex;
use tokio::signal::unix::SignalKind;

use crate::bus::Bus;
use crate::builder;
use crate::dispatcher::{ModuleTable, Slot};
use crate::host_config::HostConfiguration;
use crate::middleware::Rule;
use crate::module::Module;
use crate::watcher::{self, FileEventKind, WatcherHandle};
use crate::ws_relay::WsRelay;

/// A route an embedder registers before `start()`, alongside the core's
/// own `/m/{name}` and `/ws` routes.
pub type RouteHandler =
    Arc<dyn Fn(Request<Body>) -> futures::future::BoxFuture<'static, anyhow::Result<Response<Body>>> + Send + Sync>;

pub struct Server {
    config: HostConfiguration,
    engine: wasmtime::Engine,
    table: Arc<ModuleTable>,
    bus: Arc<Bus>,
    ws_relay: Arc<WsRelay>,
    watcher: Mutex<Option<WatcherHandle>>,
    watcher_disabled: AtomicBool,
    extra_routes: Mutex<Vec<(Method, String, RouteHandler)>>,
}

impl Server {
    pub fn new(config: HostConfiguration) -> anyhow::Result<Arc<Self>> {
        let mut wasm_config = wasmtime::Config::default();
        wasm_config.wasm_multi_memory(true);
        if let Ok(p) = std::fs::canonicalize(&config.wasm_cache_config_file) {
            let _ = wasm_config.cache_config_load(p);
        }
        let engine = wasmtime::Engine::new(&wasm_config)?;

        Ok(Arc::new(Self {
            table: ModuleTable::new(),
            bus: Bus::new(),
            ws_relay: WsRelay::new(),
            watcher: Mutex::new(None),
            watcher_disabled: AtomicBool::new(false),
            extra_routes: Mutex::new(Vec::new()),
            engine,
            config,
        }))
    }

    /// Registers an additional route, served alongside the core's own
    /// `/m/{name}` and `/ws`. Must be called before `start()`; routes
    /// registered after serving has begun are honored from the next
    /// accepted connection onward but there is no guarantee they apply
    /// to connections already in flight.
    pub fn register_route(&self, method: Method, path: String, handler: RouteHandler) {
        self.extra_routes.lock().push((method, path, handler));
    }

    /// Builds the HTTP surface, loads every artifact already present in
    /// `output_dir` (auto-building any module whose source exists but
    /// whose artifact is missing), optionally starts the internal
    /// watcher, and serves until SIGTERM. Runs `stop()` on exit.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.config.output_dir).ok();
        std::fs::create_dir_all(&self.config.modules_dir).ok();

        self.auto_build_missing_artifacts().await;
        self.load_all_artifacts().await;

        if self.config.use_internal_watcher {
            self.start_internal_watcher()?;
        }

        let addr = self.config.listen_on;
        let server = self.clone();
        let make_svc = make_service_fn(move |_conn| {
            let server = server.clone();
            async move {
                Ok::<_, std::convert::Infallible>(service_fn(move |req| {
                    let server = server.clone();
                    async move { server.dispatch(req, addr).await }
                }))
            }
        });

        let hyper_server = hyper::Server::bind(&addr).serve(make_svc);
        tracing::info!(%addr, "listening");
        let graceful = hyper_server.with_graceful_shutdown(shutdown_signal());
        graceful.await?;

        self.stop().await;
        Ok(())
    }

    /// Cancels the internal watcher (if any) and drains/closes every
    /// module in the table. HTTP shutdown itself is driven by
    /// `start`'s graceful-shutdown future.
    pub async fn stop(&self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.stop();
        }
        self.table.drain_and_close_all(self.config.drain_timeout).await;
    }

    /// Re-swaps every artifact currently on disk; HTTP keeps running.
    pub async fn restart(&self) {
        self.load_all_artifacts().await;
    }

    async fn auto_build_missing_artifacts(&self) {
        let entries = match std::fs::read_dir(&self.config.modules_dir) {
            Ok(e) => e,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let name = match entry.file_name().into_string() {
                Ok(n) => n,
                Err(_) => continue,
            };
            if !entry.path().is_dir() {
                continue;
            }
            let artifact = self.config.artifact_path(&name);
            if artifact.exists() {
                continue;
            }
            let has_source = ["go", "rs", "c", "zig", "ts"]
                .iter()
                .any(|ext| self.config.guest_source_entry(&name, ext).exists());
            if !has_source {
                continue;
            }
            if let Err(e) = builder::build_module(&self.config.builder_command, &self.config.modules_dir, &name).await
            {
                tracing::warn!(module = %name, error = %e, "auto-build failed");
            }
        }
    }

    async fn load_all_artifacts(&self) {
        let entries = match std::fs::read_dir(&self.config.output_dir) {
            Ok(e) => e,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("wasm") {
                continue;
            }
            let name = match path.file_stem().and_then(|s| s.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            match std::fs::read(&path) {
                Ok(bytes) => self.swap(&name, bytes).await,
                Err(e) => tracing::warn!(module = %name, error = %e, "failed to read artifact"),
            }
        }
    }

    fn start_internal_watcher(self: &Arc<Self>) -> anyhow::Result<()> {
        let server = self.clone();
        let paths = vec![self.config.modules_dir.clone(), self.config.output_dir.clone()];
        let handle = watcher::spawn(paths, move |event| {
            if server.watcher_disabled.load(Ordering::SeqCst) {
                return;
            }
            let server = server.clone();
            tokio::spawn(async move {
                server
                    .on_file_event(&event.name, &event.ext, &event.path, event.kind, false)
                    .await;
            });
        })?;
        *self.watcher.lock() = Some(handle);
        Ok(())
    }

    /// On `write`/`create`: `.wasm` artifacts are (re)loaded via `swap`;
    /// guest-source writes trigger a build. The first call made with
    /// `external = true` disables the internal watcher permanently —
    /// the external notifier becomes the sole source of truth.
    pub async fn on_file_event(
        &self,
        name: &str,
        ext: &str,
        path: &Path,
        kind: FileEventKind,
        external: bool,
    ) {
        if external {
            self.watcher_disabled.store(true, Ordering::SeqCst);
        }
        if !matches!(kind, FileEventKind::Write | FileEventKind::Create) {
            return;
        }

        if ext == "wasm" {
            match std::fs::read(path) {
                Ok(bytes) => self.swap(name, bytes).await,
                Err(e) => tracing::warn!(module = %name, error = %e, "failed to read artifact on file event"),
            }
        } else {
            if let Err(e) = builder::build_module(&self.config.builder_command, &self.config.modules_dir, name).await
            {
                tracing::warn!(module = %name, error = %e, "build failed on source change");
            }
        }
    }

    /// The swap protocol: load and init outside any lock, classify by
    /// rule-file presence, publish atomically, then drain+close the
    /// replaced module outside the lock.
    pub async fn swap(&self, name: &str, bytes: Vec<u8>) {
        let engine = self.engine.clone();
        let cache_path = self.config.wasm_cache_config_file.clone();
        let bus = self.bus.clone();
        let ws_relay = self.ws_relay.clone();
        let logger = self.config.logger.clone();
        let name_owned = name.to_string();

        let load_result = tokio::task::spawn_blocking(move || {
            Module::load(&name_owned, &bytes, &engine, &cache_path, bus, ws_relay, logger)
        })
        .await;

        let module = match load_result {
            Ok(Ok(m)) => m,
            Ok(Err(e)) => {
                tracing::error!(module = name, error = %e, "module load failed, keeping previous instance");
                return;
            }
            Err(e) => {
                tracing::error!(module = name, error = %e, "module load task panicked");
                return;
            }
        };

        let module = Arc::new(module);
        let init_module = module.clone();
        let init_result = tokio::task::spawn_blocking(move || init_module.init()).await;
        match init_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(module = name, error = %e, "module init failed, keeping previous instance");
                module.close();
                return;
            }
            Err(e) => {
                tracing::error!(module = name, error = %e, "module init task panicked");
                module.close();
                return;
            }
        }

        let rule_path = self.config.rule_file(name);
        let slot = match std::fs::read_to_string(&rule_path) {
            Ok(src) => Slot::Middleware(Rule::parse(&src)),
            Err(_) => Slot::Endpoint,
        };

        let old = self.table.publish(name, slot, module);

        if let Some(old_module) = old {
            let budget = self.config.drain_timeout;
            tokio::task::spawn_blocking(move || {
                if let Err(e) = old_module.drain(budget) {
                    tracing::warn!(error = %e, "drain timed out during swap");
                }
                old_module.close();
            });
        }
    }

    /// `GET|POST /m/{name}`, `GET /ws?topic=`, plus whatever the request
    /// shape needs; everything else is `404`.
    #[cfg(test)]
    pub async fn dispatch_for_test(&self, req: Request<Body>) -> Response<Body> {
        self.dispatch(req, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
    }

    async fn dispatch(&self, req: Request<Body>, peer: SocketAddr) -> Result<Response<Body>, std::convert::Infallible> {
        let path = req.uri().path().to_string();
        let extra = self
            .extra_routes
            .lock()
            .iter()
            .find(|(method, route, _)| method == req.method() && route == &path)
            .map(|(_, _, handler)| handler.clone());

        let result = if let Some(handler) = extra {
            handler(req).await
        } else if path == "/ws" {
            self.ws_relay.handle_upgrade(req, peer).await
        } else if let Some(name) = path.strip_prefix("/m/") {
            self.dispatch_module(name.to_string(), req).await
        } else {
            Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::empty())
                .unwrap())
        };

        Ok(result.unwrap_or_else(|e| {
            tracing::error!(error = %e, "request handling failed");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::empty())
                .unwrap()
        }))
    }

    async fn dispatch_module(&self, name: String, req: Request<Body>) -> anyhow::Result<Response<Body>> {
        if name.is_empty() {
            return Ok(Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(Body::from("missing module name"))?);
        }

        let method = req.method().clone();
        let request_blob = format!("{}\n/{}\n", method, name).into_bytes();

        let pipeline = self.table.pipeline_for(&name);
        for mw in pipeline {
            let blob = request_blob.clone();
            let result = tokio::task::spawn_blocking(move || {
                let ptr = mw.handle(&blob)?;
                let body = if ptr != 0 { Some(mw.read_response(ptr)?) } else { None };
                Ok::<_, crate::error::HostError>(body)
            })
            .await;

            match result {
                Ok(Ok(Some(body))) => return Ok(respond_with_body(body)),
                Ok(Ok(None)) => continue, // pass-through to the next stage
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "middleware error, continuing pipeline");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "middleware task panicked, continuing pipeline");
                    continue;
                }
            }
        }

        let endpoint = match self.table.endpoint(&name) {
            Some(m) => m,
            None => {
                return Ok(Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::empty())?)
            }
        };

        let result = tokio::task::spawn_blocking(move || {
            let ptr = endpoint.handle(&request_blob)?;
            let body = if ptr != 0 { Some(endpoint.read_response(ptr)?) } else { None };
            Ok::<_, crate::error::HostError>(body)
        })
        .await;

        match result {
            Ok(Ok(Some(body))) => Ok(respond_with_body(body)),
            Ok(Ok(None)) => Ok(Response::builder()
                .status(StatusCode::NO_CONTENT)
                .body(Body::empty())?),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "endpoint handler failed");
                let status = e.http_status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                Ok(Response::builder().status(status).body(Body::empty())?)
            }
            Err(e) => {
                tracing::error!(error = %e, "endpoint task panicked");
                Ok(Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
        }
    }
}

fn respond_with_body(body: Vec<u8>) -> Response<Body> {
    Response::new(Body::from(body))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut terminate = match tokio::signal::unix::signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGTERM handler");
            let _ = ctrl_c.await;
            return;
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate.recv() => {}
    }
}
