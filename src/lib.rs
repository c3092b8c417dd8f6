pub mod builder;
pub mod bus;
pub mod dispatcher;
pub mod error;
pub mod host_app;
pub(crate) mod host_bridge;
pub mod host_config;
pub mod middleware;
pub mod module;
pub mod server;
pub mod watcher;
pub mod ws_relay;

use std::sync::Arc;

/// The opaque logging sink a guest's `log` host call is forwarded
/// through. Swappable so an embedder can route guest log lines into
/// its own `tracing` subscriber, a file, or nowhere.
pub type Logger = Arc<dyn Fn(&str) + Send + Sync>;

#[cfg(test)]
mod test {
    use std::time::Duration;

    use hyper::{Body, Request, StatusCode};

    use crate::host_config::HostConfiguration;
    use crate::server::Server;

    const ENDPOINT_WAT: &str = r#"
        (module
            (import "env" "log" (func $log (param i32 i32)))
            (memory (export "memory") 1)
            (data (i32.const 0) "endpoint ready")
            (func (export "init")
                (call $log (i32.const 0) (i32.const 14)))
            (func (export "malloc") (param $size i32) (result i32)
                i32.const 512)
            (func (export "handle") (param $ptr i32) (param $len i32) (result i32)
                (i32.store8 (i32.const 1024) (i32.const 79))
                (i32.store8 (i32.const 1025) (i32.const 75))
                (i32.store8 (i32.const 1026) (i32.const 0))
                i32.const 1024))
    "#;

    fn test_config(dir: &std::path::Path) -> HostConfiguration {
        let mut cfg = HostConfiguration::default();
        cfg.app_root_dir = dir.to_path_buf();
        cfg.modules_dir = dir.join("modules");
        cfg.output_dir = dir.join("output");
        cfg.wasm_cache_config_file = dir.join("cache.toml");
        cfg.drain_timeout = Duration::from_millis(300);
        cfg.use_internal_watcher = false;
        cfg
    }

    #[tokio::test]
    async fn end_to_end_swap_and_dispatch_returns_guest_response() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("modules")).unwrap();
        std::fs::create_dir_all(tmp.path().join("output")).unwrap();
        let server = Server::new(test_config(tmp.path())).unwrap();

        let bytes = wat::parse_str(ENDPOINT_WAT).unwrap();
        server.swap("greeter", bytes).await;

        let req = Request::builder().uri("/m/greeter").body(Body::empty()).unwrap();
        let resp = server.dispatch_for_test(req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(&body[..], b"OK");

        server.stop().await;
    }
}
