//! The host's configuration surface. Every field has a default, so the
//! core runs with zero explicit setup; callers that need a custom
//! logger, bus, or route set override the relevant field before
//! `Server::start()`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::Logger;

#[derive(Clone)]
pub struct HostConfiguration {
    pub app_root_dir: PathBuf,
    pub modules_dir: PathBuf,
    pub output_dir: PathBuf,
    pub listen_on: SocketAddr,
    pub drain_timeout: Duration,
    pub wasm_cache_config_file: PathBuf,
    pub log_dir: PathBuf,
    pub use_internal_watcher: bool,
    pub builder_command: Option<String>,
    pub logger: Logger,
}

impl Default for HostConfiguration {
    fn default() -> Self {
        let app_root_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            modules_dir: app_root_dir.join("modules"),
            output_dir: app_root_dir.join("output"),
            listen_on: "127.0.0.1:3000".parse().expect("valid default address"),
            drain_timeout: Duration::from_secs(5),
            wasm_cache_config_file: app_root_dir.join("cache.toml"),
            log_dir: std::env::temp_dir().join("modhost-logs"),
            use_internal_watcher: true,
            builder_command: None,
            logger: std::sync::Arc::new(|msg: &str| tracing::info!(target: "modhost::guest", "{}", msg)),
            app_root_dir,
        }
    }
}

impl HostConfiguration {
    /// The filesystem layout location for a module's guest source entry
    /// file, per `modulesDir/<name>/wasm/main.<ext>`.
    pub fn guest_source_entry(&self, name: &str, ext: &str) -> PathBuf {
        self.modules_dir.join(name).join("wasm").join(format!("main.{}", ext))
    }

    /// `modulesDir/<name>/rule.txt`.
    pub fn rule_file(&self, name: &str) -> PathBuf {
        self.modules_dir.join(name).join("rule.txt")
    }

    /// `outputDir/<name>.wasm`.
    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.output_dir.join(format!("{}.wasm", name))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_configuration_has_sane_paths() {
        let cfg = HostConfiguration::default();
        assert_eq!(cfg.listen_on.port(), 3000);
        assert_eq!(cfg.drain_timeout, Duration::from_secs(5));
        assert!(cfg.use_internal_watcher);
    }

    #[test]
    fn filesystem_layout_helpers_compose_paths() {
        let mut cfg = HostConfiguration::default();
        cfg.modules_dir = PathBuf::from("/app/modules");
        cfg.output_dir = PathBuf::from("/app/output");
        assert_eq!(
            cfg.guest_source_entry("users", "go"),
            PathBuf::from("/app/modules/users/wasm/main.go")
        );
        assert_eq!(cfg.rule_file("users"), PathBuf::from("/app/modules/users/rule.txt"));
        assert_eq!(cfg.artifact_path("users"), PathBuf::from("/app/output/users.wasm"));
    }
}
