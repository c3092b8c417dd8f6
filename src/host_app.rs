//! Command-line surface, ported from the flag-naming and parsing style
//! used elsewhere in this family of hosts.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{App, Arg, ArgMatches};

use crate::host_config::HostConfiguration;

const ABOUT: &str = r#"
Run a dynamic WebAssembly module host

This starts a host that loads, initializes, and serves WebAssembly modules
mounted at /m/{name}. Modules can be hot-swapped at runtime: dropping a new
.wasm artifact into the output directory (or driving an external file-event
notification) replaces the running instance for that name without dropping
in-flight traffic at other routes.

Modules classified as middleware (by the presence of a rule.txt alongside
their source) run in front of every endpoint request whose route their rule
matches, most-recently-registered first.
"#;

const ARG_MODULES_DIR: &str = "modules_dir";
const ARG_OUTPUT_DIR: &str = "output_dir";
const ARG_LISTEN_ON: &str = "listen";
const ARG_DRAIN_TIMEOUT_MS: &str = "drain_timeout_ms";
const ARG_WASM_CACHE_CONFIG_FILE: &str = "cache";
const ARG_LOG_DIR: &str = "log_dir";
const ARG_NO_INTERNAL_WATCHER: &str = "no_internal_watcher";
const ARG_BUILDER_COMMAND: &str = "builder_command";

pub fn host_app_definition() -> App<'static, 'static> {
    App::new("modhost")
        .version(clap::crate_version!())
        .author("DeisLabs")
        .about(ABOUT)
        .arg(
            Arg::with_name(ARG_MODULES_DIR)
                .long("modules-dir")
                .value_name("DIR")
                .takes_value(true)
                .help("the directory holding one subdirectory per module's guest source and rule.txt. Default: ./modules"),
        )
        .arg(
            Arg::with_name(ARG_OUTPUT_DIR)
                .long("output-dir")
                .value_name("DIR")
                .takes_value(true)
                .help("the directory the host watches for <name>.wasm build artifacts. Default: ./output"),
        )
        .arg(
            Arg::with_name(ARG_LISTEN_ON)
                .short("l")
                .long("listen")
                .value_name("IP_PORT")
                .takes_value(true)
                .help("the IP address and port to listen on. Default: 127.0.0.1:3000"),
        )
        .arg(
            Arg::with_name(ARG_DRAIN_TIMEOUT_MS)
                .long("drain-timeout-ms")
                .value_name("MILLIS")
                .takes_value(true)
                .help("how long to let an outgoing module drain in-flight work before it is forced closed. Default: 5000"),
        )
        .arg(
            Arg::with_name(ARG_WASM_CACHE_CONFIG_FILE)
                .long("cache")
                .value_name("CACHE_TOML")
                .takes_value(true)
                .help("the path to the cache.toml configuration file for the Wasm compilation cache"),
        )
        .arg(
            Arg::with_name(ARG_LOG_DIR)
                .long("log-dir")
                .value_name("LOG_DIR")
                .env("MODHOST_LOG_DIR")
                .takes_value(true)
                .help("the path to a directory where guest log output should be stored. Default is a temporary directory"),
        )
        .arg(
            Arg::with_name(ARG_NO_INTERNAL_WATCHER)
                .long("no-internal-watcher")
                .takes_value(false)
                .help("disable the built-in filesystem watcher; an external process must drive file-event notifications instead"),
        )
        .arg(
            Arg::with_name(ARG_BUILDER_COMMAND)
                .long("builder-command")
                .value_name("COMMAND")
                .env("MODHOST_BUILDER_COMMAND")
                .takes_value(true)
                .help("an external command invoked with a module name to (re)build its .wasm artifact from guest source"),
        )
}

pub fn parse_command_line() -> anyhow::Result<HostConfiguration> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let matches = host_app_definition().get_matches();
    parse_configuration_from(matches)
}

pub fn parse_configuration_from(matches: ArgMatches) -> anyhow::Result<HostConfiguration> {
    let mut config = HostConfiguration::default();

    if let Some(dir) = matches.value_of(ARG_MODULES_DIR) {
        config.modules_dir = PathBuf::from(dir);
    }
    if let Some(dir) = matches.value_of(ARG_OUTPUT_DIR) {
        config.output_dir = PathBuf::from(dir);
    }
    if let Some(addr) = matches.value_of(ARG_LISTEN_ON) {
        config.listen_on = addr
            .parse::<SocketAddr>()
            .map_err(|e| anyhow::anyhow!("invalid --listen address '{}': {}", addr, e))?;
    }
    if let Some(ms) = matches.value_of(ARG_DRAIN_TIMEOUT_MS) {
        let millis: u64 = ms
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid --drain-timeout-ms '{}': {}", ms, e))?;
        config.drain_timeout = Duration::from_millis(millis);
    }
    if let Some(cache) = matches.value_of(ARG_WASM_CACHE_CONFIG_FILE) {
        config.wasm_cache_config_file = PathBuf::from(cache);
    }
    if let Some(log_dir) = matches.value_of(ARG_LOG_DIR) {
        config.log_dir = PathBuf::from(log_dir);
    }
    if matches.is_present(ARG_NO_INTERNAL_WATCHER) {
        config.use_internal_watcher = false;
    }
    if let Some(cmd) = matches.value_of(ARG_BUILDER_COMMAND) {
        config.builder_command = Some(cmd.to_string());
    }

    tracing::info!(addr = %config.listen_on, "parsed host configuration");
    Ok(config)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_apply_when_no_flags_given() {
        let matches = host_app_definition().get_matches_from(vec!["modhost"]);
        let config = parse_configuration_from(matches).expect("default args parse");
        assert_eq!(config.listen_on.port(), 3000);
        assert!(config.use_internal_watcher);
        assert!(config.builder_command.is_none());
    }

    #[test]
    fn flags_override_defaults() {
        let matches = host_app_definition().get_matches_from(vec![
            "modhost",
            "--listen",
            "0.0.0.0:9090",
            "--drain-timeout-ms",
            "1500",
            "--no-internal-watcher",
            "--builder-command",
            "tinygo-build",
        ]);
        let config = parse_configuration_from(matches).expect("overrides parse");
        assert_eq!(config.listen_on.port(), 9090);
        assert_eq!(config.drain_timeout, Duration::from_millis(1500));
        assert!(!config.use_internal_watcher);
        assert_eq!(config.builder_command.as_deref(), Some("tinygo-build"));
    }

    #[test]
    fn invalid_listen_address_is_rejected() {
        let matches = host_app_definition().get_matches_from(vec!["modhost", "--listen", "not-an-addr"]);
        assert!(parse_configuration_from(matches).is_err());
    }
}
