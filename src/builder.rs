//! The seam to the external cross-compilation toolchain. Per the
//! host's scope, this crate never compiles guest source itself — it
//! only shells out to a configured builder command by name and expects
//! the builder to emit a `.wasm` artifact into `outputDir/<name>.wasm`.

use std::path::Path;

use tokio::process::Command;

/// Invokes the configured builder for module `name`, blocking until it
/// exits. Returns an error if no builder command is configured, the
/// process fails to start, or it exits non-zero; the caller logs and
/// continues (a build failure never takes the server down).
pub async fn build_module(builder_command: &Option<String>, modules_dir: &Path, name: &str) -> anyhow::Result<()> {
    let command = builder_command
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("no builder command configured; cannot build '{}'", name))?;

    let status = Command::new(command)
        .arg(name)
        .current_dir(modules_dir)
        .status()
        .await
        .map_err(|e| anyhow::anyhow!("failed to start builder '{}' for '{}': {}", command, name, e))?;

    if !status.success() {
        return Err(anyhow::anyhow!(
            "builder '{}' exited with {:?} for module '{}'",
            command,
            status.code(),
            name
        ));
    }
    Ok(())
}
