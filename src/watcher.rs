//! The default internal filesystem watcher. Spec treats the watcher as
//! an external collaborator (`OnFileEvent(name, ext, path, kind)` is
//! "delivered by some external observer"); this module supplies the
//! default in-process implementation so the host runs standalone, and
//! is the thing the server self-disables the moment an external caller
//! drives `on_file_event` directly.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Duration;

use notify::{DebouncedEvent, RecommendedWatcher, RecursiveMode, Watcher};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileEventKind {
    Write,
    Create,
}

pub struct FileEvent {
    pub name: String,
    pub ext: String,
    pub path: PathBuf,
    pub kind: FileEventKind,
}

pub struct WatcherHandle {
    stopped: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
    _watcher: RecommendedWatcher,
}

impl WatcherHandle {
    pub fn stop(mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Watches `paths` recursively and invokes `on_event` for every
/// write/create notification, translating path `<dir>/<name>/...` into
/// the `(name, ext, path, kind)` shape `Server::on_file_event` expects.
pub fn spawn(
    paths: Vec<PathBuf>,
    on_event: impl Fn(FileEvent) + Send + Sync + 'static,
) -> anyhow::Result<WatcherHandle> {
    let (tx, rx) = channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Duration::from_millis(200))?;
    for path in &paths {
        if path.exists() {
            watcher.watch(path, RecursiveMode::Recursive)?;
        }
    }

    let stopped = Arc::new(AtomicBool::new(false));
    let stopped_thread = stopped.clone();
    let join = std::thread::spawn(move || {
        while !stopped_thread.load(Ordering::SeqCst) {
            match rx.recv_timeout(Duration::from_millis(250)) {
                Ok(event) => {
                    if let Some(fe) = translate(event) {
                        on_event(fe);
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
    });

    Ok(WatcherHandle {
        stopped,
        join: Some(join),
        _watcher: watcher,
    })
}

fn translate(event: DebouncedEvent) -> Option<FileEvent> {
    let (path, kind) = match event {
        DebouncedEvent::Write(p) => (p, FileEventKind::Write),
        DebouncedEvent::Create(p) => (p, FileEventKind::Create),
        _ => return None,
    };
    let ext = path.extension()?.to_str()?.to_string();
    let name = module_name_from_path(&path)?;
    Some(FileEvent { name, ext, path, kind })
}

/// Derives a module name from either layout this host watches:
/// `outputDir/<name>.wasm` or `modulesDir/<name>/wasm/main.<ext>`.
fn module_name_from_path(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) == Some("wasm") {
        return path.file_stem().and_then(|s| s.to_str()).map(String::from);
    }
    // <modulesDir>/<name>/wasm/main.<ext>
    let mut components: Vec<&str> = path
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect();
    components.pop(); // main.<ext>
    if components.pop() != Some("wasm") {
        return None;
    }
    components.pop().map(String::from)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn derives_name_from_wasm_artifact_path() {
        let name = module_name_from_path(Path::new("/app/output/users.wasm"));
        assert_eq!(name, Some("users".to_string()));
    }

    #[test]
    fn derives_name_from_guest_source_path() {
        let name = module_name_from_path(Path::new("/app/modules/users/wasm/main.go"));
        assert_eq!(name, Some("users".to_string()));
    }

    #[test]
    fn rejects_unrelated_paths() {
        assert_eq!(module_name_from_path(Path::new("/app/modules/users/rule.txt")), None);
    }
}
