//! The module table: the two disjoint collections the server dispatches
//! against, and the swap protocol that replaces one entry without
//! dropping in-flight traffic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::middleware::{apply_pipeline, MiddlewareModule, Rule};
use crate::module::Module;

/// `endpoints`: name -> Module (one route at `/m/{name}`).
/// `middlewares`: ordered list of MiddlewareModule (order = pipeline order).
/// A name lives in exactly one of the two at a time.
#[derive(Default)]
pub struct ModuleTable {
    endpoints: RwLock<HashMap<String, Arc<Module>>>,
    middlewares: RwLock<IndexMap<String, MiddlewareModule>>,
}

pub enum Slot {
    Endpoint,
    Middleware(Rule),
}

impl ModuleTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Read-locked lookup of an endpoint module by name.
    pub fn endpoint(&self, name: &str) -> Option<Arc<Module>> {
        self.endpoints.read().get(name).cloned()
    }

    /// Read-locked snapshot of the middleware pipeline, already filtered
    /// and ordered for `route`. The lock is held only long enough to
    /// copy references; guest calls happen outside it.
    pub fn pipeline_for(&self, route: &str) -> Vec<Arc<Module>> {
        let guard = self.middlewares.read();
        let mws: Vec<&MiddlewareModule> = guard.values().collect();
        apply_pipeline(route, &mws)
            .into_iter()
            .map(|mw| mw.module.clone())
            .collect()
    }

    /// Publishes `module` into the slot designated by `slot`, replacing
    /// any previous entry under `name`. Returns the replaced module, if
    /// any, so the caller can drain-then-close it outside this lock.
    pub fn publish(&self, name: &str, slot: Slot, module: Arc<Module>) -> Option<Arc<Module>> {
        match slot {
            Slot::Endpoint => {
                let mut middlewares = self.middlewares.write();
                let old_middleware = middlewares.shift_remove(name);
                drop(middlewares);

                let mut endpoints = self.endpoints.write();
                let old_endpoint = endpoints.insert(name.to_string(), module);
                old_endpoint.or_else(|| old_middleware.map(|mw| mw.module))
            }
            Slot::Middleware(rule) => {
                let mut endpoints = self.endpoints.write();
                let old_endpoint = endpoints.remove(name);
                drop(endpoints);

                let mut middlewares = self.middlewares.write();
                let old = middlewares.insert(
                    name.to_string(),
                    MiddlewareModule {
                        module: module.clone(),
                        rule,
                    },
                );
                old.map(|mw| mw.module).or(old_endpoint)
            }
        }
    }

    pub fn all_endpoint_names(&self) -> Vec<String> {
        self.endpoints.read().keys().cloned().collect()
    }

    pub fn all_middleware_names(&self) -> Vec<String> {
        self.middlewares.read().keys().cloned().collect()
    }

    /// Drains then closes every module currently in the table. Used at
    /// shutdown; runs outside any table lock.
    pub async fn drain_and_close_all(&self, budget: Duration) {
        let modules: Vec<Arc<Module>> = {
            let endpoints = self.endpoints.read();
            let middlewares = self.middlewares.read();
            endpoints
                .values()
                .cloned()
                .chain(middlewares.values().map(|mw| mw.module.clone()))
                .collect()
        };
        for module in modules {
            let _ = tokio::task::spawn_blocking(move || {
                let _ = module.drain(budget);
                module.close();
            })
            .await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn new_table_has_no_entries() {
        let table = ModuleTable::new();
        assert!(table.endpoint("users").is_none());
        assert!(table.pipeline_for("users").is_empty());
    }
}
