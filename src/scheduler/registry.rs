use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use serde_json::Value;

use crate::scheduler::plugin::{FilterPlugin, ScorePlugin};

pub type FilterFactory = Box<dyn Fn(&Value) -> Result<Arc<dyn FilterPlugin>> + Send + Sync>;
pub type ScoreFactory = Box<dyn Fn(&Value) -> Result<Arc<dyn ScorePlugin>> + Send + Sync>;

/// Two name-indexed maps of plugin factories. Factories accept an opaque
/// JSON config blob (plugin-specific options like `maxWaiting` or the VTC
/// weights) and return a constructed plugin instance. Registration is only
/// valid before the framework starts serving requests.
pub struct PluginRegistry {
    filters: RwLock<HashMap<String, FilterFactory>>,
    scorers: RwLock<HashMap<String, ScoreFactory>>,
    started: AtomicBool,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            filters: RwLock::new(HashMap::new()),
            scorers: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn register_filter(&self, name: impl Into<String>, factory: FilterFactory) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(anyhow!("plugin registration is closed once the framework has started"));
        }
        self.filters.write().insert(name.into(), factory);
        Ok(())
    }

    pub fn register_score(&self, name: impl Into<String>, factory: ScoreFactory) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(anyhow!("plugin registration is closed once the framework has started"));
        }
        self.scorers.write().insert(name.into(), factory);
        Ok(())
    }

    pub fn build_filter(&self, name: &str, config: &Value) -> Result<Arc<dyn FilterPlugin>> {
        let factories = self.filters.read();
        let factory = factories
            .get(name)
            .ok_or_else(|| anyhow!("no filter plugin registered under name {name}"))?;
        factory(config)
    }

    pub fn build_score(&self, name: &str, config: &Value) -> Result<Arc<dyn ScorePlugin>> {
        let factories = self.scorers.read();
        let factory = factories
            .get(name)
            .ok_or_else(|| anyhow!("no score plugin registered under name {name}"))?;
        factory(config)
    }

    pub fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }
}
