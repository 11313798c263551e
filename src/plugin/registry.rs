//! Plugin registry
//!
//! RwLock-guarded name map. Lifecycle calls (`initialize`, `stop`) run
//! outside the lock: references are collected under the lock, the lock is
//! dropped, then the call is made, so a plugin calling back into the
//! registry cannot deadlock it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::plugin::{DataSourceCapable, FunctionCapable, MonitorCapable, Plugin};

#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, Arc<Plugin>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register and initialize. Duplicate names are an error; `initialize`
    /// runs after the lock is released.
    pub async fn register(
        &self,
        plugin: Plugin,
        config: &HashMap<String, String>,
    ) -> Result<()> {
        let name = plugin.lifecycle().name().to_string();
        let plugin = Arc::new(plugin);
        {
            let mut plugins = self.plugins.write().unwrap();
            if plugins.contains_key(&name) {
                return Err(Error::Plugin(format!("plugin '{name}' already registered")));
            }
            plugins.insert(name.clone(), Arc::clone(&plugin));
        }
        // Outside the lock.
        if let Err(e) = plugin.lifecycle().initialize(config).await {
            self.plugins.write().unwrap().remove(&name);
            return Err(e);
        }
        tracing::info!(plugin = %name, "Registered plugin");
        Ok(())
    }

    /// Deregister; `stop` is invoked outside the lock, and only when the
    /// plugin reports it is running.
    pub async fn deregister(&self, name: &str) -> Result<()> {
        let plugin = {
            let mut plugins = self.plugins.write().unwrap();
            plugins
                .remove(name)
                .ok_or_else(|| Error::Plugin(format!("plugin '{name}' not registered")))?
        };
        if plugin.lifecycle().is_running() {
            plugin.lifecycle().stop().await?;
        }
        tracing::info!(plugin = name, "Deregistered plugin");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Plugin>> {
        self.plugins.read().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Typed lookups.
    pub fn data_source(&self, name: &str) -> Option<Arc<dyn DataSourceCapable>> {
        match self.get(name)?.as_ref() {
            Plugin::DataSource(p) => Some(Arc::clone(p)),
            _ => None,
        }
    }

    pub fn function_provider(&self, name: &str) -> Option<Arc<dyn FunctionCapable>> {
        match self.get(name)?.as_ref() {
            Plugin::Function(p) => Some(Arc::clone(p)),
            _ => None,
        }
    }

    pub fn monitor(&self, name: &str) -> Option<Arc<dyn MonitorCapable>> {
        match self.get(name)?.as_ref() {
            Plugin::Monitor(p) => Some(Arc::clone(p)),
            _ => None,
        }
    }

    /// Start every registered plugin; references are collected under the
    /// lock, calls run after it is dropped.
    pub async fn start_all(&self) -> Result<()> {
        let plugins: Vec<Arc<Plugin>> =
            self.plugins.read().unwrap().values().cloned().collect();
        for plugin in plugins {
            plugin.lifecycle().start().await?;
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        let plugins: Vec<Arc<Plugin>> =
            self.plugins.read().unwrap().values().cloned().collect();
        for plugin in plugins {
            if plugin.lifecycle().is_running() {
                if let Err(e) = plugin.lifecycle().stop().await {
                    tracing::warn!(plugin = plugin.lifecycle().name(), %e, "Plugin stop failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{LifecycleCapable, MonitorCapable};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestMonitor {
        running: AtomicBool,
        initialized: AtomicBool,
        metrics: Mutex<HashMap<String, f64>>,
    }

    #[async_trait]
    impl LifecycleCapable for TestMonitor {
        fn name(&self) -> &str {
            "test-monitor"
        }
        fn version(&self) -> &str {
            "1.0"
        }
        async fn initialize(&self, _config: &HashMap<String, String>) -> crate::error::Result<()> {
            self.initialized.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn start(&self) -> crate::error::Result<()> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&self) -> crate::error::Result<()> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    impl MonitorCapable for TestMonitor {
        fn record_metric(&self, name: &str, value: f64, _tags: &HashMap<String, String>) {
            self.metrics.lock().unwrap().insert(name.to_string(), value);
        }
        fn record_event(&self, _name: &str, _data: &HashMap<String, String>) {}
        fn get_metric(&self, name: &str) -> Option<f64> {
            self.metrics.lock().unwrap().get(name).copied()
        }
        fn get_metrics(&self) -> HashMap<String, f64> {
            self.metrics.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn test_register_initializes_and_duplicate_fails() {
        let registry = PluginRegistry::new();
        let monitor = Arc::new(TestMonitor::default());
        registry
            .register(Plugin::Monitor(monitor.clone()), &HashMap::new())
            .await
            .unwrap();
        assert!(monitor.initialized.load(Ordering::SeqCst));

        let duplicate = Arc::new(TestMonitor::default());
        let err = registry
            .register(Plugin::Monitor(duplicate), &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Plugin(_)));
    }

    #[tokio::test]
    async fn test_typed_lookup_and_lifecycle() {
        let registry = PluginRegistry::new();
        let monitor = Arc::new(TestMonitor::default());
        registry
            .register(Plugin::Monitor(monitor.clone()), &HashMap::new())
            .await
            .unwrap();

        assert!(registry.monitor("test-monitor").is_some());
        assert!(registry.data_source("test-monitor").is_none());

        registry.start_all().await.unwrap();
        assert!(monitor.is_running());

        // Deregistration stops a running plugin.
        registry.deregister("test-monitor").await.unwrap();
        assert!(!monitor.is_running());
        assert!(registry.get("test-monitor").is_none());
    }

    #[tokio::test]
    async fn test_monitor_metrics_round_trip() {
        let monitor = TestMonitor::default();
        monitor.record_metric("qps", 42.0, &HashMap::new());
        assert_eq!(monitor.get_metric("qps"), Some(42.0));
        assert_eq!(monitor.get_metrics().len(), 1);
    }
}
