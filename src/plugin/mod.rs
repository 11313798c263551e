//! Plugin capability traits
//!
//! Small capability interfaces composed into concrete plugin types: every
//! plugin is lifecycle-capable, and may additionally serve data, register
//! functions, or record metrics.

pub mod functions;
pub mod registry;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::storage::value::{Row, Value};

pub use registry::PluginRegistry;

/// Lifecycle shared by every plugin.
#[async_trait]
pub trait LifecycleCapable: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    async fn initialize(&self, config: &HashMap<String, String>) -> Result<()>;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    fn is_running(&self) -> bool;
}

/// Opaque connection handle issued by a data-source plugin.
pub type ConnectionHandle = u64;

/// External data-source capability.
#[async_trait]
pub trait DataSourceCapable: LifecycleCapable {
    async fn connect(&self, dsn: &str) -> Result<ConnectionHandle>;
    async fn disconnect(&self, handle: ConnectionHandle) -> Result<()>;
    async fn query(&self, handle: ConnectionHandle, sql: &str, params: &[Value])
        -> Result<Vec<Row>>;
    async fn execute(&self, handle: ConnectionHandle, sql: &str, params: &[Value]) -> Result<u64>;
}

/// A registered scalar function.
pub type PluginFunction = std::sync::Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// Scalar-function registry capability.
pub trait FunctionCapable: LifecycleCapable {
    fn register(&self, name: &str, f: PluginFunction) -> Result<()>;
    fn unregister(&self, name: &str) -> Result<()>;
    fn call(&self, name: &str, args: &[Value]) -> Result<Value>;
    fn get_function(&self, name: &str) -> Option<PluginFunction>;
    fn list_functions(&self) -> Vec<String>;
}

/// Observability capability.
pub trait MonitorCapable: LifecycleCapable {
    fn record_metric(&self, name: &str, value: f64, tags: &HashMap<String, String>);
    fn record_event(&self, name: &str, data: &HashMap<String, String>);
    fn get_metric(&self, name: &str) -> Option<f64>;
    fn get_metrics(&self) -> HashMap<String, f64>;
}

/// The concrete capability a plugin registers under.
pub enum Plugin {
    DataSource(std::sync::Arc<dyn DataSourceCapable>),
    Function(std::sync::Arc<dyn FunctionCapable>),
    Monitor(std::sync::Arc<dyn MonitorCapable>),
}

impl Plugin {
    pub fn lifecycle(&self) -> &dyn LifecycleCapable {
        match self {
            Plugin::DataSource(p) => p.as_ref(),
            Plugin::Function(p) => p.as_ref(),
            Plugin::Monitor(p) => p.as_ref(),
        }
    }
}
