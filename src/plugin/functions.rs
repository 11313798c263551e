//! Built-in scalar-function plugin
//!
//! A function registry behind the plugin capability: named functions over
//! `Value` arguments, registered and called at runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::plugin::{FunctionCapable, LifecycleCapable, PluginFunction};
use crate::storage::value::Value;

/// Function provider with a handful of built-ins pre-registered.
pub struct BuiltinFunctionPlugin {
    functions: RwLock<HashMap<String, PluginFunction>>,
    running: AtomicBool,
}

impl Default for BuiltinFunctionPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinFunctionPlugin {
    pub fn new() -> Self {
        let plugin = Self {
            functions: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
        };
        let _ = plugin.register(
            "reverse",
            std::sync::Arc::new(|args: &[Value]| match args {
                [Value::Str(s)] => Ok(Value::Str(s.chars().rev().collect())),
                _ => Err(Error::Unsupported("reverse(string)".into())),
            }),
        );
        let _ = plugin.register(
            "greatest",
            std::sync::Arc::new(|args: &[Value]| {
                let mut best: Option<&Value> = None;
                for a in args {
                    if a.is_null() {
                        continue;
                    }
                    best = match best {
                        Some(b) if b.sql_cmp(a) != Some(std::cmp::Ordering::Less) => Some(b),
                        _ => Some(a),
                    };
                }
                Ok(best.cloned().unwrap_or(Value::Null))
            }),
        );
        plugin
    }
}

#[async_trait]
impl LifecycleCapable for BuiltinFunctionPlugin {
    fn name(&self) -> &str {
        "builtin-functions"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    async fn initialize(&self, _config: &HashMap<String, String>) -> Result<()> {
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl FunctionCapable for BuiltinFunctionPlugin {
    fn register(&self, name: &str, f: PluginFunction) -> Result<()> {
        let mut functions = self.functions.write().unwrap();
        if functions.contains_key(name) {
            return Err(Error::Plugin(format!("function '{name}' already registered")));
        }
        functions.insert(name.to_string(), f);
        Ok(())
    }

    fn unregister(&self, name: &str) -> Result<()> {
        self.functions
            .write()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::Plugin(format!("function '{name}' not registered")))
    }

    fn call(&self, name: &str, args: &[Value]) -> Result<Value> {
        let f = self
            .get_function(name)
            .ok_or_else(|| Error::Unsupported(format!("function {name}()")))?;
        f(args)
    }

    fn get_function(&self, name: &str) -> Option<PluginFunction> {
        self.functions.read().unwrap().get(name).cloned()
    }

    fn list_functions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let plugin = BuiltinFunctionPlugin::new();
        assert_eq!(
            plugin.list_functions(),
            vec!["greatest".to_string(), "reverse".to_string()]
        );
        assert_eq!(
            plugin.call("reverse", &[Value::Str("abc".into())]).unwrap(),
            Value::Str("cba".into())
        );
        assert_eq!(
            plugin
                .call("greatest", &[Value::Int(3), Value::Null, Value::Int(7)])
                .unwrap(),
            Value::Int(7)
        );
    }

    #[test]
    fn test_register_call_unregister() {
        let plugin = BuiltinFunctionPlugin::new();
        plugin
            .register(
                "answer",
                std::sync::Arc::new(|_| Ok(Value::Int(42))),
            )
            .unwrap();
        assert_eq!(plugin.call("answer", &[]).unwrap(), Value::Int(42));
        assert!(plugin
            .register("answer", std::sync::Arc::new(|_| Ok(Value::Null)))
            .is_err());
        plugin.unregister("answer").unwrap();
        assert!(plugin.call("answer", &[]).is_err());
        assert!(plugin.unregister("answer").is_err());
    }
}
