//! Function registry.
//!
//! One registry per session, shared as an `Arc` by the optimizer, the
//! evaluator and the engine. Names are case-insensitive.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use gridcalc_primitives::{ErrorValue, Value};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::builtins;

/// A function implementation. Errors are returned as [`Value::Error`].
pub type FunctionImpl = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FunctionCategory {
    Math,
    Statistical,
    Logical,
    Text,
    DateTime,
    Random,
    Information,
    Custom,
}

#[derive(Clone)]
pub struct FunctionInfo {
    pub name: String,
    pub category: FunctionCategory,
    pub description: String,
    pub min_args: usize,
    /// `None` means variadic.
    pub max_args: Option<usize>,
    /// Volatile functions are re-evaluated on every recalculation pass.
    pub is_volatile: bool,
    implementation: FunctionImpl,
}

impl fmt::Debug for FunctionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionInfo")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("min_args", &self.min_args)
            .field("max_args", &self.max_args)
            .field("is_volatile", &self.is_volatile)
            .finish_non_exhaustive()
    }
}

impl FunctionInfo {
    pub fn new(
        name: impl Into<String>,
        category: FunctionCategory,
        implementation: impl Fn(&[Value]) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into().to_ascii_uppercase(),
            category,
            description: String::new(),
            min_args: 0,
            max_args: None,
            is_volatile: false,
            implementation: Arc::new(implementation),
        }
    }

    pub fn args(mut self, min: usize, max: Option<usize>) -> Self {
        self.min_args = min;
        self.max_args = max;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn volatile(mut self) -> Self {
        self.is_volatile = true;
        self
    }

    fn check_arity(&self, count: usize) -> Result<(), String> {
        let too_few = count < self.min_args;
        let too_many = self.max_args.is_some_and(|max| count > max);
        if !too_few && !too_many {
            return Ok(());
        }
        let expected = match self.max_args {
            Some(max) if max == self.min_args => format!("{max}"),
            Some(max) => format!("{} to {}", self.min_args, max),
            None => format!("at least {}", self.min_args),
        };
        Err(format!(
            "{} expects {} argument(s), got {}",
            self.name, expected, count
        ))
    }

    /// Call the implementation after checking the argument count.
    pub fn call(&self, args: &[Value]) -> Value {
        match self.check_arity(args.len()) {
            Ok(()) => (self.implementation)(args),
            Err(message) => Value::Error(ErrorValue::error(message)),
        }
    }
}

pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, Arc<FunctionInfo>>>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.functions.read().len())
            .finish()
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        let registry = Self::empty();
        builtins::register_builtins(&registry);
        registry
    }
}

impl FunctionRegistry {
    /// A registry without the builtin functions.
    pub fn empty() -> Self {
        Self {
            functions: RwLock::new(HashMap::new()),
        }
    }

    /// Register or replace a function.
    pub fn register_function(&self, info: FunctionInfo) {
        tracing::debug!(name = %info.name, volatile = info.is_volatile, "registered function");
        self.functions
            .write()
            .insert(info.name.clone(), Arc::new(info));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.functions
            .write()
            .remove(&name.to_ascii_uppercase())
            .is_some()
    }

    pub fn get_function(&self, name: &str) -> Option<Arc<FunctionInfo>> {
        self.functions
            .read()
            .get(&name.to_ascii_uppercase())
            .cloned()
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions
            .read()
            .contains_key(&name.to_ascii_uppercase())
    }

    pub fn is_volatile(&self, name: &str) -> bool {
        self.get_function(name)
            .is_some_and(|info| info.is_volatile)
    }

    /// Call by name. Unknown names give `#NAME:`, bad arity gives `#ERROR:`.
    pub fn call_function(&self, name: &str, args: &[Value]) -> Value {
        match self.get_function(name) {
            Some(info) => info.call(args),
            None => Value::Error(ErrorValue::Name(format!("Unknown function: {name}"))),
        }
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn by_category(&self, category: FunctionCategory) -> Vec<Arc<FunctionInfo>> {
        let mut found: Vec<Arc<FunctionInfo>> = self
            .functions
            .read()
            .values()
            .filter(|info| info.category == category)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }

    pub fn len(&self) -> usize {
        self.functions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_registry() {
        let registry = FunctionRegistry::default();
        assert!(registry.has_function("SUM"));
        assert!(registry.has_function("sum"));
        assert!(!registry.has_function("VLOOKUP"));
        assert!(registry.is_volatile("now"));
        assert!(!registry.is_volatile("SUM"));
    }

    #[test]
    fn test_registry_metadata() {
        let registry = FunctionRegistry::default();
        let sum = registry.get_function("SUM").expect("SUM registered");
        assert_eq!(sum.min_args, 1);
        assert_eq!(sum.max_args, None);
        assert_eq!(sum.category, FunctionCategory::Math);
        let mid = registry.get_function("MID").expect("MID registered");
        assert_eq!((mid.min_args, mid.max_args), (3, Some(3)));
    }

    #[test]
    fn test_unknown_function_and_arity() {
        let registry = FunctionRegistry::default();
        assert_eq!(
            registry.call_function("NOPE", &[]),
            Value::Error(ErrorValue::Name("Unknown function: NOPE".to_string()))
        );
        assert_eq!(
            registry.call_function("ABS", &[]),
            Value::Error(ErrorValue::error("ABS expects 1 argument(s), got 0"))
        );
        assert_eq!(
            registry.call_function("ROUND", &vec![Value::Number(1.0); 3]),
            Value::Error(ErrorValue::error("ROUND expects 1 to 2 argument(s), got 3"))
        );
    }

    #[test]
    fn test_register_custom_function() {
        let registry = FunctionRegistry::empty();
        assert!(registry.is_empty());
        registry.register_function(
            FunctionInfo::new("double", FunctionCategory::Custom, |args| match args[0]
                .as_number()
            {
                Ok(n) => Value::Number(n * 2.0),
                Err(err) => Value::Error(err),
            })
            .args(1, Some(1))
            .description("Twice the argument"),
        );
        assert_eq!(
            registry.call_function("Double", &[Value::Number(4.0)]),
            Value::Number(8.0)
        );
        assert_eq!(registry.by_category(FunctionCategory::Custom).len(), 1);
        assert!(registry.unregister("DOUBLE"));
        assert!(!registry.unregister("DOUBLE"));
    }

    #[test]
    fn test_categories_cover_builtins() {
        let registry = FunctionRegistry::default();
        for category in [
            FunctionCategory::Math,
            FunctionCategory::Statistical,
            FunctionCategory::Logical,
            FunctionCategory::Text,
            FunctionCategory::DateTime,
            FunctionCategory::Random,
            FunctionCategory::Information,
        ] {
            assert!(!registry.by_category(category).is_empty(), "{category:?}");
        }
        assert_eq!(registry.names().len(), registry.len());
    }
}
