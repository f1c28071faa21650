//! Named, typed operator parameters.
//!
//! The graph loader fills one [`ParamStore`] per node. Helpers read it once in
//! `init_param` with [`ParamStore::get`], which treats a missing or mistyped
//! required parameter as a fatal configuration error. Optional parameters are
//! checked with [`ParamStore::has`] first.

use std::collections::BTreeMap;

use crate::tensors::Tensor;

/// A single parameter value.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i32),
    Float(f32),
    Bool(bool),
    Str(String),
    Ints(Vec<i32>),
    Floats(Vec<f32>),
    /// Weight block, shared with every other node that references it.
    Block(Tensor),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Str(_) => "string",
            Self::Ints(_) => "int tuple",
            Self::Floats(_) => "float tuple",
            Self::Block(_) => "weight block",
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<i32>> for Value {
    fn from(v: Vec<i32>) -> Self {
        Self::Ints(v)
    }
}

impl From<Vec<f32>> for Value {
    fn from(v: Vec<f32>) -> Self {
        Self::Floats(v)
    }
}

impl From<Tensor> for Value {
    fn from(v: Tensor) -> Self {
        Self::Block(v)
    }
}

/// Types that can be read out of a [`Value`].
pub trait FromValue: Sized {
    /// Name used in type-mismatch messages.
    const TYPE_NAME: &'static str;

    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for i32 {
    const TYPE_NAME: &'static str = "int";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromValue for f32 {
    const TYPE_NAME: &'static str = "float";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f32),
            _ => None,
        }
    }
}

impl FromValue for bool {
    const TYPE_NAME: &'static str = "bool";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromValue for String {
    const TYPE_NAME: &'static str = "string";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Str(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromValue for Vec<i32> {
    const TYPE_NAME: &'static str = "int tuple";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Ints(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromValue for Vec<f32> {
    const TYPE_NAME: &'static str = "float tuple";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Floats(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromValue for Tensor {
    const TYPE_NAME: &'static str = "weight block";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Block(t) => Some(t.clone()),
            _ => None,
        }
    }
}

/// Parameters of one graph node.
#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    node: String,
    values: BTreeMap<String, Value>,
}

impl ParamStore {
    /// Empty store for the named node. The name only shows up in messages.
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Inserts or replaces a parameter.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Builder form of [`ParamStore::set`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn has(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Reads a required parameter.
    ///
    /// # Panics
    /// Panics if the parameter is missing or holds another type.
    pub fn get<T: FromValue>(&self, name: &str) -> T {
        let value = self.values.get(name).unwrap_or_else(|| {
            panic!("parameter `{name}` of node `{}` is missing", self.node)
        });
        T::from_value(value).unwrap_or_else(|| {
            panic!(
                "parameter `{name}` of node `{}` is a {}, expected {}",
                self.node,
                value.type_name(),
                T::TYPE_NAME
            )
        })
    }

    /// Reads an optional parameter, falling back to `default` when absent.
    ///
    /// # Panics
    /// Panics if the parameter is present with another type.
    pub fn get_or<T: FromValue>(&self, name: &str, default: T) -> T {
        if self.has(name) { self.get(name) } else { default }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensors::Layout;

    #[test]
    fn typed_reads() {
        let store = ParamStore::new("node0")
            .with("group", 3)
            .with("epsilon", 1e-4f32)
            .with("dims", vec![1, -1, 4])
            .with("layout", "NCHW");
        assert_eq!(store.get::<i32>("group"), 3);
        assert_eq!(store.get::<f32>("epsilon"), 1e-4);
        assert_eq!(store.get::<Vec<i32>>("dims"), vec![1, -1, 4]);
        assert_eq!(store.get::<String>("layout"), "NCHW");
        // ints widen to floats
        assert_eq!(store.get::<f32>("group"), 3.0);
        assert!(!store.has("scale"));
        assert_eq!(store.get_or("scale", 2.0f32), 2.0);
    }

    #[test]
    fn blocks_share_storage() {
        let w = Tensor::new([1, 3, 1, 1], Layout::Nchw);
        let store = ParamStore::new("n").with("weight_1", w.clone());
        let got: Tensor = store.get("weight_1");
        assert!(got.buffer().same(w.buffer()));
    }

    #[test]
    #[should_panic(expected = "parameter `group` of node `shuffle` is missing")]
    fn missing_required_is_fatal() {
        let store = ParamStore::new("shuffle");
        let _: i32 = store.get("group");
    }

    #[test]
    #[should_panic(expected = "is a string, expected int")]
    fn mistyped_required_is_fatal() {
        let store = ParamStore::new("n").with("group", "three");
        let _: i32 = store.get("group");
    }
}
