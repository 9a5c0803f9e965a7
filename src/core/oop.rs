/// Class and instance layouts.
///
/// A class is a name plus a map of member declarations: methods are closure
/// values, fields are their initializer values. It doubles as the blueprint
/// for `new` and as the lookup fallback behind every instance. Instances hold
/// only the fields actually written; reads fall back to the class members.
/// Member resolution is one level deep — a `super_class` slot is the obvious
/// extension point if inheritance ever lands.

use std::collections::HashMap;

use crate::core::value::{Handle, Value};

#[derive(Debug, Clone)]
pub struct ClassObject {
    pub name: String,
    pub members: HashMap<String, Value>,
}

impl ClassObject {
    pub fn new(name: impl Into<String>) -> Self {
        ClassObject { name: name.into(), members: HashMap::new() }
    }

    pub fn member(&self, name: &str) -> Option<Value> {
        self.members.get(name).copied()
    }
}

#[derive(Debug, Clone)]
pub struct InstanceObject {
    pub class: Handle,
    pub fields: HashMap<String, Value>,
}

impl InstanceObject {
    pub fn new(class: Handle) -> Self {
        InstanceObject { class, fields: HashMap::new() }
    }

    pub fn field(&self, name: &str) -> Option<Value> {
        self.fields.get(name).copied()
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }
}
