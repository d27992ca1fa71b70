use std::collections::HashMap;

/// Environment variables handed to a spawned service
#[derive(Debug, Clone, Default)]
pub struct Environment(HashMap<String, String>);

impl Environment {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    /// Snapshot of the current process environment
    pub fn inherited() -> Self {
        Self(std::env::vars().collect())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Merges `other` into this set; keys in `other` win.
    pub fn extend(&mut self, other: Environment) {
        self.0.extend(other.0);
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}
