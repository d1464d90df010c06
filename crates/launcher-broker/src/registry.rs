//! Service-name registry seen by the broker

use std::collections::HashMap;

use log::debug;

/// Answers whether a service name currently has an owner
pub trait ServiceRegistry {
    fn is_registered(&self, name: &str) -> bool;

    /// `name` changed owner; an empty owner means it was released.
    /// Registries backed by an external bus track this themselves.
    fn owner_changed(&mut self, _name: &str, _owner: &str) {}
}

/// Registry fed by registration announcements the broker receives itself
#[derive(Debug, Default)]
pub struct LocalRegistry {
    owners: HashMap<String, String>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `owner` for `name`. An empty owner releases the name.
    pub fn register(&mut self, name: &str, owner: &str) {
        if owner.is_empty() {
            self.unregister(name);
            return;
        }
        debug!("service {} owned by {}", name, owner);
        self.owners.insert(name.to_string(), owner.to_string());
    }

    pub fn unregister(&mut self, name: &str) -> Option<String> {
        self.owners.remove(name)
    }

    pub fn owner(&self, name: &str) -> Option<&str> {
        self.owners.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

impl ServiceRegistry for LocalRegistry {
    fn is_registered(&self, name: &str) -> bool {
        self.owners.contains_key(name)
    }

    fn owner_changed(&mut self, name: &str, owner: &str) {
        self.register(name, owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_release() {
        let mut registry = LocalRegistry::new();
        registry.register("org.example.App", ":1.2");
        assert!(registry.is_registered("org.example.App"));
        assert_eq!(registry.owner("org.example.App"), Some(":1.2"));

        registry.register("org.example.App", "");
        assert!(!registry.is_registered("org.example.App"));
        assert!(registry.is_empty());
    }
}
