//! Adapter registry and switching engine.
//!
//! This module provides functionality for:
//! - Registering multiple named adapters, with explicit overwrite
//! - Switching the active adapter in constant time
//! - Falling back to base-only inference (`Idle`)
//!
//! Switching only reassigns the active name after a hash lookup. It never reads or writes
//! adapter contents, so its cost does not depend on how many adapters are resident or which
//! one was active before.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{EdgeError, Result};

/// Registry state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState<'a> {
    /// No adapter active; inference uses base weights only
    Idle,
    /// The named adapter is active
    Active(&'a str),
}

/// Registry for managing multiple named adapters.
///
/// Invariant: `active`, when set, names an entry of `adapters`.
pub struct AdapterRegistry<A> {
    /// Map of adapter names to adapters
    adapters: HashMap<String, A>,
    /// Currently active adapter name
    active: Option<String>,
}

impl<A> AdapterRegistry<A> {
    /// Create a new empty adapter registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
            active: None,
        }
    }

    /// Register a new adapter with the given name.
    ///
    /// Does not change the active adapter.
    ///
    /// # Errors
    /// Returns [`EdgeError::AdapterAlreadyExists`] if the name is taken.
    pub fn register_adapter(&mut self, name: impl Into<String>, adapter: A) -> Result<()> {
        self.insert(name, adapter, false).map(|_| ())
    }

    /// Insert an adapter, replacing an existing entry only when `overwrite` is set.
    ///
    /// Replacing the active adapter keeps it active with the new contents.
    ///
    /// # Returns
    /// The replaced adapter, if any
    ///
    /// # Errors
    /// Returns [`EdgeError::AdapterAlreadyExists`] if the name is taken and `overwrite` is
    /// false; the registry is left unchanged.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        adapter: A,
        overwrite: bool,
    ) -> Result<Option<A>> {
        let name = name.into();

        if !overwrite && self.adapters.contains_key(&name) {
            return Err(EdgeError::AdapterAlreadyExists { name });
        }

        debug!(adapter = %name, overwrite, "registering adapter");
        Ok(self.adapters.insert(name, adapter))
    }

    /// Make the named adapter active.
    ///
    /// # Errors
    /// Returns [`EdgeError::AdapterNotFound`] if no adapter with this name exists; the
    /// active adapter is left unchanged.
    pub fn switch_adapter(&mut self, name: &str) -> Result<()> {
        if !self.adapters.contains_key(name) {
            return Err(EdgeError::AdapterNotFound {
                name: name.to_string(),
            });
        }

        if self.active.as_deref() != Some(name) {
            self.active = Some(name.to_string());
        }
        Ok(())
    }

    /// Return to base-only inference.
    pub fn deactivate(&mut self) {
        self.active = None;
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> RegistryState<'_> {
        match self.active.as_deref() {
            Some(name) => RegistryState::Active(name),
            None => RegistryState::Idle,
        }
    }

    /// The active adapter and its name, or `None` when idle.
    #[must_use]
    pub fn active_adapter(&self) -> Option<(&str, &A)> {
        let name = self.active.as_deref()?;
        self.adapters.get(name).map(|adapter| (name, adapter))
    }

    /// Get the name of the currently active adapter.
    #[must_use]
    pub fn active_adapter_name(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Get a reference to an adapter by name.
    ///
    /// # Errors
    /// Returns an error if no adapter with this name exists
    pub fn get_adapter(&self, name: &str) -> Result<&A> {
        self.adapters
            .get(name)
            .ok_or_else(|| EdgeError::AdapterNotFound {
                name: name.to_string(),
            })
    }

    /// Check if an adapter with the given name exists.
    #[must_use]
    pub fn contains_adapter(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Sorted list of all registered adapter names.
    #[must_use]
    pub fn adapter_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Get the number of registered adapters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Check if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Remove an adapter by name.
    ///
    /// # Errors
    /// Returns [`EdgeError::AdapterActive`] when trying to remove the active adapter
    /// (deactivate or switch first), or [`EdgeError::AdapterNotFound`].
    pub fn remove_adapter(&mut self, name: &str) -> Result<A> {
        if self.active.as_deref() == Some(name) {
            return Err(EdgeError::AdapterActive {
                name: name.to_string(),
            });
        }

        self.adapters
            .remove(name)
            .ok_or_else(|| EdgeError::AdapterNotFound {
                name: name.to_string(),
            })
    }

    /// Clear all adapters from the registry.
    pub fn clear(&mut self) {
        self.adapters.clear();
        self.active = None;
    }
}

impl<A> Default for AdapterRegistry<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(names: &[&str]) -> Result<AdapterRegistry<Vec<f32>>> {
        let mut registry = AdapterRegistry::new();
        for (i, name) in names.iter().enumerate() {
            registry.register_adapter(*name, vec![i as f32; 4])?;
        }
        Ok(registry)
    }

    #[test]
    fn test_registry_creation() {
        let registry: AdapterRegistry<Vec<f32>> = AdapterRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.state(), RegistryState::Idle);
    }

    #[test]
    fn test_register_does_not_activate() -> Result<()> {
        let registry = registry(&["sunny", "rain"])?;
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.state(), RegistryState::Idle);
        assert!(registry.active_adapter().is_none());
        Ok(())
    }

    #[test]
    fn test_register_duplicate_adapter() -> Result<()> {
        let mut registry = registry(&["sunny"])?;
        let result = registry.register_adapter("sunny", vec![9.0; 4]);

        assert!(matches!(
            result,
            Err(EdgeError::AdapterAlreadyExists { .. })
        ));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get_adapter("sunny")?, &vec![0.0; 4]);
        Ok(())
    }

    #[test]
    fn test_overwrite_replaces() -> Result<()> {
        let mut registry = registry(&["sunny"])?;
        registry.switch_adapter("sunny")?;
        let old = registry.insert("sunny", vec![9.0; 4], true)?;

        assert_eq!(old, Some(vec![0.0; 4]));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.active_adapter(), Some(("sunny", &vec![9.0; 4])));
        Ok(())
    }

    #[test]
    fn test_switch_and_deactivate() -> Result<()> {
        let mut registry = registry(&["sunny", "rain"])?;

        registry.switch_adapter("rain")?;
        assert_eq!(registry.state(), RegistryState::Active("rain"));

        registry.switch_adapter("sunny")?;
        assert_eq!(registry.active_adapter_name(), Some("sunny"));

        registry.deactivate();
        assert_eq!(registry.state(), RegistryState::Idle);
        Ok(())
    }

    #[test]
    fn test_switch_nonexistent_keeps_state() -> Result<()> {
        let mut registry = registry(&["sunny"])?;
        registry.switch_adapter("sunny")?;

        let result = registry.switch_adapter("fog");
        assert!(matches!(result, Err(EdgeError::AdapterNotFound { .. })));
        assert_eq!(registry.state(), RegistryState::Active("sunny"));
        Ok(())
    }

    #[test]
    fn test_adapter_names_sorted() -> Result<()> {
        let registry = registry(&["sunny", "night", "rain"])?;
        assert_eq!(registry.adapter_names(), vec!["night", "rain", "sunny"]);
        Ok(())
    }

    #[test]
    fn test_remove_adapter() -> Result<()> {
        let mut registry = registry(&["sunny", "rain"])?;
        registry.switch_adapter("sunny")?;

        let removed = registry.remove_adapter("rain")?;
        assert_eq!(removed, vec![1.0; 4]);
        assert_eq!(registry.len(), 1);

        assert!(matches!(
            registry.remove_adapter("sunny"),
            Err(EdgeError::AdapterActive { .. })
        ));
        assert!(matches!(
            registry.remove_adapter("rain"),
            Err(EdgeError::AdapterNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_clear() -> Result<()> {
        let mut registry = registry(&["sunny"])?;
        registry.switch_adapter("sunny")?;
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.state(), RegistryState::Idle);
        Ok(())
    }
}
