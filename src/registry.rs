//! Provider registry: bidirectional friendly-name / GUID lookup
//!
//! One instance is constructed per process and shared by reference (`Arc`).
//! Every operation takes the same lock, so registration never races with
//! lookups from callback threads.

use crate::error::{Result, TraceError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

struct Entries<T: ?Sized> {
    names: HashMap<String, Uuid>,
    values: HashMap<Uuid, Arc<T>>,
}

/// Thread-safe map from provider name and provider GUID to a shared value
/// (a semantic parser, a provider-specific handler, ...)
pub struct ProviderRegistry<T: ?Sized> {
    entries: Mutex<Entries<T>>,
}

impl<T: ?Sized> Default for ProviderRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> ProviderRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Entries {
                names: HashMap::new(),
                values: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries<T>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `value` under both `name` and `id`, replacing any previous
    /// value for either key. A GUID has one name: registering it under a new
    /// name forgets the old one.
    pub fn register(&self, name: &str, id: Uuid, value: Arc<T>) {
        let mut entries = self.lock();
        entries.names.retain(|existing, mapped| *mapped != id || existing == name);
        if let Some(previous) = entries.names.insert(name.to_string(), id) {
            if previous != id {
                entries.values.remove(&previous);
            }
        }
        entries.values.insert(id, value);
    }

    pub fn resolve_by_name(&self, name: &str) -> Result<Arc<T>> {
        let entries = self.lock();
        entries
            .names
            .get(name)
            .and_then(|id| entries.values.get(id))
            .cloned()
            .ok_or_else(|| TraceError::NotFound(format!("provider '{}'", name)))
    }

    pub fn resolve_by_id(&self, id: &Uuid) -> Result<Arc<T>> {
        self.lock()
            .values
            .get(id)
            .cloned()
            .ok_or_else(|| TraceError::NotFound(format!("provider {{{}}}", id)))
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.lock().names.contains_key(name)
    }

    pub fn contains_id(&self, id: &Uuid) -> bool {
        self.lock().values.contains_key(id)
    }

    pub fn unregister_by_name(&self, name: &str) -> Result<()> {
        let mut entries = self.lock();
        let id = entries
            .names
            .remove(name)
            .ok_or_else(|| TraceError::NotFound(format!("provider '{}'", name)))?;
        entries.values.remove(&id);
        Ok(())
    }

    /// Remove by GUID; the friendly name is located by reverse scan
    pub fn unregister_by_id(&self, id: &Uuid) -> Result<()> {
        let mut entries = self.lock();
        let name = entries
            .names
            .iter()
            .find(|(_, v)| *v == id)
            .map(|(k, _)| k.clone())
            .ok_or_else(|| TraceError::NotFound(format!("provider {{{}}}", id)))?;
        entries.names.remove(&name);
        entries.values.remove(id);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const DNS: Uuid = Uuid::from_u128(0x1c95126e_7eea_49a9_a3fe_a378b03ddb4d);
    const NET: Uuid = Uuid::from_u128(0x7dd42a49_5329_4832_8dfd_43d979153a88);

    #[test]
    fn test_register_resolves_both_ways_to_same_instance() {
        let registry: ProviderRegistry<String> = ProviderRegistry::new();
        let value = Arc::new("dns".to_string());
        registry.register("Microsoft-Windows-DNS-Client", DNS, value.clone());

        let by_name = registry.resolve_by_name("Microsoft-Windows-DNS-Client").unwrap();
        let by_id = registry.resolve_by_id(&DNS).unwrap();
        assert!(Arc::ptr_eq(&by_name, &value));
        assert!(Arc::ptr_eq(&by_id, &value));
        assert!(registry.contains_name("Microsoft-Windows-DNS-Client"));
        assert!(registry.contains_id(&DNS));
    }

    #[test]
    fn test_unregister_by_name_removes_both_keys() {
        let registry: ProviderRegistry<u32> = ProviderRegistry::new();
        registry.register("dns", DNS, Arc::new(1));
        registry.unregister_by_name("dns").unwrap();

        assert!(registry.resolve_by_name("dns").is_err());
        assert!(registry.resolve_by_id(&DNS).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister_by_id_uses_reverse_scan() {
        let registry: ProviderRegistry<u32> = ProviderRegistry::new();
        registry.register("dns", DNS, Arc::new(1));
        registry.register("net", NET, Arc::new(2));
        registry.unregister_by_id(&NET).unwrap();

        assert!(!registry.contains_name("net"));
        assert!(registry.contains_name("dns"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_lookups_are_not_found() {
        let registry: ProviderRegistry<u32> = ProviderRegistry::new();
        assert!(matches!(
            registry.unregister_by_id(&DNS),
            Err(TraceError::NotFound(_))
        ));
        assert!(matches!(
            registry.unregister_by_name("nope"),
            Err(TraceError::NotFound(_))
        ));
        assert!(matches!(
            registry.resolve_by_name("nope"),
            Err(TraceError::NotFound(_))
        ));
    }

    #[test]
    fn test_reregister_name_with_new_id_drops_stale_value() {
        let registry: ProviderRegistry<u32> = ProviderRegistry::new();
        registry.register("p", DNS, Arc::new(1));
        registry.register("p", NET, Arc::new(2));

        assert_eq!(*registry.resolve_by_name("p").unwrap(), 2);
        assert!(!registry.contains_id(&DNS));
    }

    #[test]
    fn test_reregister_id_under_new_name_drops_old_name() {
        let registry: ProviderRegistry<u32> = ProviderRegistry::new();
        registry.register("a", DNS, Arc::new(1));
        registry.register("b", DNS, Arc::new(2));

        assert!(!registry.contains_name("a"));
        assert!(registry.resolve_by_name("a").is_err());
        assert_eq!(*registry.resolve_by_name("b").unwrap(), 2);
        assert_eq!(*registry.resolve_by_id(&DNS).unwrap(), 2);

        registry.unregister_by_name("b").unwrap();
        assert!(!registry.contains_id(&DNS));
        assert!(registry.is_empty());
        assert!(registry.unregister_by_name("a").is_err());
    }

    #[test]
    fn test_unsized_values() {
        let registry: ProviderRegistry<dyn Fn() -> u32 + Send + Sync> = ProviderRegistry::new();
        registry.register("f", DNS, Arc::new(|| 7));
        assert_eq!((registry.resolve_by_id(&DNS).unwrap())(), 7);
    }

    #[test]
    fn test_concurrent_register_and_lookup() {
        let registry: Arc<ProviderRegistry<u32>> = Arc::new(ProviderRegistry::new());
        let handles: Vec<_> = (0..8u32)
            .map(|i| {
                let registry = registry.clone();
                thread::spawn(move || {
                    let id = Uuid::from_u128(u128::from(i) + 1);
                    let name = format!("provider-{}", i);
                    registry.register(&name, id, Arc::new(i));
                    assert_eq!(*registry.resolve_by_name(&name).unwrap(), i);
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.len(), 8);
    }
}
