//! Storage traits, the URI-scheme provider registry, and the in-process
//! memory provider.

pub mod memory;
pub mod traits;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

pub use traits::{
    LogStorage, SnapshotReader, SnapshotStorage, SnapshotWriter, StableStorage, StorageError,
    StorageProvider,
};

fn providers() -> &'static Mutex<HashMap<String, Arc<dyn StorageProvider>>> {
    static PROVIDERS: OnceLock<Mutex<HashMap<String, Arc<dyn StorageProvider>>>> = OnceLock::new();
    PROVIDERS.get_or_init(|| {
        let mut map: HashMap<String, Arc<dyn StorageProvider>> = HashMap::new();
        map.insert("memory".to_string(), Arc::new(memory::MemoryProvider));
        Mutex::new(map)
    })
}

/// Register a provider for a URI scheme (the part before `://`).
pub fn register_provider(scheme: &str, provider: Arc<dyn StorageProvider>) {
    providers()
        .lock()
        .unwrap()
        .insert(scheme.to_string(), provider);
}

/// Resolve the provider for a storage URI, or `None` when the scheme is
/// unknown or the URI is malformed.
pub fn find_provider(uri: &str) -> Option<Arc<dyn StorageProvider>> {
    let scheme = uri.split_once("://")?.0;
    providers().lock().unwrap().get(scheme).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_scheme_is_registered_by_default() {
        assert!(find_provider("memory://group/1/log").is_some());
    }

    #[test]
    fn unknown_scheme_is_not_found() {
        assert!(find_provider("s3://bucket/log").is_none());
        assert!(find_provider("no-scheme-at-all").is_none());
    }
}
