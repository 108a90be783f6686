//! Module-to-library version resolution.
//!
//! The registry maps package keys to version strings; applications seed it
//! at startup with whatever they want reported alongside frames. Lookups
//! walk a module path from most to least specific, so `app::web::handlers`
//! resolves through `app::web` to `app`.

use std::collections::{BTreeMap, HashMap, HashSet};

/// Known package versions, keyed the way frame modules are prefixed.
#[derive(Debug, Clone, Default)]
pub struct VersionRegistry {
    by_key: HashMap<String, String>,
}

impl VersionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a package version.
    pub fn insert(&mut self, key: impl Into<String>, version: impl Into<String>) {
        self.by_key.insert(key.into(), version.into());
    }

    /// Look up one key exactly.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.by_key.get(key).map(String::as_str)
    }

    /// Resolve versions for a list of frame modules.
    ///
    /// Each module is tried as given, then with trailing `::` components
    /// stripped one at a time until a registry hit or an atomic name.
    /// Modules already checked within this call are not resolved twice.
    pub fn lookup_versions<'a, I>(&self, modules: I) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut found = BTreeMap::new();
        let mut checked = HashSet::new();
        for module in modules {
            if !checked.insert(module) {
                continue;
            }
            let mut name = module;
            loop {
                if let Some(version) = self.by_key.get(name) {
                    found.insert(name.to_string(), version.clone());
                    break;
                }
                match name.rfind("::") {
                    Some(split) => name = &name[..split],
                    None => break,
                }
            }
        }
        found
    }
}
