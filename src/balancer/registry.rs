//! A registry of load-balancing policies, indexed by name.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

use crate::balancer::LbPolicyBuilder;

/// Stores policy builders for lookup by name.
pub struct PolicyRegistry {
    builders: Mutex<HashMap<String, Arc<dyn LbPolicyBuilder>>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self {
            builders: Mutex::new(HashMap::new()),
        }
    }

    /// Adds a builder to the registry, replacing any previous builder of the
    /// same name.
    pub fn add_builder(&self, builder: impl LbPolicyBuilder + 'static) {
        self.builders
            .lock()
            .unwrap()
            .insert(builder.name().to_string(), Arc::new(builder));
    }

    /// Retrieves a builder by name, or `None` if not registered.
    pub fn get_policy(&self, name: &str) -> Option<Arc<dyn LbPolicyBuilder>> {
        self.builders.lock().unwrap().get(name).cloned()
    }

    /// Whether a builder is registered under the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.builders.lock().unwrap().contains_key(name)
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide registry consulted when selecting child policies.
pub static GLOBAL_POLICY_REGISTRY: LazyLock<PolicyRegistry> = LazyLock::new(PolicyRegistry::new);
