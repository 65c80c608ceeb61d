//! Active finder selection
//!
//! A [`FinderRegistry`] owns the finder every lookup in a process goes
//! through. It starts on a [`ManualFinder`] and can be switched exactly once
//! to a registry-backed finder. That finder is built lazily on first use and
//! memoized, so concurrent callers always observe the same instance.

use crate::client::RegistryClient;
use crate::consul::ConsulConfig;
use crate::finder::{ManualFinder, ServiceFinder};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

type FinderFactory = Box<dyn Fn() -> Arc<dyn ServiceFinder> + Send + Sync>;

/// Handle to the active [`ServiceFinder`]
pub struct FinderRegistry {
    active: RwLock<Arc<dyn ServiceFinder>>,
    manual: Arc<ManualFinder>,
    registry: OnceCell<Arc<dyn ServiceFinder>>,
    factory: FinderFactory,
    switched: AtomicBool,
}

impl fmt::Debug for FinderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinderRegistry")
            .field("active", &self.active.read().name())
            .field("registry_constructed", &self.registry.get().is_some())
            .field("switched", &self.switched.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for FinderRegistry {
    fn default() -> Self {
        Self::consul_with(ConsulConfig::default)
    }
}

impl FinderRegistry {
    /// Manual finder active, Consul-backed finder available on demand
    pub fn new(config: ConsulConfig) -> Self {
        Self::consul_with(move || config.clone())
    }

    /// Like [`FinderRegistry::new`], with the configuration resolved only
    /// when the Consul-backed finder is first constructed
    pub fn consul_with<F>(config: F) -> Self
    where
        F: Fn() -> ConsulConfig + Send + Sync + 'static,
    {
        Self::with_factory(move || Arc::new(RegistryClient::consul(config())) as Arc<dyn ServiceFinder>)
    }

    /// Manual finder active, `factory` builds the registry-backed finder
    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn() -> Arc<dyn ServiceFinder> + Send + Sync + 'static,
    {
        let manual = Arc::new(ManualFinder::new());
        Self {
            active: RwLock::new(manual.clone() as Arc<dyn ServiceFinder>),
            manual,
            registry: OnceCell::new(),
            factory: Box::new(factory),
            switched: AtomicBool::new(false),
        }
    }

    /// The finder currently in effect
    pub fn current(&self) -> Arc<dyn ServiceFinder> {
        self.active.read().clone()
    }

    /// The static finder, for adding routes
    pub fn manual(&self) -> &Arc<ManualFinder> {
        &self.manual
    }

    /// The registry-backed finder, constructed on first call
    pub fn registry_finder(&self) -> Arc<dyn ServiceFinder> {
        let finder = self.registry.get_or_init(|| {
            let finder = (self.factory)();
            info!(finder = %finder.name(), "Constructed registry-backed finder");
            finder
        });
        Arc::clone(finder)
    }

    /// Make the registry-backed finder the active one. Irreversible.
    pub fn use_registry(&self) {
        let finder = self.registry_finder();
        let mut active = self.active.write();
        if !self.switched.swap(true, Ordering::SeqCst) {
            info!(finder = %finder.name(), "Switched active finder to registry");
            *active = finder;
        }
    }

    /// Whether [`FinderRegistry::use_registry`] has run
    pub fn is_registry_active(&self) -> bool {
        self.switched.load(Ordering::SeqCst)
    }
}
