//! Provider registry with snapshot reads and per-provider health.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::capability::{Capability, CapabilitySet};
use crate::error::{DispatchError, RegistryError};
use crate::health::{HealthCell, HealthSnapshot, HealthState};
use crate::policy::Selection;
use crate::provider::{BeaconProvider, ProviderId};

/// A registered provider together with its health record.
///
/// The capability set is captured once at registration.
pub struct ProviderEntry {
    id: ProviderId,
    capabilities: CapabilitySet,
    provider: Arc<dyn BeaconProvider>,
    health: HealthCell,
}

impl ProviderEntry {
    fn new(provider: Arc<dyn BeaconProvider>) -> Self {
        Self {
            id: ProviderId::from(provider.name()),
            capabilities: provider.capabilities(),
            provider,
            health: HealthCell::new(),
        }
    }

    /// Unique id, taken from the provider's name.
    pub fn id(&self) -> &ProviderId {
        &self.id
    }

    /// Capabilities declared at registration.
    pub fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    pub fn provider(&self) -> &Arc<dyn BeaconProvider> {
        &self.provider
    }

    /// Health of this provider; shared by every call that reaches it.
    pub fn health(&self) -> &HealthCell {
        &self.health
    }

    fn is_selectable(&self, selection: Selection) -> bool {
        match (self.health.state(), selection) {
            (HealthState::Active, _) => true,
            (HealthState::Degraded, Selection::AllowDegraded) => true,
            _ => false,
        }
    }
}

impl std::fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("id", &self.id)
            .field("capabilities", &self.capabilities)
            .field("health", &self.health)
            .finish()
    }
}

/// One row of [`ProviderRegistry::health_summary`].
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub provider: ProviderId,
    pub capabilities: CapabilitySet,
    #[serde(flatten)]
    pub health: HealthSnapshot,
}

/// The full provider set, in registration order.
///
/// Reads load an immutable snapshot and never block; `add`/`remove`
/// serialize among themselves and publish a new snapshot. A call that
/// already holds a snapshot keeps using the entries it saw.
pub struct ProviderRegistry {
    entries: ArcSwap<Vec<Arc<ProviderEntry>>>,
    write_lock: Mutex<()>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Build a registry from a list of providers.
    pub fn with_providers(
        providers: impl IntoIterator<Item = Arc<dyn BeaconProvider>>,
    ) -> Result<Self, RegistryError> {
        let registry = Self::new();
        for provider in providers {
            registry.add(provider)?;
        }
        Ok(registry)
    }

    /// Register a provider at the end of the ordering.
    pub fn add(&self, provider: Arc<dyn BeaconProvider>) -> Result<ProviderId, RegistryError> {
        let entry = Arc::new(ProviderEntry::new(provider));
        let _guard = self.write_lock.lock();
        let current = self.entries.load_full();
        if current.iter().any(|e| e.id == entry.id) {
            return Err(RegistryError::Duplicate(entry.id.clone()));
        }
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(entry.clone());
        self.entries.store(Arc::new(next));
        tracing::debug!(provider = %entry.id, capabilities = ?entry.capabilities, "provider registered");
        Ok(entry.id.clone())
    }

    /// Unregister a provider. In-flight attempts against it are unaffected.
    pub fn remove(&self, id: &ProviderId) -> Option<Arc<dyn BeaconProvider>> {
        let _guard = self.write_lock.lock();
        let current = self.entries.load_full();
        let position = current.iter().position(|e| &e.id == id)?;
        let mut next: Vec<_> = current.iter().cloned().collect();
        let removed = next.remove(position);
        self.entries.store(Arc::new(next));
        tracing::debug!(provider = %id, "provider removed");
        Some(removed.provider.clone())
    }

    /// Current provider set.
    pub fn snapshot(&self) -> Arc<Vec<Arc<ProviderEntry>>> {
        self.entries.load_full()
    }

    /// Look up a registered provider by id.
    pub fn get(&self, id: &ProviderId) -> Option<Arc<ProviderEntry>> {
        self.entries.load().iter().find(|e| &e.id == id).cloned()
    }

    /// Number of registered providers.
    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    /// Returns `true` if no provider is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    /// Union of every registered provider's capabilities.
    pub fn capabilities(&self) -> CapabilitySet {
        self.entries
            .load()
            .iter()
            .fold(CapabilitySet::empty(), |acc, e| acc.union(e.capabilities))
    }

    /// Providers that support `capability` and are healthy enough for
    /// `selection`, in registration order.
    pub fn eligible(
        &self,
        capability: Capability,
        selection: Selection,
    ) -> Result<Vec<Arc<ProviderEntry>>, DispatchError> {
        let snapshot = self.entries.load();
        let capable: Vec<&Arc<ProviderEntry>> = snapshot
            .iter()
            .filter(|e| e.capabilities.supports(capability))
            .collect();
        if capable.is_empty() {
            return Err(DispatchError::NoProviders { capability });
        }
        let eligible: Vec<Arc<ProviderEntry>> = capable
            .iter()
            .filter(|e| e.is_selectable(selection))
            .map(|e| Arc::clone(*e))
            .collect();
        if eligible.is_empty() {
            return Err(DispatchError::AllProvidersDown {
                capability,
                capable: capable.len(),
            });
        }
        Ok(eligible)
    }

    /// Health of each provider, in registration order.
    pub fn health_summary(&self) -> Vec<ProviderStatus> {
        self.entries
            .load()
            .iter()
            .map(|e| ProviderStatus {
                provider: e.id.clone(),
                capabilities: e.capabilities,
                health: e.health.snapshot(),
            })
            .collect()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
