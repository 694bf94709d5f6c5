use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;
use tracing::warn;

use super::config::ConfigurationError;
use super::config::FormField;
use super::config::PairingConfig;
use super::config::PairingForm;
use super::config::PairingId;
use super::controller::PairingController;
use super::controller::WaitPolicy;
use super::device::DeviceDirectory;
use super::device::DeviceHost;
use super::entity::PairingEntity;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("pairing not found: {0}")]
    NotFound(PairingId),

    #[error("pairing already exists: {0}")]
    DuplicateId(PairingId),
}

/// Creates, reconfigures and removes pairings against one host.
///
/// Device identifiers are fixed once a pairing exists; reconfiguration may
/// change the name and the tunables only.
pub struct PairingRegistry<D> {
    devices: Arc<D>,
    policy: WaitPolicy,
    entries: RwLock<BTreeMap<PairingId, Arc<PairingEntity<D>>>>,
}

impl<D: DeviceHost> PairingRegistry<D> {
    pub fn new(devices: Arc<D>, policy: WaitPolicy) -> Self {
        Self {
            devices,
            policy,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Validate `form` and publish a new, activated pairing.
    pub async fn create(
        &self,
        id: PairingId,
        form: &PairingForm,
    ) -> Result<Arc<PairingEntity<D>>, RegistryError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }

        let directory: &dyn DeviceDirectory = self.devices.as_ref();
        let config = form.validate(id.clone(), Some(directory))?;
        info!(
            pairing = %id,
            physical = %config.physical_device,
            smart = %config.smart_device,
            "creating pairing '{}'",
            config.name
        );

        let controller = Arc::new(PairingController::new(
            config,
            self.devices.clone(),
            self.policy,
        ));
        let entity = Arc::new(PairingEntity::new(controller, self.devices.clone()));
        if let Err(e) = entity.activate().await {
            // The entity stays subscribed and picks up the state on the next change
            warn!(pairing = %id, "initial state refresh failed: {}", e);
        }

        entries.insert(id, entity.clone());
        Ok(entity)
    }

    /// Apply an edited form to an existing pairing.
    pub async fn reconfigure(
        &self,
        id: &PairingId,
        form: &PairingForm,
    ) -> Result<Arc<PairingConfig>, RegistryError> {
        let entity = self
            .get(id)
            .await
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        let current = entity.config();

        let directory: &dyn DeviceDirectory = self.devices.as_ref();
        let config = form.validate(id.clone(), Some(directory))?;
        if config.physical_device != current.physical_device {
            return Err(ConfigurationError::new(
                FormField::PhysicalDevice,
                "cannot be changed after creation",
            )
            .into());
        }
        if config.smart_device != current.smart_device {
            return Err(ConfigurationError::new(
                FormField::SmartDevice,
                "cannot be changed after creation",
            )
            .into());
        }

        entity.controller().reconfigure(config);
        Ok(entity.config())
    }

    pub async fn remove(&self, id: &PairingId) -> Result<(), RegistryError> {
        let entity = self
            .entries
            .write()
            .await
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        entity.deactivate();
        info!(pairing = %id, "removed pairing");
        Ok(())
    }

    pub async fn get(&self, id: &PairingId) -> Option<Arc<PairingEntity<D>>> {
        self.entries.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Arc<PairingEntity<D>>> {
        self.entries.read().await.values().cloned().collect()
    }

    /// Deactivate every pairing.
    pub async fn shutdown(&self) {
        let mut entries = self.entries.write().await;
        for entity in entries.values() {
            entity.deactivate();
        }
        entries.clear();
    }
}
