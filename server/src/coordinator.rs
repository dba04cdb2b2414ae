use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use ota_schema::{
    CheckResponse, DeviceOtaProgress, FleetStatus, OtaState, Outcome, PatchId, PatchMetadata,
};
use tokio::sync::RwLock;

use crate::generator::GeneratorError;
use crate::patches::{CatalogError, PatchCatalog};
use crate::registry::{FirmwareRegistry, RegistryError};

const REVERTED: &str = "device reverted to previous firmware";
const CONFIRM_TIMEOUT: &str = "no confirmation within grace window";
const UNSPECIFIED: &str = "failure reported without reason";

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    /// How long a device may stay in PENDING_CONFIRM before reports treat
    /// it as rolled back.
    pub confirm_grace: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            confirm_grace: Duration::hours(24),
        }
    }
}

type ProgressKey = (String, PatchId);

/// Decides which patch a device should run and keeps an advisory record of
/// how each device is getting on. The records are observability only: the
/// device is the authority on what it has written, so losing them on
/// restart is harmless.
pub struct UpdateCoordinator {
    registry: Arc<FirmwareRegistry>,
    catalog: Arc<PatchCatalog>,
    config: CoordinatorConfig,
    progress: RwLock<HashMap<ProgressKey, DeviceOtaProgress>>,
}

impl UpdateCoordinator {
    pub fn new(
        registry: Arc<FirmwareRegistry>,
        catalog: Arc<PatchCatalog>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            registry,
            catalog,
            config,
            progress: RwLock::new(HashMap::new()),
        }
    }

    pub async fn check(
        &self,
        device_id: &str,
        current_version: &str,
    ) -> Result<CheckResponse, CatalogError> {
        let target = match self.registry.get_current().await {
            Ok(target) => target,
            Err(RegistryError::NoCurrentVersion) => return Ok(CheckResponse::up_to_date()),
            Err(e) => return Err(e.into()),
        };
        if target.version == current_version {
            return Ok(CheckResponse::up_to_date());
        }

        let patch = match self
            .catalog
            .find_or_generate(current_version, &target.version)
            .await
        {
            Ok(patch) => patch,
            Err(CatalogError::Registry(RegistryError::NotFound(version))) => {
                log::warn!(
                    "Device {} runs unregistered firmware {}, no patch possible",
                    device_id,
                    version
                );
                return Ok(CheckResponse::up_to_date());
            }
            Err(CatalogError::Generator(GeneratorError::DiffTooLarge { size, limit })) => {
                log::warn!(
                    "No delta for device {} from {} to {}: {} bytes over {} limit",
                    device_id,
                    current_version,
                    target.version,
                    size,
                    limit
                );
                return Ok(CheckResponse::up_to_date());
            }
            Err(e) => return Err(e),
        };

        let mut progress = self.progress.write().await;
        let row = progress
            .entry((device_id.to_string(), patch.id.clone()))
            .or_insert_with(|| Self::new_row(device_id, &patch.id));
        match row.state {
            OtaState::None => {
                log::info!(
                    "Offering {} to device {} ({} chunks)",
                    patch.id,
                    device_id,
                    patch.chunk_count
                );
                Self::transition(row, OtaState::Checking, None);
            }
            OtaState::RolledBack => {
                log::info!("Re-offering {} to device {}", patch.id, device_id);
                let reason = row.reason.take();
                Self::transition(row, OtaState::Checking, reason);
            }
            _ => {}
        }

        Ok(CheckResponse::update(&patch))
    }

    /// Advances the record only when `index` is exactly the next expected
    /// chunk, so duplicates and stale requests never move it backwards. A
    /// download can only begin from a row that is idle, freshly offered or
    /// rolled back; requests against applied or confirmed rows are ignored.
    pub async fn record_chunk_progress(&self, device_id: &str, patch: &PatchMetadata, index: u32) {
        let mut progress = self.progress.write().await;
        let row = progress
            .entry((device_id.to_string(), patch.id.clone()))
            .or_insert_with(|| Self::new_row(device_id, &patch.id));

        match row.state {
            OtaState::Downloading => {}
            // The device resumes where its own record says.
            OtaState::None | OtaState::Checking => {
                row.next_expected_chunk_index = index;
                row.bytes_written = Self::written(patch, index);
                Self::transition(row, OtaState::Downloading, None);
            }
            OtaState::RolledBack if index == 0 => {
                row.next_expected_chunk_index = 0;
                row.bytes_written = 0;
                let reason = row.reason.take();
                Self::transition(row, OtaState::Downloading, reason);
            }
            _ => {
                log::debug!(
                    "Ignoring chunk {} of {} from device {} in state {:?}",
                    index,
                    patch.id,
                    device_id,
                    row.state
                );
                return;
            }
        }

        if index != row.next_expected_chunk_index {
            log::debug!(
                "Device {} requested chunk {} of {}, expected {}",
                device_id,
                index,
                patch.id,
                row.next_expected_chunk_index
            );
            return;
        }

        row.next_expected_chunk_index += 1;
        row.bytes_written = Self::written(patch, row.next_expected_chunk_index);
        row.last_update = Utc::now();
        if row.next_expected_chunk_index >= patch.chunk_count {
            log::info!("Device {} downloaded all of {}", device_id, patch.id);
            Self::transition(row, OtaState::Applying, None);
        }
    }

    pub async fn complete(
        &self,
        device_id: &str,
        patch_id: &PatchId,
        outcome: Outcome,
        reason: Option<String>,
    ) {
        let mut progress = self.progress.write().await;
        let row = progress
            .entry((device_id.to_string(), patch_id.clone()))
            .or_insert_with(|| Self::new_row(device_id, patch_id));
        match outcome {
            Outcome::Success if row.state == OtaState::Confirmed => {
                log::debug!("Device {} re-sent success for {}", device_id, patch_id);
            }
            Outcome::Success => {
                log::info!(
                    "Device {} applied {}, awaiting confirmation",
                    device_id,
                    patch_id
                );
                Self::transition(row, OtaState::PendingConfirm, None);
            }
            Outcome::Failure => {
                let reason = reason
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or_else(|| UNSPECIFIED.to_string());
                log::warn!(
                    "Device {} failed to apply {}: {}",
                    device_id,
                    patch_id,
                    reason
                );
                row.consecutive_failure_count += 1;
                Self::transition(row, OtaState::RolledBack, Some(reason));
            }
        }
    }

    /// Heartbeat from a device: settles pending confirmations against the
    /// version it now reports, then runs the regular update check.
    pub async fn heartbeat(
        &self,
        device_id: &str,
        version: &str,
    ) -> Result<CheckResponse, CatalogError> {
        {
            let mut progress = self.progress.write().await;
            for ((device, patch_id), row) in progress.iter_mut() {
                if device != device_id || row.state != OtaState::PendingConfirm {
                    continue;
                }
                let Some((from, to)) = patch_id.versions() else {
                    continue;
                };
                if version == to {
                    log::info!("Device {} confirmed {}", device_id, to);
                    row.consecutive_failure_count = 0;
                    Self::transition(row, OtaState::Confirmed, None);
                } else if version == from {
                    log::warn!(
                        "Device {} is back on {} after applying {}",
                        device_id,
                        from,
                        patch_id
                    );
                    row.consecutive_failure_count += 1;
                    Self::transition(row, OtaState::RolledBack, Some(REVERTED.to_string()));
                }
            }
        }
        self.check(device_id, version).await
    }

    pub async fn device_status(&self, device_id: &str) -> Vec<DeviceOtaProgress> {
        let now = Utc::now();
        let progress = self.progress.read().await;
        let mut rows: Vec<_> = progress
            .values()
            .filter(|row| row.device_id == device_id)
            .map(|row| self.effective(row, now))
            .collect();
        rows.sort_by(|a, b| a.last_update.cmp(&b.last_update));
        rows
    }

    pub async fn fleet_status(&self) -> FleetStatus {
        self.fleet_status_at(Utc::now()).await
    }

    /// Fleet view as of `now`. Devices stuck in PENDING_CONFIRM past the
    /// grace window are reported as rolled back; the stored row is left
    /// alone so a late confirmation still lands.
    pub async fn fleet_status_at(&self, now: DateTime<Utc>) -> FleetStatus {
        let progress = self.progress.read().await;
        let mut devices: Vec<_> = progress.values().map(|row| self.effective(row, now)).collect();
        devices.sort_by(|a, b| {
            a.device_id
                .cmp(&b.device_id)
                .then_with(|| a.patch_id.cmp(&b.patch_id))
        });
        let mut counts = BTreeMap::new();
        for row in devices.iter() {
            *counts.entry(row.state).or_insert(0) += 1;
        }
        FleetStatus { devices, counts }
    }

    fn effective(&self, row: &DeviceOtaProgress, now: DateTime<Utc>) -> DeviceOtaProgress {
        let mut row = row.clone();
        if row.state == OtaState::PendingConfirm && now - row.last_update > self.config.confirm_grace
        {
            row.state = OtaState::RolledBack;
            row.reason = Some(CONFIRM_TIMEOUT.to_string());
        }
        row
    }

    fn written(patch: &PatchMetadata, chunks: u32) -> u64 {
        core::cmp::min(chunks as u64 * patch.chunk_size as u64, patch.size)
    }

    fn new_row(device_id: &str, patch_id: &PatchId) -> DeviceOtaProgress {
        DeviceOtaProgress {
            device_id: device_id.to_string(),
            patch_id: patch_id.clone(),
            state: OtaState::None,
            next_expected_chunk_index: 0,
            bytes_written: 0,
            consecutive_failure_count: 0,
            last_update: Utc::now(),
            reason: None,
        }
    }

    fn transition(row: &mut DeviceOtaProgress, state: OtaState, reason: Option<String>) {
        log::debug!(
            "Device {} patch {}: {:?} -> {:?}",
            row.device_id,
            row.patch_id,
            row.state,
            state
        );
        row.state = state;
        row.reason = reason;
        row.last_update = Utc::now();
    }
}
