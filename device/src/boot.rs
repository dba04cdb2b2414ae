use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Number of unconfirmed boots of a candidate before the loader falls back.
pub const DEFAULT_MAX_BOOT_ATTEMPTS: u32 = 3;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn other(self) -> Self {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    /// Running firmware is the confirmed default.
    Normal,
    /// Running a marked candidate that has not been confirmed yet.
    Provisional,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SlotImage {
    pub version: String,
    pub len: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("slot {0:?} is running and cannot be marked")]
    ActiveSlot(Slot),
    #[error("slot {0:?} holds no image")]
    EmptySlot(Slot),
    #[error("boot record i/o")]
    Io(#[from] io::Error),
    #[error("corrupt boot record")]
    Corrupt(#[from] serde_json::Error),
    #[error("boot record lock poisoned")]
    Poisoned,
}

/// Dual slot boot capability provided by the platform.
///
/// A candidate marked with [`BootControl::mark_candidate`] is booted on the
/// next reset. Unless [`BootControl::confirm_valid`] is called from within
/// that candidate, the platform reverts to the previous slot after a bounded
/// number of boot attempts. Callers must only confirm after the new firmware
/// has shown it works at the application level.
pub trait BootControl: Send {
    fn active(&self) -> Result<Slot, BootError>;
    fn mode(&self) -> Result<BootMode, BootError>;
    fn image(&self, slot: Slot) -> Result<Option<SlotImage>, BootError>;
    fn mark_candidate(&mut self, slot: Slot, image: SlotImage) -> Result<(), BootError>;
    fn confirm_valid(&mut self) -> Result<(), BootError>;
}

/// Boot loader state. Shared by the in-memory and file backed boot
/// controls; [`BootRecord::power_on`] plays the part of the loader.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BootRecord {
    pub active: Slot,
    pub slot_a: Option<SlotImage>,
    pub slot_b: Option<SlotImage>,
    pub candidate: Option<Slot>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub provisional: bool,
    pub confirmations: u32,
    pub reverts: u32,
}

impl BootRecord {
    pub fn new(image: SlotImage) -> Self {
        Self {
            active: Slot::A,
            slot_a: Some(image),
            slot_b: None,
            candidate: None,
            attempts: 0,
            max_attempts: DEFAULT_MAX_BOOT_ATTEMPTS,
            provisional: false,
            confirmations: 0,
            reverts: 0,
        }
    }

    pub fn image(&self, slot: Slot) -> Option<&SlotImage> {
        match slot {
            Slot::A => self.slot_a.as_ref(),
            Slot::B => self.slot_b.as_ref(),
        }
    }

    fn set_image(&mut self, slot: Slot, image: SlotImage) {
        match slot {
            Slot::A => self.slot_a = Some(image),
            Slot::B => self.slot_b = Some(image),
        }
    }

    pub fn mode(&self) -> BootMode {
        if self.provisional {
            BootMode::Provisional
        } else {
            BootMode::Normal
        }
    }

    pub fn mark_candidate(&mut self, slot: Slot, image: SlotImage) -> Result<(), BootError> {
        if slot == self.active {
            return Err(BootError::ActiveSlot(slot));
        }
        log::info!("Marking slot {:?} ({}) as boot candidate", slot, image.version);
        self.set_image(slot, image);
        self.candidate = Some(slot);
        self.attempts = 0;
        Ok(())
    }

    pub fn confirm_valid(&mut self) {
        if !self.provisional {
            return;
        }
        log::info!("Slot {:?} confirmed", self.active);
        self.candidate = None;
        self.provisional = false;
        self.attempts = 0;
        self.confirmations += 1;
    }

    /// Simulated reset: boots the candidate while attempts remain, otherwise
    /// falls back to the slot the candidate replaced.
    pub fn power_on(&mut self) {
        match self.candidate {
            Some(candidate) if self.attempts < self.max_attempts => {
                self.attempts += 1;
                self.active = candidate;
                self.provisional = true;
                log::info!(
                    "Booting candidate slot {:?}, attempt {}/{}",
                    candidate,
                    self.attempts,
                    self.max_attempts
                );
            }
            Some(candidate) => {
                log::warn!(
                    "Slot {:?} not confirmed after {} boots, reverting",
                    candidate,
                    self.attempts
                );
                self.active = candidate.other();
                self.candidate = None;
                self.provisional = false;
                self.attempts = 0;
                self.reverts += 1;
            }
            None => {
                self.provisional = false;
            }
        }
    }
}

/// In-memory boot control for tests. Clones share one record, so the
/// record outlives the agent across simulated resets.
#[derive(Clone)]
pub struct SimulatedBoot {
    record: Arc<Mutex<BootRecord>>,
}

impl SimulatedBoot {
    pub fn new(image: SlotImage) -> Self {
        Self {
            record: Arc::new(Mutex::new(BootRecord::new(image))),
        }
    }

    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        if let Ok(mut record) = self.record.lock() {
            record.max_attempts = max_attempts;
        }
        self
    }

    pub fn record(&self) -> Result<BootRecord, BootError> {
        Ok(self.record.lock().map_err(|_| BootError::Poisoned)?.clone())
    }

    pub fn power_on(&self) -> Result<(), BootError> {
        self.record.lock().map_err(|_| BootError::Poisoned)?.power_on();
        Ok(())
    }

    fn with<R>(&self, f: impl FnOnce(&mut BootRecord) -> R) -> Result<R, BootError> {
        let mut record = self.record.lock().map_err(|_| BootError::Poisoned)?;
        Ok(f(&mut record))
    }
}

impl BootControl for SimulatedBoot {
    fn active(&self) -> Result<Slot, BootError> {
        self.with(|r| r.active)
    }

    fn mode(&self) -> Result<BootMode, BootError> {
        self.with(|r| r.mode())
    }

    fn image(&self, slot: Slot) -> Result<Option<SlotImage>, BootError> {
        self.with(|r| r.image(slot).cloned())
    }

    fn mark_candidate(&mut self, slot: Slot, image: SlotImage) -> Result<(), BootError> {
        self.with(|r| r.mark_candidate(slot, image))?
    }

    fn confirm_valid(&mut self) -> Result<(), BootError> {
        self.with(|r| r.confirm_valid())
    }
}

/// Boot record kept as a JSON file and rewritten atomically.
#[derive(Clone)]
pub struct FileBoot {
    path: PathBuf,
}

impl FileBoot {
    /// Opens the record at `path`, creating it with `initial` in slot A if
    /// it does not exist yet. Returns whether it was created.
    pub fn open(path: &Path, initial: SlotImage) -> Result<(Self, bool), BootError> {
        let boot = Self {
            path: path.to_path_buf(),
        };
        if path.exists() {
            return Ok((boot, false));
        }
        boot.store(&BootRecord::new(initial))?;
        Ok((boot, true))
    }

    pub fn load(&self) -> Result<BootRecord, BootError> {
        let data = std::fs::read(&self.path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn store(&self, record: &BootRecord) -> Result<(), BootError> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(&serde_json::to_vec_pretty(record)?)?;
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn power_on(&self) -> Result<BootRecord, BootError> {
        let mut record = self.load()?;
        record.power_on();
        self.store(&record)?;
        Ok(record)
    }

    fn update<R>(&self, f: impl FnOnce(&mut BootRecord) -> R) -> Result<R, BootError> {
        let mut record = self.load()?;
        let result = f(&mut record);
        self.store(&record)?;
        Ok(result)
    }
}

impl BootControl for FileBoot {
    fn active(&self) -> Result<Slot, BootError> {
        Ok(self.load()?.active)
    }

    fn mode(&self) -> Result<BootMode, BootError> {
        Ok(self.load()?.mode())
    }

    fn image(&self, slot: Slot) -> Result<Option<SlotImage>, BootError> {
        Ok(self.load()?.image(slot).cloned())
    }

    fn mark_candidate(&mut self, slot: Slot, image: SlotImage) -> Result<(), BootError> {
        self.update(|r| r.mark_candidate(slot, image))?
    }

    fn confirm_valid(&mut self) -> Result<(), BootError> {
        self.update(|r| r.confirm_valid())
    }
}
