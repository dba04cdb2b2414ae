//! Device side of the delta OTA pipeline.
//!
//! [`OtaAgent`] checks for updates, downloads patch chunks over an
//! [`OtaTransport`], applies them straight into the inactive slot and hands
//! the result to the platform's [`BootControl`]. Progress is persisted after
//! every chunk so a reset device resumes where it stopped.

pub mod agent;
pub mod boot;
pub mod error;
pub mod flash;
pub mod progress;
pub mod transport;

pub use agent::{AgentConfig, AgentState, OtaAgent, SliceOutcome, Slots};
pub use boot::{BootControl, BootError, BootMode, FileBoot, SimulatedBoot, Slot, SlotImage};
pub use error::OtaError;
pub use flash::{FilePartition, MemPartition, Partition, PartitionHandle};
pub use progress::{FileProgressStore, MemProgressStore, PersistedProgress, ProgressStore};
pub use transport::{HttpTransport, OtaTransport, TransportError};
