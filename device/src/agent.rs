use std::time::Duration;

use ota_patch::StreamingPatch;
use ota_schema::{CheckResponse, ContentHasher, Outcome, OutcomeReport, PatchId, UpdateOffer};

use crate::boot::{BootControl, BootError, BootMode, Slot, SlotImage};
use crate::error::OtaError;
use crate::flash::{ImageView, PartitionHandle};
use crate::progress::{PersistedProgress, ProgressStore};
use crate::transport::{OtaTransport, TransportError};

const REVERTED: &str = "reverted to previous firmware by boot loader";
const MAX_QUEUED_REPORTS: usize = 8;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    max_chunk_retries: u32,
    max_patch_failures: u32,
    chunks_per_slice: u32,
    chunk_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            max_chunk_retries: 3,
            max_patch_failures: 3,
            chunks_per_slice: 16,
            chunk_timeout: Duration::from_secs(30),
        }
    }
}

impl AgentConfig {
    /// Extra attempts for a chunk that times out or fails its checksum.
    pub fn set_max_chunk_retries(self, max_chunk_retries: u32) -> Self {
        Self {
            max_chunk_retries,
            ..self
        }
    }

    /// Failed attempts at one patch before it is abandoned.
    pub fn set_max_patch_failures(self, max_patch_failures: u32) -> Self {
        Self {
            max_patch_failures: max_patch_failures.max(1),
            ..self
        }
    }

    pub fn set_chunks_per_slice(self, chunks_per_slice: u32) -> Self {
        Self {
            chunks_per_slice: chunks_per_slice.max(1),
            ..self
        }
    }

    pub fn set_chunk_timeout(self, chunk_timeout: Duration) -> Self {
        Self {
            chunk_timeout,
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Checking,
    Downloading,
    Verifying,
    Applying,
    RebootPending,
    Provisional,
    Confirmed,
}

/// What a slice of radio time achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliceOutcome {
    UpToDate,
    InProgress { next: u32, chunk_count: u32 },
    /// Candidate installed and marked; the caller should reset the device.
    RebootRequired,
    /// Running unconfirmed firmware, no update work until it is confirmed.
    AwaitingConfirmation,
    Abandoned(PatchId),
}

/// Partitions the agent works with.
#[derive(Clone)]
pub struct Slots {
    pub a: PartitionHandle,
    pub b: PartitionHandle,
    /// Raw patch chunks, kept so a download can be replayed after a reset.
    pub staging: PartitionHandle,
}

impl Slots {
    pub fn get(&self, slot: Slot) -> &PartitionHandle {
        match slot {
            Slot::A => &self.a,
            Slot::B => &self.b,
        }
    }
}

struct Session {
    progress: PersistedProgress,
    candidate: Slot,
    patch: StreamingPatch<ImageView, PartitionHandle>,
    hasher: ContentHasher,
}

enum Checked {
    Start(Session),
    Done(SliceOutcome),
}

/// Device side update state machine.
///
/// The agent never runs for long: [`OtaAgent::run_slice`] does a bounded
/// amount of work and returns, so the caller can hand the radio back to
/// other duties. Every chunk is staged, applied and recorded durably before
/// the next one is requested, which lets a reset device resume exactly
/// where it stopped.
pub struct OtaAgent<T, B, P> {
    transport: T,
    boot: B,
    store: P,
    slots: Slots,
    config: AgentConfig,
    state: AgentState,
    session: Option<Session>,
    /// Answer to the last heartbeat, used by the next slice in place of a
    /// separate check.
    offer: Option<CheckResponse>,
}

impl<T, B, P> OtaAgent<T, B, P>
where
    T: OtaTransport,
    B: BootControl,
    P: ProgressStore,
{
    /// Brings the agent up after a boot, settling any update that was
    /// installed before the reset.
    pub async fn start(
        transport: T,
        boot: B,
        store: P,
        slots: Slots,
        config: AgentConfig,
    ) -> Result<Self, OtaError> {
        let mut agent = Self {
            transport,
            boot,
            store,
            slots,
            config,
            state: AgentState::Idle,
            session: None,
            offer: None,
        };
        agent.reconcile().await?;
        agent.flush_reports().await?;
        Ok(agent)
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn current_version(&self) -> Result<String, OtaError> {
        let active = self.boot.active()?;
        let image = self.boot.image(active)?.ok_or(BootError::EmptySlot(active))?;
        Ok(image.version)
    }

    async fn reconcile(&mut self) -> Result<(), OtaError> {
        let version = self.current_version()?;
        if self.boot.mode()? == BootMode::Provisional {
            log::info!("Running provisional firmware {}", version);
            self.state = AgentState::Provisional;
            return Ok(());
        }

        let progress = match self.store.load()? {
            Some(progress) if progress.installed => progress,
            _ => return Ok(()),
        };
        if progress.target_version == version {
            log::debug!("Firmware {} already confirmed, clearing progress", version);
            self.store.clear()?;
            self.state = AgentState::Confirmed;
        } else {
            log::warn!(
                "Firmware {} did not take, running {}",
                progress.target_version,
                version
            );
            let mut progress = progress;
            progress.restart();
            self.record_failure(progress, REVERTED.to_string()).await?;
        }
        Ok(())
    }

    /// Sends a heartbeat. A delivered heartbeat proves the firmware can
    /// reach the service and counts as an application milestone. Queued
    /// outcome reports go out first so the service learns of an install
    /// before the heartbeat that confirms it.
    pub async fn heartbeat(&mut self) -> Result<CheckResponse, OtaError> {
        self.flush_reports().await?;
        let version = self.current_version()?;
        let response = self.transport.heartbeat(&version).await?;
        self.milestone()?;
        self.offer = Some(response.clone());
        Ok(response)
    }

    /// Signals application level success of the running firmware. This is
    /// the only path that confirms a provisional boot.
    pub fn milestone(&mut self) -> Result<(), OtaError> {
        if self.state != AgentState::Provisional {
            return Ok(());
        }
        self.boot.confirm_valid()?;
        self.store.clear()?;
        self.state = AgentState::Confirmed;
        log::info!("Firmware {} confirmed", self.current_version()?);
        Ok(())
    }

    /// Runs one bounded step of the update: check, up to `chunks_per_slice`
    /// chunks, and once everything is in, verification and install.
    pub async fn run_slice(&mut self) -> Result<SliceOutcome, OtaError> {
        let heartbeat = self.offer.take();
        self.flush_reports().await?;
        match self.state {
            AgentState::Provisional => return Ok(SliceOutcome::AwaitingConfirmation),
            AgentState::RebootPending => return Ok(SliceOutcome::RebootRequired),
            _ => {}
        }

        // An in-flight download is finished before the service is asked
        // again, even if the current release moves on meanwhile.
        let mut session = match self.session.take() {
            Some(session) => session,
            None => match self.check(heartbeat).await? {
                Checked::Start(session) => session,
                Checked::Done(outcome) => return Ok(outcome),
            },
        };
        self.state = AgentState::Downloading;

        match self.download(&mut session).await {
            Ok(()) => {}
            Err(e @ OtaError::Transport(_)) => {
                log::info!(
                    "Download of {} paused at chunk {}: {}",
                    session.progress.patch_id,
                    session.progress.next_expected_chunk_index,
                    e
                );
                self.session = Some(session);
                return Err(e);
            }
            Err(e) => {
                return Err(self.fail(session.progress, session.candidate, e).await);
            }
        }

        if !session.progress.is_complete() {
            let outcome = SliceOutcome::InProgress {
                next: session.progress.next_expected_chunk_index,
                chunk_count: session.progress.chunk_count,
            };
            self.session = Some(session);
            return Ok(outcome);
        }

        let progress = session.progress.clone();
        let candidate = session.candidate;
        match self.install(session).await {
            Ok(()) => Ok(SliceOutcome::RebootRequired),
            Err(e) => Err(self.fail(progress, candidate, e).await),
        }
    }

    async fn check(&mut self, heartbeat: Option<CheckResponse>) -> Result<Checked, OtaError> {
        self.state = AgentState::Checking;
        let result = self.check_inner(heartbeat).await;
        if !matches!(result, Ok(Checked::Start(_))) {
            self.state = AgentState::Idle;
        }
        result
    }

    async fn check_inner(&mut self, heartbeat: Option<CheckResponse>) -> Result<Checked, OtaError> {
        let response = match heartbeat {
            Some(response) => response,
            None => {
                let version = self.current_version()?;
                self.transport.check(&version).await?
            }
        };
        let offer = match response.offer() {
            Some(offer) => offer,
            None => {
                if let Some(stale) = self.store.load()? {
                    log::info!("Dropping progress for {}, no longer offered", stale.patch_id);
                    self.store.clear()?;
                }
                return Ok(Checked::Done(SliceOutcome::UpToDate));
            }
        };

        let progress = match self.store.load()? {
            Some(progress) if progress.matches(&offer) => {
                if progress.abandoned {
                    log::debug!("Ignoring abandoned patch {}", progress.patch_id);
                    return Ok(Checked::Done(SliceOutcome::Abandoned(progress.patch_id)));
                }
                progress
            }
            Some(progress) => {
                log::info!(
                    "Offer moved from {} to {}, discarding progress",
                    progress.patch_id,
                    offer.patch_id
                );
                PersistedProgress::new(&offer)
            }
            None => PersistedProgress::new(&offer),
        };
        Ok(Checked::Start(self.open_session(progress, &offer)?))
    }

    fn open_session(
        &mut self,
        mut progress: PersistedProgress,
        offer: &UpdateOffer,
    ) -> Result<Session, OtaError> {
        if progress.patch_size > self.slots.staging.capacity()? {
            return Err(OtaError::Storage(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("patch {} does not fit the staging partition", offer.patch_id),
            )));
        }

        if progress.next_expected_chunk_index > 0 {
            match self.replay(&progress) {
                Ok(session)
                    if session.patch.written() == progress.candidate_partition_write_offset =>
                {
                    log::info!(
                        "Resuming {} at chunk {}/{}",
                        progress.patch_id,
                        progress.next_expected_chunk_index,
                        progress.chunk_count
                    );
                    return Ok(session);
                }
                Ok(session) => log::warn!(
                    "Replayed {} bytes of {} but {} were recorded, restarting",
                    session.patch.written(),
                    progress.patch_id,
                    progress.candidate_partition_write_offset
                ),
                Err(e) => log::warn!("Unable to replay {}: {}, restarting", progress.patch_id, e),
            }
            progress.restart();
        }
        self.store.save(&progress)?;

        log::info!(
            "Starting download of {} ({} chunks, {} bytes)",
            progress.patch_id,
            progress.chunk_count,
            progress.patch_size
        );
        self.new_session(progress)
    }

    fn new_session(&self, progress: PersistedProgress) -> Result<Session, OtaError> {
        let active = self.boot.active()?;
        let image = self.boot.image(active)?.ok_or(BootError::EmptySlot(active))?;
        let candidate = active.other();
        let target = self.slots.get(candidate).clone();
        target.erase()?;
        let source = ImageView::new(self.slots.get(active).clone(), image.len);
        Ok(Session {
            progress,
            candidate,
            patch: StreamingPatch::new(source, target),
            hasher: ContentHasher::new(),
        })
    }

    /// Rebuilds the applier from the staged chunks, without using the radio.
    fn replay(&self, progress: &PersistedProgress) -> Result<Session, OtaError> {
        if progress.next_expected_chunk_index > progress.chunk_count {
            return Err(OtaError::Storage(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "recorded chunk index past end of patch",
            )));
        }
        let mut session = self.new_session(progress.clone())?;
        let mut buf = vec![0u8; progress.chunk_size as usize];
        for index in 0..progress.next_expected_chunk_index {
            let chunk = &mut buf[..progress.chunk_len(index)];
            self.slots
                .staging
                .read_at(index as u64 * progress.chunk_size as u64, chunk)?;
            session.patch.feed(chunk)?;
            session.hasher.update(chunk);
        }
        Ok(session)
    }

    async fn download(&mut self, session: &mut Session) -> Result<(), OtaError> {
        let mut fetched = 0;
        while !session.progress.is_complete() && fetched < self.config.chunks_per_slice {
            let index = session.progress.next_expected_chunk_index;
            let payload = self.fetch(&session.progress, index).await?;
            self.commit(session, index, &payload)?;
            fetched += 1;
        }
        Ok(())
    }

    async fn fetch(&self, progress: &PersistedProgress, index: u32) -> Result<Vec<u8>, OtaError> {
        let expected = progress.chunk_len(index);
        let attempts = self.config.max_chunk_retries + 1;
        let mut last = OtaError::Transport(TransportError::Timeout);
        for attempt in 1..=attempts {
            let request = self.transport.get_chunk(&progress.patch_id, index);
            match tokio::time::timeout(self.config.chunk_timeout, request).await {
                Err(_) => {
                    log::debug!("Chunk {} timed out ({}/{})", index, attempt, attempts);
                    last = OtaError::Transport(TransportError::Timeout);
                }
                Ok(Err(TransportError::NotFound)) | Ok(Err(TransportError::OutOfRange)) => {
                    return Err(OtaError::NotFound(format!(
                        "chunk {} of {}",
                        index, progress.patch_id
                    )));
                }
                Ok(Err(e)) if e.is_transient() => {
                    log::debug!("Chunk {} failed ({}/{}): {}", index, attempt, attempts, e);
                    last = OtaError::Transport(e);
                }
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(chunk)) => {
                    if chunk.index == index && chunk.payload.len() == expected && chunk.is_valid() {
                        return Ok(chunk.payload);
                    }
                    log::warn!(
                        "Chunk {} of {} failed verification ({}/{})",
                        index,
                        progress.patch_id,
                        attempt,
                        attempts
                    );
                    last = OtaError::ChecksumMismatch {
                        index,
                        attempts: attempt,
                    };
                }
            }
            tokio::task::yield_now().await;
        }
        Err(last)
    }

    fn commit(&mut self, session: &mut Session, index: u32, payload: &[u8]) -> Result<(), OtaError> {
        let offset = index as u64 * session.progress.chunk_size as u64;
        self.slots.staging.write_at(offset, payload)?;
        self.slots.staging.sync()?;

        session.patch.feed(payload)?;
        session.hasher.update(payload);
        self.slots.get(session.candidate).sync()?;

        session.progress.next_expected_chunk_index = index + 1;
        session.progress.candidate_partition_write_offset = session.patch.written();
        self.store.save(&session.progress)?;
        log::trace!(
            "Committed chunk {}/{} of {}",
            index + 1,
            session.progress.chunk_count,
            session.progress.patch_id
        );
        Ok(())
    }

    async fn install(&mut self, session: Session) -> Result<(), OtaError> {
        let Session {
            mut progress,
            candidate,
            patch,
            hasher,
        } = session;

        self.state = AgentState::Verifying;
        if hasher.finalize_hex() != progress.patch_hash {
            return Err(OtaError::PatchHashMismatch);
        }

        self.state = AgentState::Applying;
        let len = patch
            .header()
            .map(|h| h.target_len as u64)
            .ok_or(ota_patch::PatchError::Truncated)?;
        let target = patch.finish()?;
        target.sync()?;

        self.boot.mark_candidate(
            candidate,
            SlotImage {
                version: progress.target_version.clone(),
                len,
            },
        )?;
        progress.installed = true;
        self.store.save(&progress)?;
        self.state = AgentState::RebootPending;
        log::info!(
            "Installed {} into slot {:?}, reboot required",
            progress.target_version,
            candidate
        );
        if let Err(e) = self.report(&progress.patch_id, Outcome::Success, None).await {
            log::warn!("Unable to queue outcome of {}: {}", progress.patch_id, e);
        }
        Ok(())
    }

    async fn fail(
        &mut self,
        mut progress: PersistedProgress,
        candidate: Slot,
        error: OtaError,
    ) -> OtaError {
        self.state = AgentState::Idle;
        if let OtaError::NotFound(_) = error {
            log::warn!("Patch {} withdrawn: {}", progress.patch_id, error);
            if let Err(e) = self.store.clear() {
                log::warn!("Unable to clear progress: {}", e);
            }
            return error;
        }

        log::warn!("Update {} failed: {}", progress.patch_id, error);
        if error.discards_download() {
            progress.restart();
            if let Err(e) = self.slots.get(candidate).erase() {
                log::warn!("Unable to erase slot {:?}: {}", candidate, e);
            }
        }
        let patch_id = progress.patch_id.clone();
        match self.record_failure(progress, error.to_string()).await {
            Ok(true) => OtaError::Abandoned(patch_id),
            Ok(false) => error,
            Err(e) => {
                log::warn!("Unable to record failure of {}: {}", patch_id, e);
                error
            }
        }
    }

    /// Counts a failed attempt and reports it. Returns whether the patch is
    /// now abandoned.
    async fn record_failure(
        &mut self,
        mut progress: PersistedProgress,
        reason: String,
    ) -> Result<bool, OtaError> {
        progress.consecutive_failure_count += 1;
        progress.abandoned = progress.consecutive_failure_count >= self.config.max_patch_failures;
        self.store.save(&progress)?;

        let reason = if progress.abandoned {
            log::warn!(
                "Abandoning {} after {} failures",
                progress.patch_id,
                progress.consecutive_failure_count
            );
            format!(
                "{}; abandoned after {} failures",
                reason, progress.consecutive_failure_count
            )
        } else {
            reason
        };
        self.report(&progress.patch_id, Outcome::Failure, Some(reason))
            .await?;
        Ok(progress.abandoned)
    }

    /// Queues a report durably, then tries to deliver it.
    async fn report(
        &mut self,
        patch_id: &PatchId,
        outcome: Outcome,
        reason: Option<String>,
    ) -> Result<(), OtaError> {
        let mut queued = self.store.load_reports()?;
        if queued.len() >= MAX_QUEUED_REPORTS {
            let dropped = queued.remove(0);
            log::warn!(
                "Report queue full, dropping {:?} for {}",
                dropped.outcome,
                dropped.patch_id
            );
        }
        queued.push(OutcomeReport {
            patch_id: patch_id.clone(),
            outcome,
            reason,
        });
        self.store.save_reports(&queued)?;
        self.flush_reports().await
    }

    /// Delivers queued reports in order. A report leaves the queue only once
    /// the service has acknowledged or refused it; anything else stops the
    /// flush until the next attempt.
    async fn flush_reports(&mut self) -> Result<(), OtaError> {
        let mut queued = self.store.load_reports()?;
        if queued.is_empty() {
            return Ok(());
        }
        let mut settled = 0;
        for report in queued.iter() {
            match self.transport.report_outcome(report).await {
                Ok(()) => {}
                Err(e) if e.is_refusal() => {
                    log::warn!("Service refused outcome of {}: {}", report.patch_id, e)
                }
                Err(e) => {
                    log::warn!(
                        "Unable to report outcome of {}: {}, {} queued",
                        report.patch_id,
                        e,
                        queued.len() - settled
                    );
                    break;
                }
            }
            settled += 1;
        }
        if settled > 0 {
            queued.drain(..settled);
            self.store.save_reports(&queued)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::SimulatedBoot;
    use crate::flash::MemPartition;
    use crate::progress::MemProgressStore;
    use async_trait::async_trait;
    use ota_patch::PatchOptions;
    use ota_schema::{chunk_count, content_hash, ChunkResponse};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    const CHUNK: u32 = 64;
    const PARTITION: usize = 16 * 1024;

    fn image(len: usize, seed: u32) -> Vec<u8> {
        let mut x = seed | 1;
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                x as u8
            })
            .collect()
    }

    struct Fixture {
        v1: Vec<u8>,
        v2: Vec<u8>,
        patch: Vec<u8>,
    }

    fn fixture() -> Fixture {
        let v1 = image(6_000, 1);
        let mut v2 = v1.clone();
        v2[1_000..3_000].copy_from_slice(&image(2_000, 2));
        v2.extend_from_slice(b"release 2.0");
        let patch = ota_patch::create_patch(&v1, &v2, &PatchOptions::default()).unwrap();
        Fixture { v1, v2, patch }
    }

    #[derive(Default)]
    struct Service {
        patch: Vec<u8>,
        patch_hash: String,
        corrupt: Mutex<HashMap<u32, (u32, usize)>>,
        offline: AtomicBool,
        checks: AtomicU32,
        heartbeats: AtomicU32,
        /// Outcome reports still to be lost on the way.
        lost_reports: AtomicU32,
        requests: Mutex<Vec<u32>>,
        reports: Mutex<Vec<OutcomeReport>>,
    }

    #[derive(Clone)]
    struct FakeTransport(Arc<Service>);

    impl FakeTransport {
        fn new(patch: &[u8]) -> Self {
            Self(Arc::new(Service {
                patch: patch.to_vec(),
                patch_hash: content_hash(patch),
                ..Default::default()
            }))
        }

        fn with_hash(patch: &[u8], patch_hash: &str) -> Self {
            Self(Arc::new(Service {
                patch: patch.to_vec(),
                patch_hash: patch_hash.to_string(),
                ..Default::default()
            }))
        }

        /// Flips `bit` of chunk `index` on its next `times` deliveries.
        fn corrupt(&self, index: u32, times: u32, bit: usize) {
            self.0.corrupt.lock().unwrap().insert(index, (times, bit));
        }

        fn requests(&self) -> Vec<u32> {
            self.0.requests.lock().unwrap().clone()
        }

        fn reports(&self) -> Vec<OutcomeReport> {
            self.0.reports.lock().unwrap().clone()
        }

        fn lose_reports(&self, count: u32) {
            self.0.lost_reports.store(count, Ordering::SeqCst);
        }

        fn checks(&self) -> u32 {
            self.0.checks.load(Ordering::SeqCst)
        }

        fn answer(&self, version: &str) -> CheckResponse {
            if version == "1.0" {
                self.offer()
            } else {
                CheckResponse::up_to_date()
            }
        }

        fn offer(&self) -> CheckResponse {
            CheckResponse {
                available: true,
                patch_id: Some(PatchId::new("1.0", "2.0")),
                target_version: Some("2.0".to_string()),
                chunk_count: Some(chunk_count(self.0.patch.len() as u64, CHUNK)),
                chunk_size: Some(CHUNK),
                patch_size: Some(self.0.patch.len() as u64),
                patch_hash: Some(self.0.patch_hash.clone()),
            }
        }
    }

    #[async_trait]
    impl OtaTransport for FakeTransport {
        async fn check(&self, current_version: &str) -> Result<CheckResponse, TransportError> {
            self.0.checks.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer(current_version))
        }

        async fn get_chunk(
            &self,
            _patch_id: &PatchId,
            index: u32,
        ) -> Result<ChunkResponse, TransportError> {
            if self.0.offline.load(Ordering::SeqCst) {
                return Err(TransportError::Timeout);
            }
            self.0.requests.lock().unwrap().push(index);
            let start = (index * CHUNK) as usize;
            if start >= self.0.patch.len() {
                return Err(TransportError::OutOfRange);
            }
            let end = core::cmp::min(start + CHUNK as usize, self.0.patch.len());
            let mut chunk = ChunkResponse::new(index, self.0.patch[start..end].to_vec());
            let mut corrupt = self.0.corrupt.lock().unwrap();
            if let Some((times, bit)) = corrupt.get_mut(&index) {
                if *times > 0 {
                    *times -= 1;
                    chunk.payload[*bit / 8] ^= 1 << (*bit % 8);
                }
            }
            Ok(chunk)
        }

        async fn report_outcome(&self, report: &OutcomeReport) -> Result<(), TransportError> {
            let lost = self
                .0
                .lost_reports
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if lost.is_ok() {
                return Err(TransportError::Timeout);
            }
            self.0.reports.lock().unwrap().push(report.clone());
            Ok(())
        }

        async fn heartbeat(&self, version: &str) -> Result<CheckResponse, TransportError> {
            self.0.heartbeats.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer(version))
        }
    }

    struct Device {
        boot: SimulatedBoot,
        store: MemProgressStore,
        slots: Slots,
    }

    impl Device {
        fn new(base: &[u8]) -> Self {
            Self {
                boot: SimulatedBoot::new(SlotImage {
                    version: "1.0".to_string(),
                    len: base.len() as u64,
                }),
                store: MemProgressStore::new(),
                slots: Slots {
                    a: PartitionHandle::new(MemPartition::with_image(base, PARTITION)),
                    b: PartitionHandle::new(MemPartition::new(PARTITION)),
                    staging: PartitionHandle::new(MemPartition::new(PARTITION)),
                },
            }
        }

        async fn agent(
            &self,
            transport: &FakeTransport,
            config: AgentConfig,
        ) -> OtaAgent<FakeTransport, SimulatedBoot, MemProgressStore> {
            OtaAgent::start(
                transport.clone(),
                self.boot.clone(),
                self.store.clone(),
                self.slots.clone(),
                config,
            )
            .await
            .unwrap()
        }

        fn progress(&self) -> Option<PersistedProgress> {
            self.store.frame().and_then(|f| crate::progress::decode(&f))
        }
    }

    async fn run_to_end(
        agent: &mut OtaAgent<FakeTransport, SimulatedBoot, MemProgressStore>,
    ) -> Result<SliceOutcome, OtaError> {
        for _ in 0..1000 {
            match agent.run_slice().await? {
                SliceOutcome::InProgress { .. } => continue,
                outcome => return Ok(outcome),
            }
        }
        panic!("download did not finish");
    }

    #[tokio::test]
    async fn installs_and_confirms_only_on_milestone() {
        let f = fixture();
        let device = Device::new(&f.v1);
        let transport = FakeTransport::new(&f.patch);
        let config = AgentConfig::default().set_chunks_per_slice(8);

        let mut agent = device.agent(&transport, config.clone()).await;
        assert_eq!(run_to_end(&mut agent).await.unwrap(), SliceOutcome::RebootRequired);
        assert_eq!(agent.state(), AgentState::RebootPending);
        assert_eq!(device.slots.b.read_image(f.v2.len() as u64).unwrap(), f.v2);
        assert_eq!(transport.reports()[0].outcome, Outcome::Success);
        assert_eq!(device.boot.record().unwrap().candidate, Some(Slot::B));
        drop(agent);

        device.boot.power_on().unwrap();
        let mut agent = device.agent(&transport, config).await;
        assert_eq!(agent.state(), AgentState::Provisional);
        assert_eq!(agent.current_version().unwrap(), "2.0");
        assert_eq!(
            agent.run_slice().await.unwrap(),
            SliceOutcome::AwaitingConfirmation
        );
        assert_eq!(device.boot.record().unwrap().confirmations, 0);

        let response = agent.heartbeat().await.unwrap();
        assert!(!response.available);
        assert_eq!(agent.state(), AgentState::Confirmed);
        assert_eq!(device.boot.record().unwrap().confirmations, 1);
        assert_eq!(device.progress(), None);
    }

    #[tokio::test]
    async fn resumes_after_reset_without_refetching() {
        let f = fixture();
        let device = Device::new(&f.v1);
        let transport = FakeTransport::new(&f.patch);
        let config = AgentConfig::default().set_chunks_per_slice(5);
        let total = chunk_count(f.patch.len() as u64, CHUNK);
        assert!(total > 10);

        let mut agent = device.agent(&transport, config.clone()).await;
        assert_eq!(
            agent.run_slice().await.unwrap(),
            SliceOutcome::InProgress {
                next: 5,
                chunk_count: total
            }
        );
        assert_eq!(device.progress().unwrap().next_expected_chunk_index, 5);
        drop(agent);

        let mut agent = device.agent(&transport, config).await;
        assert_eq!(
            agent.run_slice().await.unwrap(),
            SliceOutcome::InProgress {
                next: 10,
                chunk_count: total
            }
        );
        assert_eq!(run_to_end(&mut agent).await.unwrap(), SliceOutcome::RebootRequired);

        let expected: Vec<u32> = (0..total).collect();
        assert_eq!(transport.requests(), expected);
        assert_eq!(device.slots.b.read_image(f.v2.len() as u64).unwrap(), f.v2);
    }

    #[tokio::test]
    async fn single_bit_flips_are_retried() {
        let f = fixture();
        for bit in (0..(CHUNK as usize * 8)).step_by(29) {
            let device = Device::new(&f.v1);
            let transport = FakeTransport::new(&f.patch);
            transport.corrupt(0, 1, bit);
            let config = AgentConfig::default().set_chunks_per_slice(1);

            let mut agent = device.agent(&transport, config).await;
            assert!(matches!(
                agent.run_slice().await.unwrap(),
                SliceOutcome::InProgress { next: 1, .. }
            ));
            assert_eq!(transport.requests(), vec![0, 0], "bit {}", bit);
            assert!(transport.reports().is_empty());
        }
    }

    #[tokio::test]
    async fn retried_chunk_still_produces_the_image() {
        let f = fixture();
        let device = Device::new(&f.v1);
        let transport = FakeTransport::new(&f.patch);
        transport.corrupt(3, 2, 100);

        let mut agent = device.agent(&transport, AgentConfig::default()).await;
        assert_eq!(run_to_end(&mut agent).await.unwrap(), SliceOutcome::RebootRequired);
        assert_eq!(transport.requests().iter().filter(|i| **i == 3).count(), 3);
        assert_eq!(device.slots.b.read_image(f.v2.len() as u64).unwrap(), f.v2);
    }

    #[tokio::test]
    async fn persistent_corruption_aborts_and_reports() {
        let f = fixture();
        let device = Device::new(&f.v1);
        let transport = FakeTransport::new(&f.patch);
        transport.corrupt(1, 100, 7);
        let config = AgentConfig::default().set_max_chunk_retries(3);

        let mut agent = device.agent(&transport, config).await;
        assert!(matches!(
            agent.run_slice().await,
            Err(OtaError::ChecksumMismatch {
                index: 1,
                attempts: 4
            })
        ));
        assert_eq!(agent.state(), AgentState::Idle);

        let progress = device.progress().unwrap();
        assert_eq!(progress.next_expected_chunk_index, 1);
        assert_eq!(progress.consecutive_failure_count, 1);
        let reports = transport.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, Outcome::Failure);
        assert!(reports[0].reason.as_deref().unwrap().contains("chunk 1"));
        assert_eq!(device.slots.a.read_image(f.v1.len() as u64).unwrap(), f.v1);
    }

    #[tokio::test]
    async fn hash_mismatch_restarts_then_abandons() {
        let f = fixture();
        let device = Device::new(&f.v1);
        let transport = FakeTransport::with_hash(&f.patch, &content_hash(b"something else"));
        let config = AgentConfig::default().set_max_patch_failures(2);
        let total = chunk_count(f.patch.len() as u64, CHUNK) as usize;

        let mut agent = device.agent(&transport, config).await;
        assert!(matches!(
            run_to_end(&mut agent).await,
            Err(OtaError::PatchHashMismatch)
        ));
        let progress = device.progress().unwrap();
        assert_eq!(progress.next_expected_chunk_index, 0);
        assert_eq!(progress.consecutive_failure_count, 1);
        assert!(!progress.abandoned);

        assert!(matches!(
            run_to_end(&mut agent).await,
            Err(OtaError::Abandoned(_))
        ));
        assert_eq!(transport.requests().len(), 2 * total);

        assert_eq!(
            agent.run_slice().await.unwrap(),
            SliceOutcome::Abandoned(PatchId::new("1.0", "2.0"))
        );
        assert_eq!(transport.requests().len(), 2 * total);

        let reports = transport.reports();
        assert_eq!(reports.len(), 2);
        assert!(reports[1].reason.as_deref().unwrap().contains("abandoned"));
        assert_eq!(device.boot.record().unwrap().candidate, None);
    }

    #[tokio::test]
    async fn unconfirmed_firmware_is_reverted_and_reported() {
        let f = fixture();
        let device = Device::new(&f.v1);
        let transport = FakeTransport::new(&f.patch);

        let mut agent = device.agent(&transport, AgentConfig::default()).await;
        assert_eq!(run_to_end(&mut agent).await.unwrap(), SliceOutcome::RebootRequired);
        drop(agent);

        // The new firmware boots but never reaches a milestone.
        for _ in 0..crate::boot::DEFAULT_MAX_BOOT_ATTEMPTS {
            device.boot.power_on().unwrap();
            let mut agent = device.agent(&transport, AgentConfig::default()).await;
            assert_eq!(agent.state(), AgentState::Provisional);
            assert_eq!(
                agent.run_slice().await.unwrap(),
                SliceOutcome::AwaitingConfirmation
            );
        }
        device.boot.power_on().unwrap();

        let record = device.boot.record().unwrap();
        assert_eq!(record.confirmations, 0);
        assert_eq!(record.reverts, 1);
        assert_eq!(record.active, Slot::A);

        let agent = device.agent(&transport, AgentConfig::default()).await;
        assert_eq!(agent.current_version().unwrap(), "1.0");
        let reports = transport.reports();
        assert_eq!(reports.last().unwrap().outcome, Outcome::Failure);
        assert_eq!(reports.last().unwrap().reason.as_deref(), Some(REVERTED));
        let progress = device.progress().unwrap();
        assert_eq!(progress.consecutive_failure_count, 1);
        assert!(!progress.installed);
    }

    #[tokio::test]
    async fn wrong_base_image_is_an_apply_failure() {
        let f = fixture();
        let mut base = f.v1.clone();
        base[10] ^= 0xFF;
        let device = Device::new(&base);
        let transport = FakeTransport::new(&f.patch);

        let mut agent = device.agent(&transport, AgentConfig::default()).await;
        assert!(matches!(
            agent.run_slice().await,
            Err(OtaError::ApplyFailure(ota_patch::PatchError::SourceMismatch))
        ));
        // Fails as soon as the header is through, long before the end.
        assert!(transport.requests().len() <= 3);
        assert_eq!(device.progress().unwrap().next_expected_chunk_index, 0);
        assert_eq!(device.slots.a.read_image(base.len() as u64).unwrap(), base);
    }

    #[tokio::test]
    async fn damaged_progress_restarts_from_zero() {
        let f = fixture();
        let device = Device::new(&f.v1);
        let transport = FakeTransport::new(&f.patch);
        let config = AgentConfig::default().set_chunks_per_slice(4);

        let mut agent = device.agent(&transport, config.clone()).await;
        agent.run_slice().await.unwrap();
        drop(agent);

        let mut frame = device.store.frame().unwrap();
        frame[10] ^= 0x40;
        device.store.set_frame(Some(frame));

        let mut agent = device.agent(&transport, config).await;
        agent.run_slice().await.unwrap();
        assert_eq!(transport.requests(), vec![0, 1, 2, 3, 0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn lost_link_pauses_without_recheck() {
        let f = fixture();
        let device = Device::new(&f.v1);
        let transport = FakeTransport::new(&f.patch);
        let config = AgentConfig::default().set_chunks_per_slice(3);

        let mut agent = device.agent(&transport, config).await;
        agent.run_slice().await.unwrap();
        transport.0.offline.store(true, Ordering::SeqCst);
        assert!(matches!(
            agent.run_slice().await,
            Err(OtaError::Transport(TransportError::Timeout))
        ));
        assert_eq!(agent.state(), AgentState::Downloading);
        assert!(transport.reports().is_empty());

        transport.0.offline.store(false, Ordering::SeqCst);
        assert!(matches!(
            agent.run_slice().await.unwrap(),
            SliceOutcome::InProgress { next: 6, .. }
        ));
        assert_eq!(transport.checks(), 1);
        assert_eq!(transport.requests(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn lost_success_report_is_resent_after_reboot() {
        let f = fixture();
        let device = Device::new(&f.v1);
        let transport = FakeTransport::new(&f.patch);
        transport.lose_reports(2);

        let mut agent = device.agent(&transport, AgentConfig::default()).await;
        assert_eq!(run_to_end(&mut agent).await.unwrap(), SliceOutcome::RebootRequired);
        assert!(transport.reports().is_empty());
        assert_eq!(device.store.pending_reports().len(), 1);
        drop(agent);

        // Lost again on start, delivered ahead of the first heartbeat.
        device.boot.power_on().unwrap();
        let mut agent = device.agent(&transport, AgentConfig::default()).await;
        assert!(transport.reports().is_empty());
        agent.heartbeat().await.unwrap();
        assert_eq!(agent.state(), AgentState::Confirmed);

        let reports = transport.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, Outcome::Success);
        assert_eq!(reports[0].patch_id, PatchId::new("1.0", "2.0"));
        assert!(device.store.pending_reports().is_empty());
        assert_eq!(device.progress(), None);

        agent.heartbeat().await.unwrap();
        assert_eq!(transport.reports().len(), 1);
    }

    #[tokio::test]
    async fn abandonment_is_reported_once_the_link_returns() {
        let f = fixture();
        let mut base = f.v1.clone();
        base[10] ^= 0xFF;
        let device = Device::new(&base);
        let transport = FakeTransport::new(&f.patch);
        transport.lose_reports(3);
        let config = AgentConfig::default().set_max_patch_failures(1);

        let mut agent = device.agent(&transport, config.clone()).await;
        assert!(matches!(
            agent.run_slice().await,
            Err(OtaError::Abandoned(_))
        ));
        assert_eq!(
            agent.run_slice().await.unwrap(),
            SliceOutcome::Abandoned(PatchId::new("1.0", "2.0"))
        );
        assert!(transport.reports().is_empty());
        drop(agent);

        // Lost on start as well, then delivered by the next slice.
        let mut agent = device.agent(&transport, config).await;
        assert!(transport.reports().is_empty());
        assert_eq!(
            agent.run_slice().await.unwrap(),
            SliceOutcome::Abandoned(PatchId::new("1.0", "2.0"))
        );
        let reports = transport.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, Outcome::Failure);
        let reason = reports[0].reason.as_deref().unwrap();
        assert!(reason.contains("abandoned after 1 failures"), "{}", reason);
        assert!(device.store.pending_reports().is_empty());
    }

    #[tokio::test]
    async fn heartbeat_answer_replaces_the_check() {
        let f = fixture();
        let device = Device::new(&f.v1);
        let transport = FakeTransport::new(&f.patch);
        let config = AgentConfig::default().set_chunks_per_slice(2);

        let mut agent = device.agent(&transport, config).await;
        assert!(agent.heartbeat().await.unwrap().available);
        assert!(matches!(
            agent.run_slice().await.unwrap(),
            SliceOutcome::InProgress { next: 2, .. }
        ));
        assert_eq!(transport.checks(), 0);
        assert_eq!(transport.0.heartbeats.load(Ordering::SeqCst), 1);

        // Without a fresh heartbeat the slice asks for itself.
        drop(agent);
        let mut agent = device.agent(&transport, AgentConfig::default()).await;
        agent.run_slice().await.unwrap();
        assert_eq!(transport.checks(), 1);
    }
}
