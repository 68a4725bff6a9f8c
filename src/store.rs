//! Parent storage for one splitfile: owns the backing file, the FEC codec,
//! the bounded-memory job runner, and the segment and cross-segment
//! vectors. Routes arriving blocks to the segment that wants them and
//! coalesces lazy metadata flushes onto a background thread.

use crate::block::codec::{CryptoAlgorithm, RoutingKey, BLOCK_DATA_LENGTH, CRYPTO_KEY_LENGTH};
use crate::block::keys::{stored_key_list_length, SegmentKeyTable};
use crate::cross_segment::{CrossBlockRef, CrossSegmentStorage};
use crate::error::StoreError;
use crate::fec::FecCodec;
use crate::jobs::{JobRunnerConfig, MemoryLimitedJobRunner};
use crate::raf::LockableRandomAccessFile;
use crate::segment::{padded_stored_status_length, SegmentLayout, SegmentStorage};
use log::{error, info, warn};
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Progress callbacks consumed by the fetch orchestrator.
pub trait FetchCallbacks: Send + Sync {
    /// All data and cross-check blocks of a segment are decoded and sit in
    /// their canonical slots.
    fn finished_success(&self, segment: usize);
    /// The segment has also finished re-encoding check blocks and queueing
    /// heals; it will not touch the disk again.
    fn finished_encoding(&self, segment: usize);
}

/// Sink for reconstructed blocks worth re-inserting into the network.
pub trait Healer: Send + Sync {
    fn queue_heal(
        &self,
        data: Vec<u8>,
        crypto_key: [u8; CRYPTO_KEY_LENGTH],
        algorithm: CryptoAlgorithm,
    );
}

/// Geometry of one segment as handed to [`SplitFileStore::create`].
pub struct SegmentGeometry {
    pub data_blocks: usize,
    pub cross_check_blocks: usize,
    pub check_blocks: usize,
    pub common_crypto_key: bool,
    /// Expected keys. Required by `create` (they are written to disk);
    /// `open` may omit them and re-read the checksummed key list region.
    pub keys: Option<SegmentKeyTable>,
}

/// Geometry of one cross-segment: which segment each data and check entry
/// draws a block from. The block numbers themselves are chosen by the
/// deterministic allocation probe against the caller-seeded RNG.
pub struct CrossSegmentGeometry {
    pub data_segments: Vec<usize>,
    pub check_segments: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub track_retries: bool,
    pub flush_interval: Duration,
    pub job_runner: JobRunnerConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            track_retries: false,
            flush_interval: Duration::from_secs(5),
            job_runner: JobRunnerConfig::default(),
        }
    }
}

pub struct StoreParams {
    pub path: PathBuf,
    pub segments: Vec<SegmentGeometry>,
    pub cross_segments: Vec<CrossSegmentGeometry>,
    pub fec: Arc<dyn FecCodec>,
    pub callbacks: Arc<dyn FetchCallbacks>,
    pub healer: Arc<dyn Healer>,
    pub config: StoreConfig,
}

/// Everything the segments and cross-segments need from their parent.
/// Segment and cross-segment vectors are initialized exactly once after
/// construction; the cyclic references between the two sides are plain
/// indices into these vectors.
pub(crate) struct StoreShared {
    raf: LockableRandomAccessFile,
    fec: Arc<dyn FecCodec>,
    jobs: MemoryLimitedJobRunner,
    callbacks: Arc<dyn FetchCallbacks>,
    healer: Arc<dyn Healer>,
    segments: OnceLock<Vec<Arc<SegmentStorage>>>,
    cross_segments: OnceLock<Vec<Arc<CrossSegmentStorage>>>,
    failed: AtomicBool,
    metadata_dirty: AtomicBool,
}

impl StoreShared {
    pub(crate) fn raf(&self) -> &LockableRandomAccessFile {
        &self.raf
    }

    pub(crate) fn fec(&self) -> &dyn FecCodec {
        self.fec.as_ref()
    }

    pub(crate) fn jobs(&self) -> &MemoryLimitedJobRunner {
        &self.jobs
    }

    pub(crate) fn callbacks(&self) -> &dyn FetchCallbacks {
        self.callbacks.as_ref()
    }

    pub(crate) fn healer(&self) -> &dyn Healer {
        self.healer.as_ref()
    }

    pub(crate) fn segments(&self) -> &[Arc<SegmentStorage>] {
        self.segments.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn segment(&self, index: usize) -> Option<&Arc<SegmentStorage>> {
        self.segments().get(index)
    }

    pub(crate) fn cross_segments(&self) -> &[Arc<CrossSegmentStorage>] {
        self.cross_segments.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn cross_segment(&self, index: usize) -> Option<&Arc<CrossSegmentStorage>> {
        self.cross_segments().get(index)
    }

    pub(crate) fn notify_cross_segment(&self, cross_index: usize, segment_index: usize) {
        if let Some(cross) = self.cross_segment(cross_index) {
            cross.on_fetched_relevant_block(segment_index);
        }
    }

    pub(crate) fn lazy_write_metadata(&self) {
        self.metadata_dirty.store(true, Ordering::Release);
    }

    pub(crate) fn take_dirty(&self) -> bool {
        self.metadata_dirty.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// A disk error anywhere poisons the whole splitfile: every segment and
    /// cross-segment goes terminal.
    pub(crate) fn fail_on_disk_error(&self, err: &StoreError) {
        error!("event=splitfile_disk_failure error={err}");
        self.fail_all();
    }

    pub(crate) fn fail_all(&self) {
        if self.failed.swap(true, Ordering::AcqRel) {
            return;
        }
        for segment in self.segments() {
            segment.fail();
        }
        for cross in self.cross_segments() {
            cross.fail();
        }
    }
}

struct FlusherSignal {
    stop: Mutex<bool>,
    wake: Condvar,
}

struct Flusher {
    signal: Arc<FlusherSignal>,
    handle: JoinHandle<()>,
}

/// The splitfile store. Dropping it stops the flusher thread; in-flight
/// decode jobs finish on the runner and observe the terminal flags.
pub struct SplitFileStore {
    shared: Arc<StoreShared>,
    flusher: Option<Flusher>,
}

impl SplitFileStore {
    /// Create a fresh splitfile: lays out the backing file, writes every
    /// segment's key list and initial (empty) status region.
    pub fn create<R: Rng>(params: StoreParams, rng: &mut R) -> Result<Self, StoreError> {
        Self::build(params, rng, true)
    }

    /// Re-open a splitfile from an existing backing file: re-reads each
    /// status region and resumes any decode that was already possible.
    pub fn open<R: Rng>(params: StoreParams, rng: &mut R) -> Result<Self, StoreError> {
        Self::build(params, rng, false)
    }

    fn build<R: Rng>(params: StoreParams, rng: &mut R, fresh: bool) -> Result<Self, StoreError> {
        if params.segments.is_empty() {
            return Err(StoreError::Other("splitfile has no segments".into()));
        }
        let track_retries = params.config.track_retries;
        let mut layouts: Vec<SegmentLayout> = Vec::with_capacity(params.segments.len());
        let mut offset = 0u64;
        for (index, geometry) in params.segments.iter().enumerate() {
            if fresh && geometry.keys.is_none() {
                return Err(StoreError::Other(format!(
                    "segment {index} created without a key table"
                )));
            }
            let fetched = geometry.data_blocks + geometry.cross_check_blocks;
            layouts.push(SegmentLayout {
                segment_index: index,
                data_blocks: geometry.data_blocks,
                cross_check_blocks: geometry.cross_check_blocks,
                check_blocks: geometry.check_blocks,
                block_data_offset: offset,
                status_offset: 0,
                key_list_offset: 0,
                track_retries,
                common_crypto_key: geometry.common_crypto_key,
            });
            offset += (fetched * BLOCK_DATA_LENGTH) as u64;
        }
        for (layout, geometry) in layouts.iter_mut().zip(params.segments.iter()) {
            layout.status_offset = offset;
            offset += padded_stored_status_length(
                geometry.data_blocks,
                geometry.check_blocks,
                geometry.cross_check_blocks,
                track_retries,
            ) as u64;
        }
        for (layout, geometry) in layouts.iter_mut().zip(params.segments.iter()) {
            layout.key_list_offset = offset;
            offset += stored_key_list_length(
                geometry.data_blocks + geometry.cross_check_blocks,
                geometry.check_blocks,
                geometry.common_crypto_key,
            ) as u64;
        }

        let raf = LockableRandomAccessFile::open(&params.path, offset)?;
        let shared = Arc::new(StoreShared {
            raf,
            fec: params.fec,
            jobs: MemoryLimitedJobRunner::new(params.config.job_runner),
            callbacks: params.callbacks,
            healer: params.healer,
            segments: OnceLock::new(),
            cross_segments: OnceLock::new(),
            failed: AtomicBool::new(false),
            metadata_dirty: AtomicBool::new(false),
        });

        let mut segments = Vec::with_capacity(params.segments.len());
        for (layout, geometry) in layouts.into_iter().zip(params.segments) {
            segments.push(Arc::new(SegmentStorage::new(
                shared.clone(),
                layout,
                geometry.keys,
            )?));
        }
        if shared.segments.set(segments).is_err() {
            return Err(StoreError::Other("segment vector initialized twice".into()));
        }

        let mut cross_segments = Vec::with_capacity(params.cross_segments.len());
        for (cross_index, geometry) in params.cross_segments.into_iter().enumerate() {
            let mut blocks = Vec::with_capacity(
                geometry.data_segments.len() + geometry.check_segments.len(),
            );
            for &segment_index in &geometry.data_segments {
                let segment = shared.segment(segment_index).ok_or_else(|| {
                    StoreError::Other(format!(
                        "cross-segment {cross_index} references unknown segment {segment_index}"
                    ))
                })?;
                let block_number = segment
                    .allocate_cross_data_block(cross_index, rng)
                    .ok_or_else(|| {
                        StoreError::Other(format!(
                            "segment {segment_index} has no free cross data blocks"
                        ))
                    })?;
                blocks.push(CrossBlockRef {
                    segment: segment_index,
                    block_number,
                });
            }
            for &segment_index in &geometry.check_segments {
                let segment = shared.segment(segment_index).ok_or_else(|| {
                    StoreError::Other(format!(
                        "cross-segment {cross_index} references unknown segment {segment_index}"
                    ))
                })?;
                let block_number = segment
                    .allocate_cross_check_block(cross_index, rng)
                    .ok_or_else(|| {
                        StoreError::Other(format!(
                            "segment {segment_index} has no free cross-check blocks"
                        ))
                    })?;
                blocks.push(CrossBlockRef {
                    segment: segment_index,
                    block_number,
                });
            }
            cross_segments.push(Arc::new(CrossSegmentStorage::new(
                shared.clone(),
                cross_index,
                geometry.data_segments.len(),
                geometry.check_segments.len(),
                blocks,
            )?));
        }
        if shared.cross_segments.set(cross_segments).is_err() {
            return Err(StoreError::Other(
                "cross-segment vector initialized twice".into(),
            ));
        }

        if fresh {
            for segment in shared.segments() {
                segment.write_keys_with_checksum()?;
                segment.write_metadata(true)?;
            }
        } else {
            for segment in shared.segments() {
                segment.restore()?;
            }
            for cross in shared.cross_segments() {
                cross.refresh_found();
            }
            for segment in shared.segments() {
                segment.try_start_decode();
            }
        }

        let flusher = spawn_flusher(shared.clone(), params.config.flush_interval);
        Ok(Self {
            shared,
            flusher: Some(flusher),
        })
    }

    /// Offer an arriving `(key, ciphertext)` pair to the segments. Probes
    /// with `definitely_want_key` first so segments that cannot use the key
    /// never pay for verification. Returns `true` if some segment accepted
    /// the block.
    pub fn route_block(&self, key: &RoutingKey, ciphertext: &[u8]) -> Result<bool, StoreError> {
        if self.shared.has_failed() {
            return Ok(false);
        }
        for segment in self.shared.segments() {
            if !segment.definitely_want_key(key) {
                continue;
            }
            match segment.on_got_key(key, ciphertext) {
                Ok(true) => return Ok(true),
                Ok(false) => continue,
                Err(err) => {
                    if err.is_disk_error() {
                        self.shared.fail_on_disk_error(&err);
                    }
                    return Err(err);
                }
            }
        }
        Ok(false)
    }

    /// Stream the reconstructed payload: each segment's data blocks in
    /// order. Every segment must have decoded first.
    pub fn write_out(&self, out: &mut dyn Write) -> Result<(), StoreError> {
        for (index, segment) in self.shared.segments().iter().enumerate() {
            if !segment.has_succeeded() {
                return Err(StoreError::SegmentIncomplete { segment: index });
            }
        }
        let _lock = self.shared.raf().open_lock();
        for segment in self.shared.segments() {
            segment.write_to_inner(out)?;
        }
        Ok(())
    }

    /// Emit the fixed metadata descriptor of every segment.
    pub fn write_fixed_metadata(&self, out: &mut dyn Write) -> Result<(), StoreError> {
        for segment in self.shared.segments() {
            segment.write_fixed_metadata(out)?;
        }
        Ok(())
    }

    pub fn fail_on_disk_error(&self, err: &StoreError) {
        self.shared.fail_on_disk_error(err);
    }

    /// Cancel the whole fetch. Terminal: subsequent deliveries are
    /// rejected and queued decode jobs exit at their terminal-state check.
    pub fn cancel(&self) {
        info!("event=splitfile_cancelled");
        self.shared.fail_all();
    }

    /// Note that some segment has dirty status metadata; the background
    /// flusher will write it out.
    pub fn lazy_write_metadata(&self) {
        self.shared.lazy_write_metadata();
    }

    /// Synchronously write every dirty segment's status region.
    pub fn flush_metadata(&self) -> Result<(), StoreError> {
        self.shared.take_dirty();
        for segment in self.shared.segments() {
            segment.write_metadata(false)?;
        }
        Ok(())
    }

    /// Drop cached key tables; they re-materialize from disk on demand.
    pub fn release_key_caches(&self) {
        for segment in self.shared.segments() {
            segment.release_key_cache();
        }
    }

    pub fn has_failed(&self) -> bool {
        self.shared.has_failed()
    }

    pub fn all_succeeded(&self) -> bool {
        self.shared
            .segments()
            .iter()
            .all(|segment| segment.has_succeeded())
    }

    pub fn all_finished(&self) -> bool {
        self.shared
            .segments()
            .iter()
            .all(|segment| segment.is_finished())
    }

    pub fn segment_count(&self) -> usize {
        self.shared.segments().len()
    }

    pub fn segment(&self, index: usize) -> Option<&Arc<SegmentStorage>> {
        self.shared.segment(index)
    }

    pub fn cross_segment_count(&self) -> usize {
        self.shared.cross_segments().len()
    }

    pub fn cross_segment(&self, index: usize) -> Option<&Arc<CrossSegmentStorage>> {
        self.shared.cross_segment(index)
    }
}

impl Drop for SplitFileStore {
    fn drop(&mut self) {
        if !self.shared.has_failed() {
            if let Err(err) = self.flush_metadata() {
                warn!("event=final_metadata_flush_failed error={err}");
            }
        }
        if let Some(flusher) = self.flusher.take() {
            *flusher.signal.stop.lock() = true;
            flusher.signal.wake.notify_all();
            if flusher.handle.join().is_err() {
                warn!("event=metadata_flusher_panic");
            }
        }
    }
}

fn spawn_flusher(shared: Arc<StoreShared>, interval: Duration) -> Flusher {
    let signal = Arc::new(FlusherSignal {
        stop: Mutex::new(false),
        wake: Condvar::new(),
    });
    let thread_signal = signal.clone();
    let handle = thread::spawn(move || loop {
        {
            let mut stop = thread_signal.stop.lock();
            if *stop {
                break;
            }
            let _ = thread_signal.wake.wait_for(&mut stop, interval);
            if *stop {
                break;
            }
        }
        if !shared.take_dirty() {
            continue;
        }
        for segment in shared.segments() {
            if let Err(err) = segment.write_metadata(false) {
                shared.fail_on_disk_error(&err);
                break;
            }
        }
        if let Err(err) = shared.raf().sync_data() {
            warn!("event=metadata_sync_failed error={err}");
        }
    });
    Flusher { signal, handle }
}
