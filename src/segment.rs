//! Per-segment storage and decode. Holds the only mutable state in the
//! engine: the slot map and presence bitmap tying on-disk bytes to block
//! identities. The on-disk status region may be stale or corrupt; every
//! decode re-checks it opportunistically, so the segment is robust (though
//! not immune) to disk corruption.

use crate::block::codec::{
    self, ClientKey, CryptoAlgorithm, RoutingKey, BLOCK_DATA_LENGTH, CRYPTO_KEY_LENGTH,
};
use crate::block::keys::{stored_key_list_length, SegmentKeyTable};
use crate::error::StoreError;
use crate::jobs::JobPriority;
use crate::store::StoreShared;
use log::{debug, error, warn};
use parking_lot::Mutex;
use rand::Rng;
use std::io::Write;
use std::sync::Arc;

/// Version tag of the fixed metadata descriptor.
pub const SEGMENT_FORMAT_VERSION: u16 = 1;

const EMPTY_SLOT: i16 = -1;
const CROSS_ALLOCATION_PROBES: usize = 10;

/// Construction parameters for one segment: geometry plus the absolute
/// offsets of its three on-disk regions.
#[derive(Debug, Clone)]
pub struct SegmentLayout {
    pub segment_index: usize,
    pub data_blocks: usize,
    pub cross_check_blocks: usize,
    pub check_blocks: usize,
    pub block_data_offset: u64,
    pub status_offset: u64,
    pub key_list_offset: u64,
    pub track_retries: bool,
    pub common_crypto_key: bool,
}

struct SegmentState {
    /// Which block lives in each on-disk slot; `-1` = empty. May be
    /// inaccurate after corruption and is re-checked during decode.
    slot_block: Vec<i16>,
    /// Blocks we believe we have. Kept consistent with `slot_block`.
    present: Vec<bool>,
    /// Blocks we have attempted to fetch at least once; drives healing.
    tried: Vec<bool>,
    retries: Option<Vec<u32>>,
    present_count: usize,
    succeeded: bool,
    finished: bool,
    failed: bool,
    decode_in_flight: bool,
    metadata_dirty: bool,
    /// Cross-segment index interested in each data/cross-check slot;
    /// cleared once notified.
    cross_by_block: Vec<Option<usize>>,
    cross_data_allocated: usize,
    cross_check_allocated: usize,
}

/// One segment of a splitfile, in memory and on disk.
pub struct SegmentStorage {
    shared: Arc<StoreShared>,
    segment_index: usize,
    data_blocks: usize,
    cross_check_blocks: usize,
    check_blocks: usize,
    block_data_offset: u64,
    status_offset: u64,
    status_length: usize,
    status_padded_length: usize,
    key_list_offset: u64,
    key_list_length: usize,
    track_retries: bool,
    /// Reclaimable cache of the key table; a miss re-reads the key list
    /// region and re-verifies its checksum.
    keys_cache: Mutex<Option<Arc<SegmentKeyTable>>>,
    state: Mutex<SegmentState>,
}

impl SegmentStorage {
    pub(crate) fn new(
        shared: Arc<StoreShared>,
        layout: SegmentLayout,
        keys: Option<SegmentKeyTable>,
    ) -> Result<Self, StoreError> {
        let total = layout.data_blocks + layout.cross_check_blocks + layout.check_blocks;
        let fetched = layout.data_blocks + layout.cross_check_blocks;
        if fetched == 0 || total > i16::MAX as usize {
            return Err(StoreError::Other(format!(
                "segment {} has unusable geometry: {} data + {} cross + {} check",
                layout.segment_index,
                layout.data_blocks,
                layout.cross_check_blocks,
                layout.check_blocks
            )));
        }
        if let Some(table) = &keys {
            if table.data_block_count() != fetched || table.check_block_count() != layout.check_blocks
            {
                return Err(StoreError::Other(format!(
                    "segment {} key table does not match geometry",
                    layout.segment_index
                )));
            }
        }
        Ok(Self {
            segment_index: layout.segment_index,
            data_blocks: layout.data_blocks,
            cross_check_blocks: layout.cross_check_blocks,
            check_blocks: layout.check_blocks,
            block_data_offset: layout.block_data_offset,
            status_offset: layout.status_offset,
            status_length: stored_status_length(
                layout.data_blocks,
                layout.check_blocks,
                layout.cross_check_blocks,
                layout.track_retries,
            ),
            status_padded_length: padded_stored_status_length(
                layout.data_blocks,
                layout.check_blocks,
                layout.cross_check_blocks,
                layout.track_retries,
            ),
            key_list_offset: layout.key_list_offset,
            key_list_length: stored_key_list_length(
                fetched,
                layout.check_blocks,
                layout.common_crypto_key,
            ),
            track_retries: layout.track_retries,
            keys_cache: Mutex::new(keys.map(Arc::new)),
            state: Mutex::new(SegmentState {
                slot_block: vec![EMPTY_SLOT; fetched],
                present: vec![false; total],
                tried: vec![false; total],
                retries: layout.track_retries.then(|| vec![0u32; total]),
                present_count: 0,
                succeeded: false,
                finished: false,
                failed: false,
                decode_in_flight: false,
                metadata_dirty: false,
                cross_by_block: vec![None; fetched],
                cross_data_allocated: 0,
                cross_check_allocated: 0,
            }),
            shared,
        })
    }

    pub fn segment_index(&self) -> usize {
        self.segment_index
    }

    pub fn data_block_count(&self) -> usize {
        self.data_blocks
    }

    pub fn cross_check_block_count(&self) -> usize {
        self.cross_check_blocks
    }

    pub fn check_block_count(&self) -> usize {
        self.check_blocks
    }

    /// Number of valid blocks needed before FEC can reconstruct the rest.
    pub fn blocks_for_decode(&self) -> usize {
        self.data_blocks + self.cross_check_blocks
    }

    pub fn total_blocks(&self) -> usize {
        self.data_blocks + self.cross_check_blocks + self.check_blocks
    }

    pub fn status_length(&self) -> usize {
        self.status_length
    }

    pub fn status_padded_length(&self) -> usize {
        self.status_padded_length
    }

    pub fn key_list_length(&self) -> usize {
        self.key_list_length
    }

    pub fn has_succeeded(&self) -> bool {
        self.state.lock().succeeded
    }

    /// True once the segment is no longer running: fully finished with
    /// healing, or failed.
    pub fn is_finished(&self) -> bool {
        let state = self.state.lock();
        state.finished || state.failed
    }

    pub fn has_failed(&self) -> bool {
        self.state.lock().failed
    }

    pub fn present_count(&self) -> usize {
        self.state.lock().present_count
    }

    pub fn has_block(&self, block_number: usize) -> bool {
        let state = self.state.lock();
        state.present.get(block_number).copied().unwrap_or(false)
    }

    /// Retry counter for a block; `None` unless retry tracking is enabled.
    pub fn retry_count(&self, block_number: usize) -> Option<u32> {
        let state = self.state.lock();
        state
            .retries
            .as_ref()
            .and_then(|retries| retries.get(block_number).copied())
    }

    pub fn was_tried(&self, block_number: usize) -> bool {
        let state = self.state.lock();
        state.tried.get(block_number).copied().unwrap_or(false)
    }

    /// Mark the segment as terminally failed (cancellation, disk error,
    /// exhaustion). A segment that already succeeded stays succeeded.
    pub(crate) fn fail(&self) {
        let mut state = self.state.lock();
        if state.succeeded || state.failed {
            return;
        }
        state.failed = true;
    }

    // ---- key table ----------------------------------------------------

    /// The key table, from cache or re-read from the key list region.
    pub fn segment_keys(&self) -> Result<Arc<SegmentKeyTable>, StoreError> {
        if let Some(keys) = self.keys_cache.lock().clone() {
            return Ok(keys);
        }
        let keys = Arc::new(self.read_segment_keys()?);
        *self.keys_cache.lock() = Some(keys.clone());
        Ok(keys)
    }

    fn read_segment_keys(&self) -> Result<SegmentKeyTable, StoreError> {
        let mut buf = vec![0u8; self.key_list_length];
        {
            let _lock = self.shared.raf().open_lock();
            self.shared.raf().pread(self.key_list_offset, &mut buf)?;
        }
        Ok(SegmentKeyTable::read_from(
            &buf,
            self.blocks_for_decode(),
            self.check_blocks,
        )?)
    }

    /// Load the key table, converting a corrupt key list into a terminal
    /// segment failure. Disk errors propagate.
    fn load_keys(&self) -> Result<Option<Arc<SegmentKeyTable>>, StoreError> {
        match self.segment_keys() {
            Ok(keys) => Ok(Some(keys)),
            Err(StoreError::Keys(err)) => {
                error!(
                    "event=segment_keys_corrupt segment={} error={}",
                    self.segment_index, err
                );
                self.fail();
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub(crate) fn release_key_cache(&self) {
        *self.keys_cache.lock() = None;
    }

    pub(crate) fn client_key_checked(
        &self,
        block_number: usize,
    ) -> Result<Option<ClientKey>, StoreError> {
        Ok(self
            .load_keys()?
            .map(|keys| keys.key_at(block_number).clone()))
    }

    /// Write the key list region: serialized key table plus its CRC.
    pub fn write_keys_with_checksum(&self) -> Result<(), StoreError> {
        let keys = self.segment_keys()?;
        let buf = keys.write_with_checksum();
        debug_assert_eq!(buf.len(), self.key_list_length);
        let _lock = self.shared.raf().open_lock();
        self.shared.raf().pwrite(self.key_list_offset, &buf)?;
        Ok(())
    }

    // ---- block arrival (the hot path) ---------------------------------

    /// Fast non-mutating probe used by the router: would `on_got_key`
    /// possibly accept this key?
    pub fn definitely_want_key(&self, key: &RoutingKey) -> bool {
        {
            let state = self.state.lock();
            if state.succeeded || state.failed {
                return false;
            }
        }
        let keys = match self.load_keys() {
            Ok(Some(keys)) => keys,
            Ok(None) => return false,
            Err(err) => {
                self.shared.fail_on_disk_error(&err);
                return false;
            }
        };
        let state = self.state.lock();
        if state.succeeded || state.failed {
            return false;
        }
        keys.block_number_of(key, Some(&state.present)).is_some()
    }

    /// A block has arrived which the caller believes is ours. Check that it
    /// is, verify and decrypt it, persist it, and kick off decode if this
    /// was the last block needed. Verification runs outside the segment
    /// lock; the decision to commit is re-made under it.
    ///
    /// Returns `true` if the block was accepted. Disk errors propagate; the
    /// caller marks the whole splitfile failed.
    pub fn on_got_key(
        self: &Arc<Self>,
        key: &RoutingKey,
        ciphertext: &[u8],
    ) -> Result<bool, StoreError> {
        let Some(keys) = self.load_keys()? else {
            return Ok(false);
        };
        let (block_number, decode_key) = {
            let state = self.state.lock();
            if state.succeeded || state.failed {
                return Ok(false);
            }
            let Some(number) = keys.block_number_of(key, Some(&state.present)) else {
                return Ok(false);
            };
            if state.present[number] || state.present_count >= self.blocks_for_decode() {
                return Ok(false);
            }
            (number, keys.key_at(number).clone())
        };

        if let Err(err) = codec::verify_block(ciphertext, &decode_key) {
            warn!(
                "event=block_verify_failed segment={} block={} error={}",
                self.segment_index, block_number, err
            );
            return Ok(false);
        }
        let plaintext = match codec::decode_block(ciphertext, &decode_key) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                warn!(
                    "event=block_decode_failed segment={} block={} error={}",
                    self.segment_index, block_number, err
                );
                return Ok(false);
            }
        };

        if !self.commit_block(block_number, &plaintext)? {
            return Ok(false);
        }
        // Finding a block is rare; flush the status region right away. The
        // OS caches the write anyway.
        self.write_metadata(true)?;
        self.try_start_decode();
        Ok(true)
    }

    /// Commit hook shared by `on_got_key` and cross-segment redistribution:
    /// re-check under the lock, take a free slot, write the plaintext, and
    /// update the slot map and bitmap. Returns `false` when the block is no
    /// longer wanted. On a write error no in-memory state changes.
    fn commit_block(&self, block_number: usize, plaintext: &[u8]) -> Result<bool, StoreError> {
        let callback = {
            let mut state = self.state.lock();
            if state.succeeded || state.failed || state.present[block_number] {
                return Ok(false);
            }
            if state.present_count >= self.blocks_for_decode() {
                return Ok(false);
            }
            let Some(slot) = find_free_slot(&state.slot_block) else {
                warn!(
                    "event=segment_no_free_slot segment={} block={} present_count={}",
                    self.segment_index, block_number, state.present_count
                );
                return Ok(false);
            };
            {
                let _raf = self.shared.raf().open_lock();
                self.write_slot(slot, plaintext)?;
            }
            state.slot_block[slot] = block_number as i16;
            state.present[block_number] = true;
            state.present_count += 1;
            state.metadata_dirty = true;
            state
                .cross_by_block
                .get_mut(block_number)
                .and_then(Option::take)
        };
        if let Some(cross_index) = callback {
            self.shared
                .notify_cross_segment(cross_index, self.segment_index);
        }
        Ok(true)
    }

    /// A block reconstructed by a cross-segment. Behaves like an
    /// `on_got_key` commit without the verification step (the payload came
    /// out of FEC and is re-verified on segment decode anyway).
    pub fn on_decoded_block(
        self: &Arc<Self>,
        block_number: usize,
        plaintext: &[u8],
    ) -> Result<bool, StoreError> {
        if block_number >= self.blocks_for_decode() || plaintext.len() != BLOCK_DATA_LENGTH {
            return Ok(false);
        }
        if !self.commit_block(block_number, plaintext)? {
            return Ok(false);
        }
        self.write_metadata(true)?;
        self.try_start_decode();
        Ok(true)
    }

    /// A fetch for this block failed non-fatally. Updates the retry and
    /// tried counters and requests a lazy flush; the retry policy itself
    /// lives in the fetcher, not here.
    pub fn on_non_fatal_failure(&self, block_number: usize) {
        let changed = {
            let mut state = self.state.lock();
            if block_number >= state.tried.len() {
                warn!(
                    "event=non_fatal_failure_bogus_block segment={} block={}",
                    self.segment_index, block_number
                );
                return;
            }
            let mut changed = false;
            if let Some(retries) = state.retries.as_mut() {
                retries[block_number] = retries[block_number].saturating_add(1);
                changed = true;
            }
            if !state.tried[block_number] {
                state.tried[block_number] = true;
                changed = true;
            }
            if changed {
                state.metadata_dirty = true;
            }
            changed
        };
        if changed {
            self.shared.lazy_write_metadata();
        }
    }

    // ---- decode -------------------------------------------------------

    /// Schedule a decode if enough blocks are present. Idempotent: returns
    /// `false` when fewer than `blocks_for_decode()` blocks are present,
    /// when a decode is already in flight, or when the segment is terminal.
    pub fn try_start_decode(self: &Arc<Self>) -> bool {
        {
            let mut state = self.state.lock();
            if state.succeeded || state.failed || state.decode_in_flight {
                return false;
            }
            if state.present_count < self.blocks_for_decode() {
                return false;
            }
            state.decode_in_flight = true;
        }
        let fetched = self.blocks_for_decode();
        let check = self.check_blocks;
        let fec = self.shared.fec();
        let estimate = self.total_blocks() as u64 * BLOCK_DATA_LENGTH as u64
            + fec
                .max_memory_overhead_decode(fetched, check)
                .max(fec.max_memory_overhead_encode(fetched, check));
        let segment = self.clone();
        self.shared
            .jobs()
            .queue_job(estimate, JobPriority::Low, move |chunk| {
                if let Err(err) = segment.run_decode() {
                    error!(
                        "event=segment_decode_io_error segment={} error={}",
                        segment.segment_index, err
                    );
                    segment.shared.fail_on_disk_error(&err);
                }
                segment.state.lock().decode_in_flight = false;
                chunk.release();
                // A block that arrived while we were decoding may have
                // re-reached the threshold.
                segment.try_start_decode();
            });
        true
    }

    /// The decode job. Reads every slot, reconciles the possibly-stale
    /// metadata against it, verifies each candidate by re-encoding,
    /// FEC-decodes if anything is missing, writes the canonical layout,
    /// and queues heals for blocks the network failed to provide.
    fn run_decode(self: &Arc<Self>) -> Result<(), StoreError> {
        {
            let state = self.state.lock();
            if state.succeeded || state.failed {
                return Ok(());
            }
        }
        let fetched_blocks = self.blocks_for_decode();
        let total = self.total_blocks();
        let all_slots = self.read_all_slots()?;
        let Some(keys) = self.load_keys()? else {
            return Ok(());
        };

        struct Candidate {
            buf: Vec<u8>,
            declared: Option<usize>,
            slot: usize,
        }

        // Reconciliation: walk the slot map, clearing bogus and duplicate
        // entries. Cleared slots keep their buffer as an unattributed
        // candidate; the verification pass may still recover them by
        // content.
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut claimed = vec![false; total];
        let mut declared_count = 0usize;
        {
            let mut state = self.state.lock();
            if state.succeeded || state.failed {
                return Ok(());
            }
            let mut changed = false;
            for (slot, buf) in all_slots.into_iter().enumerate() {
                let declared = state.slot_block[slot];
                if declared == EMPTY_SLOT {
                    continue;
                }
                if declared < 0 || declared as usize >= total {
                    warn!(
                        "event=slot_block_bogus segment={} slot={} block={}",
                        self.segment_index, slot, declared
                    );
                    state.slot_block[slot] = EMPTY_SLOT;
                    changed = true;
                    candidates.push(Candidate {
                        buf,
                        declared: None,
                        slot,
                    });
                    continue;
                }
                let number = declared as usize;
                if claimed[number] {
                    warn!(
                        "event=slot_block_duplicate segment={} slot={} block={}",
                        self.segment_index, slot, number
                    );
                    state.slot_block[slot] = EMPTY_SLOT;
                    changed = true;
                    candidates.push(Candidate {
                        buf,
                        declared: None,
                        slot,
                    });
                    continue;
                }
                claimed[number] = true;
                declared_count += 1;
                candidates.push(Candidate {
                    buf,
                    declared: Some(number),
                    slot,
                });
            }
            if declared_count < fetched_blocks {
                // Not decodable after all; reconcile the bitmap with what
                // the slot map actually holds before giving up.
                let mut count = 0usize;
                for number in 0..total {
                    if !claimed[number] && state.present[number] {
                        state.present[number] = false;
                        changed = true;
                    }
                    if state.present[number] {
                        count += 1;
                    }
                }
                if count != state.present_count {
                    warn!(
                        "event=present_count_corrected segment={} from={} to={}",
                        self.segment_index, state.present_count, count
                    );
                    state.present_count = count;
                    changed = true;
                }
            }
            if changed {
                state.metadata_dirty = true;
            }
        }
        if declared_count < fetched_blocks {
            self.write_metadata(false)?;
            return Ok(());
        }

        // Verification: re-encode every candidate and compare the resulting
        // content key against the one the slot map claims. Runs without the
        // segment lock; crypto is slow.
        let common_key = keys.common_crypto_key().copied();
        let algorithm = keys.algorithm();
        let mut valid: Vec<(usize, Vec<u8>)> = Vec::new();
        for candidate in candidates {
            let crypto_key = match candidate.declared {
                Some(number) => keys.key_at(number).crypto_key,
                // An unattributed slot can only be re-encoded when every
                // block shares the splitfile crypto key.
                None => match common_key {
                    Some(key) => key,
                    None => continue,
                },
            };
            let encoded = match codec::encode_block(&candidate.buf, &crypto_key, algorithm) {
                Ok(encoded) => encoded,
                Err(err) => {
                    error!(
                        "event=slot_reencode_failed segment={} slot={} error={}",
                        self.segment_index, candidate.slot, err
                    );
                    self.clear_slot(candidate.slot, candidate.declared);
                    continue;
                }
            };
            if let Some(number) = candidate.declared {
                if keys.key_at(number).routing == encoded.key.routing {
                    valid.push((number, candidate.buf));
                    continue;
                }
            }
            match keys.block_number_of(&encoded.key.routing, None) {
                Some(actual) if !claimed[actual] => {
                    // The slot holds a real block, just not the one the
                    // status region claimed. Adopt it.
                    warn!(
                        "event=slot_block_reassigned segment={} slot={} from={:?} to={}",
                        self.segment_index, candidate.slot, candidate.declared, actual
                    );
                    claimed[actual] = true;
                    self.reassign_slot(candidate.slot, candidate.declared, actual);
                    valid.push((actual, candidate.buf));
                }
                Some(actual) => {
                    error!(
                        "event=slot_block_conflict segment={} slot={} block={}",
                        self.segment_index, candidate.slot, actual
                    );
                    self.clear_slot(candidate.slot, candidate.declared);
                }
                None => {
                    error!(
                        "event=slot_contents_corrupt segment={} slot={} declared={:?}",
                        self.segment_index, candidate.slot, candidate.declared
                    );
                    self.clear_slot(candidate.slot, candidate.declared);
                }
            }
        }
        if valid.len() < fetched_blocks {
            self.write_metadata(false)?;
            return Ok(());
        }

        // Lay the validated buffers out by block number and FEC-decode any
        // missing data or cross-check block.
        let mut data: Vec<Vec<u8>> = vec![Vec::new(); fetched_blocks];
        let mut check: Vec<Vec<u8>> = vec![Vec::new(); self.check_blocks];
        let mut data_present = vec![false; fetched_blocks];
        let mut check_present = vec![false; self.check_blocks];
        let mut valid_data = 0usize;
        for (number, buf) in valid {
            if number < fetched_blocks {
                data[number] = buf;
                data_present[number] = true;
                valid_data += 1;
            } else {
                check[number - fetched_blocks] = buf;
                check_present[number - fetched_blocks] = true;
            }
        }
        for buf in data.iter_mut().chain(check.iter_mut()) {
            if buf.is_empty() {
                *buf = vec![0u8; BLOCK_DATA_LENGTH];
            }
        }
        if valid_data < fetched_blocks {
            debug!("event=segment_fec_decode segment={}", self.segment_index);
            if let Err(err) = self.shared.fec().decode(
                &mut data,
                &mut check,
                &data_present,
                &check_present,
                BLOCK_DATA_LENGTH,
            ) {
                error!(
                    "event=segment_fec_failed segment={} error={}",
                    self.segment_index, err
                );
                self.fail();
                self.write_metadata(true)?;
                return Ok(());
            }
        }

        // Commit: every data and cross-check block into its canonical slot.
        {
            let mut state = self.state.lock();
            if state.succeeded || state.failed {
                return Ok(());
            }
            let _raf = self.shared.raf().open_lock();
            for (number, buf) in data.iter().enumerate() {
                self.write_slot(number, buf)?;
            }
            for number in 0..fetched_blocks {
                state.slot_block[number] = number as i16;
                state.present[number] = true;
            }
            for number in fetched_blocks..total {
                state.present[number] = false;
            }
            state.present_count = fetched_blocks;
            state.succeeded = true;
            state.metadata_dirty = true;
        }
        self.shared.callbacks().finished_success(self.segment_index);
        self.trigger_all_cross_callbacks();

        // Re-encode the missing check blocks and heal everything the
        // network was asked for but never delivered.
        let tried = self.state.lock().tried.clone();
        match self
            .shared
            .fec()
            .encode(&data, &mut check, &check_present, BLOCK_DATA_LENGTH)
        {
            Ok(()) => {
                self.queue_heals(&keys, &data, &check, &data_present, &check_present, &tried);
            }
            Err(err) => {
                // Data is already committed; healing is best effort.
                warn!(
                    "event=segment_fec_encode_failed segment={} error={}",
                    self.segment_index, err
                );
            }
        }

        self.write_metadata(true)?;
        self.state.lock().finished = true;
        self.shared
            .callbacks()
            .finished_encoding(self.segment_index);
        Ok(())
    }

    /// Drop a slot whose contents failed verification. Guarded: only
    /// applies if no concurrent arrival has re-used the slot meanwhile.
    fn clear_slot(&self, slot: usize, declared: Option<usize>) {
        let mut state = self.state.lock();
        let expected = declared.map(|n| n as i16).unwrap_or(EMPTY_SLOT);
        if state.slot_block[slot] != expected {
            return;
        }
        state.slot_block[slot] = EMPTY_SLOT;
        if let Some(number) = declared {
            if state.present[number] {
                state.present[number] = false;
                state.present_count -= 1;
            }
        }
        state.metadata_dirty = true;
    }

    /// Re-point a slot at the block its contents actually encode.
    fn reassign_slot(&self, slot: usize, declared: Option<usize>, actual: usize) {
        let mut state = self.state.lock();
        let expected = declared.map(|n| n as i16).unwrap_or(EMPTY_SLOT);
        if state.slot_block[slot] != expected {
            return;
        }
        state.slot_block[slot] = actual as i16;
        if let Some(number) = declared {
            if state.present[number] {
                state.present[number] = false;
                state.present_count -= 1;
            }
        }
        if !state.present[actual] {
            state.present[actual] = true;
            state.present_count += 1;
        }
        state.metadata_dirty = true;
    }

    fn queue_heals(
        &self,
        keys: &SegmentKeyTable,
        data: &[Vec<u8>],
        check: &[Vec<u8>],
        data_present: &[bool],
        check_present: &[bool],
        tried: &[bool],
    ) {
        let fetched = self.blocks_for_decode();
        for (number, buf) in data.iter().enumerate() {
            if !data_present[number] && tried[number] {
                self.queue_heal(keys, number, buf);
            }
        }
        for (index, buf) in check.iter().enumerate() {
            if !check_present[index] && tried[fetched + index] {
                self.queue_heal(keys, fetched + index, buf);
            }
        }
    }

    fn queue_heal(&self, keys: &SegmentKeyTable, block_number: usize, data: &[u8]) {
        let (crypto_key, algorithm): ([u8; CRYPTO_KEY_LENGTH], CryptoAlgorithm) =
            match keys.common_crypto_key() {
                Some(shared) => (*shared, keys.algorithm()),
                None => {
                    let key = keys.key_at(block_number);
                    (key.crypto_key, key.algorithm)
                }
            };
        self.shared
            .healer()
            .queue_heal(data.to_vec(), crypto_key, algorithm);
    }

    fn trigger_all_cross_callbacks(&self) {
        let pending: Vec<usize> = {
            let mut state = self.state.lock();
            state
                .cross_by_block
                .iter_mut()
                .filter_map(Option::take)
                .collect()
        };
        for cross_index in pending {
            self.shared
                .notify_cross_segment(cross_index, self.segment_index);
        }
    }

    // ---- status metadata ----------------------------------------------

    /// Serialize and write the status region. With `force` false this is a
    /// no-op unless an update marked the metadata dirty.
    pub fn write_metadata(&self, force: bool) -> Result<bool, StoreError> {
        let buf = {
            let mut state = self.state.lock();
            if !(force || state.metadata_dirty) {
                return Ok(false);
            }
            state.metadata_dirty = false;
            encode_status(
                &state.slot_block,
                state.retries.as_deref(),
                &state.tried,
            )
        };
        debug_assert_eq!(buf.len(), self.status_length);
        let _lock = self.shared.raf().open_lock();
        self.shared.raf().pwrite(self.status_offset, &buf)?;
        Ok(true)
    }

    /// Re-read the status region and rebuild the in-memory state from it.
    /// The presence bitmap is derived from the slot map; the decode-time
    /// reconciliation re-checks both against the actual block bytes.
    pub fn restore(&self) -> Result<(), StoreError> {
        let mut buf = vec![0u8; self.status_length];
        {
            let _lock = self.shared.raf().open_lock();
            self.shared.raf().pread(self.status_offset, &mut buf)?;
        }
        let fetched = self.blocks_for_decode();
        let total = self.total_blocks();
        let (slot_block, retries, tried) = decode_status(&buf, fetched, total, self.track_retries);
        let mut state = self.state.lock();
        let mut present = vec![false; total];
        let mut count = 0usize;
        for &entry in &slot_block {
            if entry < 0 {
                continue;
            }
            let number = entry as usize;
            if number < total && !present[number] {
                present[number] = true;
                count += 1;
            }
        }
        state.slot_block = slot_block;
        state.retries = retries;
        state.tried = tried;
        state.present = present;
        state.present_count = count;
        Ok(())
    }

    /// Emit the fixed per-segment descriptor: lengths, not offsets.
    pub fn write_fixed_metadata(&self, out: &mut dyn Write) -> Result<(), StoreError> {
        out.write_all(&SEGMENT_FORMAT_VERSION.to_be_bytes())?;
        out.write_all(&(self.data_blocks as u32).to_be_bytes())?;
        out.write_all(&(self.cross_check_blocks as u32).to_be_bytes())?;
        out.write_all(&(self.check_blocks as u32).to_be_bytes())?;
        out.write_all(&(self.status_padded_length as u32).to_be_bytes())?;
        out.write_all(&(self.key_list_length as u32).to_be_bytes())?;
        Ok(())
    }

    // ---- block data region --------------------------------------------

    fn block_offset(&self, slot: usize) -> u64 {
        self.block_data_offset + (slot * BLOCK_DATA_LENGTH) as u64
    }

    fn read_slot(&self, slot: usize) -> Result<Vec<u8>, StoreError> {
        debug_assert!(slot < self.blocks_for_decode());
        let mut buf = vec![0u8; BLOCK_DATA_LENGTH];
        self.shared.raf().pread(self.block_offset(slot), &mut buf)?;
        Ok(buf)
    }

    fn read_all_slots(&self) -> Result<Vec<Vec<u8>>, StoreError> {
        (0..self.blocks_for_decode())
            .map(|slot| self.read_slot(slot))
            .collect()
    }

    /// Caller holds the RAF lock (and the segment lock on mutation paths).
    fn write_slot(&self, slot: usize, data: &[u8]) -> Result<(), StoreError> {
        debug_assert_eq!(data.len(), BLOCK_DATA_LENGTH);
        debug_assert!(slot < self.blocks_for_decode());
        self.shared.raf().pwrite(self.block_offset(slot), data)?;
        Ok(())
    }

    /// Stream the decoded payload: the first `data_blocks` slots in order.
    /// Only meaningful after a successful decode laid the slots out
    /// canonically; the parent checks that before calling.
    pub(crate) fn write_to_inner(&self, out: &mut dyn Write) -> Result<(), StoreError> {
        for slot in 0..self.data_blocks {
            let buf = self.read_slot(slot)?;
            out.write_all(&buf)?;
        }
        Ok(())
    }

    // ---- cross-segment hooks ------------------------------------------

    /// Read the current bytes of a block, wherever its slot is. `None` if
    /// no slot claims the block.
    pub(crate) fn read_block_copy(
        &self,
        block_number: usize,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let slot = {
            let state = self.state.lock();
            state
                .slot_block
                .iter()
                .position(|&entry| entry == block_number as i16)
        };
        match slot {
            Some(slot) => Ok(Some(self.read_slot(slot)?)),
            None => Ok(None),
        }
    }

    /// Deterministically pick a data block for a cross-segment: a bounded
    /// random probe, then a linear scan from the last probe position. The
    /// probe count is part of the wire format and must not change.
    pub fn allocate_cross_data_block<R: Rng>(
        &self,
        cross_index: usize,
        rng: &mut R,
    ) -> Option<usize> {
        let size = self.data_blocks;
        let mut state = self.state.lock();
        if state.cross_data_allocated == size {
            return None;
        }
        let mut x = 0;
        for _ in 0..CROSS_ALLOCATION_PROBES {
            x = rng.gen_range(0..size);
            if state.cross_by_block[x].is_none() {
                state.cross_by_block[x] = Some(cross_index);
                state.cross_data_allocated += 1;
                return Some(x);
            }
        }
        for _ in 0..size {
            x += 1;
            if x == size {
                x = 0;
            }
            if state.cross_by_block[x].is_none() {
                state.cross_by_block[x] = Some(cross_index);
                state.cross_data_allocated += 1;
                return Some(x);
            }
        }
        error!(
            "event=cross_data_allocation_exhausted segment={} allocated={}",
            self.segment_index, state.cross_data_allocated
        );
        None
    }

    /// Deterministically pick a cross-check block for a cross-segment, from
    /// the `data_blocks..data_blocks+cross_check_blocks` range.
    pub fn allocate_cross_check_block<R: Rng>(
        &self,
        cross_index: usize,
        rng: &mut R,
    ) -> Option<usize> {
        let start = self.data_blocks;
        let end = self.data_blocks + self.cross_check_blocks;
        let mut state = self.state.lock();
        if state.cross_check_allocated == self.cross_check_blocks {
            return None;
        }
        let mut x = end - (1 + rng.gen_range(0..self.cross_check_blocks));
        for _ in 0..self.cross_check_blocks {
            x += 1;
            if x == end {
                x = start;
            }
            if state.cross_by_block[x].is_none() {
                state.cross_by_block[x] = Some(cross_index);
                state.cross_check_allocated += 1;
                return Some(x);
            }
        }
        error!(
            "event=cross_check_allocation_exhausted segment={} allocated={}",
            self.segment_index, state.cross_check_allocated
        );
        None
    }
}

fn find_free_slot(slot_block: &[i16]) -> Option<usize> {
    slot_block.iter().position(|&entry| entry == EMPTY_SLOT)
}

/// Length of the on-disk status region for this geometry.
pub fn stored_status_length(
    data_blocks: usize,
    check_blocks: usize,
    cross_check_blocks: usize,
    track_retries: bool,
) -> usize {
    let fetched = data_blocks + cross_check_blocks;
    let total = data_blocks + check_blocks + cross_check_blocks;
    fetched * 2 + if track_retries { total * 4 } else { 0 } + total
}

/// Status length rounded for on-disk placement. Currently identical to the
/// unpadded length; kept separate so a later version can align regions
/// without changing readers.
pub fn padded_stored_status_length(
    data_blocks: usize,
    check_blocks: usize,
    cross_check_blocks: usize,
    track_retries: bool,
) -> usize {
    stored_status_length(data_blocks, check_blocks, cross_check_blocks, track_retries)
}

fn encode_status(slot_block: &[i16], retries: Option<&[u32]>, tried: &[bool]) -> Vec<u8> {
    let mut buf =
        Vec::with_capacity(slot_block.len() * 2 + retries.map_or(0, |r| r.len() * 4) + tried.len());
    for &entry in slot_block {
        buf.extend_from_slice(&entry.to_be_bytes());
    }
    if let Some(retries) = retries {
        for &count in retries {
            buf.extend_from_slice(&count.to_be_bytes());
        }
    }
    for &flag in tried {
        buf.push(flag as u8);
    }
    buf
}

fn decode_status(
    buf: &[u8],
    fetched_blocks: usize,
    total_blocks: usize,
    track_retries: bool,
) -> (Vec<i16>, Option<Vec<u32>>, Vec<bool>) {
    debug_assert_eq!(
        buf.len(),
        fetched_blocks * 2 + if track_retries { total_blocks * 4 } else { 0 } + total_blocks
    );
    let mut cursor = 0usize;
    let mut slot_block = Vec::with_capacity(fetched_blocks);
    for _ in 0..fetched_blocks {
        slot_block.push(i16::from_be_bytes([buf[cursor], buf[cursor + 1]]));
        cursor += 2;
    }
    let retries = track_retries.then(|| {
        let mut retries = Vec::with_capacity(total_blocks);
        for _ in 0..total_blocks {
            retries.push(u32::from_be_bytes([
                buf[cursor],
                buf[cursor + 1],
                buf[cursor + 2],
                buf[cursor + 3],
            ]));
            cursor += 4;
        }
        retries
    });
    let tried = buf[cursor..cursor + total_blocks]
        .iter()
        .map(|&b| b != 0)
        .collect();
    (slot_block, retries, tried)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_lengths_match_layout() {
        // 5 data + 1 cross + 3 check, retries tracked: 6 slots, 9 blocks.
        assert_eq!(stored_status_length(5, 3, 1, true), 6 * 2 + 9 * 4 + 9);
        assert_eq!(stored_status_length(5, 3, 1, false), 6 * 2 + 9);
        assert_eq!(
            padded_stored_status_length(5, 3, 1, true),
            stored_status_length(5, 3, 1, true)
        );
    }

    #[test]
    fn status_round_trips_with_retries() {
        let slot_block = vec![2i16, -1, 0];
        let retries = vec![0u32, 8, 0, 1, 300_000];
        let tried = vec![false, true, false, true, true];
        let buf = encode_status(&slot_block, Some(&retries), &tried);
        assert_eq!(buf.len(), stored_status_length(2, 2, 1, true));
        let (slots, restored_retries, restored_tried) = decode_status(&buf, 3, 5, true);
        assert_eq!(slots, slot_block);
        assert_eq!(restored_retries.as_deref(), Some(&retries[..]));
        assert_eq!(restored_tried, tried);
    }

    #[test]
    fn status_round_trips_without_retries() {
        let slot_block = vec![-1i16, 4];
        let tried = vec![true, false, false, true, false];
        let buf = encode_status(&slot_block, None, &tried);
        let (slots, retries, restored_tried) = decode_status(&buf, 2, 5, false);
        assert_eq!(slots, slot_block);
        assert!(retries.is_none());
        assert_eq!(restored_tried, tried);
    }

    #[test]
    fn empty_slot_marker_survives_the_wire() {
        let buf = encode_status(&[-1i16; 4], None, &[false; 6]);
        let (slots, _, _) = decode_status(&buf, 4, 6, false);
        assert!(slots.iter().all(|&entry| entry == EMPTY_SLOT));
    }
}
