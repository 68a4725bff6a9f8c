//! Cross-segment FEC storage. A cross-segment protects a handful of blocks
//! drawn from several segments; once enough of them arrive it reconstructs
//! the rest and hands each one back to the segment that owns it, which can
//! cascade into further segment decodes.

use crate::block::codec::{self, BLOCK_DATA_LENGTH};
use crate::error::StoreError;
use crate::jobs::JobPriority;
use crate::store::StoreShared;
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::sync::Arc;

/// Reference to a block owned by a segment: `(segment index, block number
/// within that segment)`. Cross-segments never own block data themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrossBlockRef {
    pub segment: usize,
    pub block_number: usize,
}

struct CrossState {
    /// Per-entry "the owning segment has this block", refreshed on every
    /// notification and re-checked by the decode job.
    found: Vec<bool>,
    found_count: usize,
    decode_in_flight: bool,
    succeeded: bool,
    failed: bool,
}

/// One cross-segment: `data_blocks` data entries plus `check_blocks` check
/// entries, all resolved against parent-owned segments by index.
pub struct CrossSegmentStorage {
    shared: Arc<StoreShared>,
    cross_index: usize,
    data_blocks: usize,
    check_blocks: usize,
    blocks: Vec<CrossBlockRef>,
    state: Mutex<CrossState>,
}

impl CrossSegmentStorage {
    pub(crate) fn new(
        shared: Arc<StoreShared>,
        cross_index: usize,
        data_blocks: usize,
        check_blocks: usize,
        blocks: Vec<CrossBlockRef>,
    ) -> Result<Self, StoreError> {
        if data_blocks == 0 || blocks.len() != data_blocks + check_blocks {
            return Err(StoreError::Other(format!(
                "cross-segment {} has {} block refs for {} data + {} check",
                cross_index,
                blocks.len(),
                data_blocks,
                check_blocks
            )));
        }
        Ok(Self {
            shared,
            cross_index,
            data_blocks,
            check_blocks,
            state: Mutex::new(CrossState {
                found: vec![false; blocks.len()],
                found_count: 0,
                decode_in_flight: false,
                succeeded: false,
                failed: false,
            }),
            blocks,
        })
    }

    pub fn cross_index(&self) -> usize {
        self.cross_index
    }

    pub fn data_block_count(&self) -> usize {
        self.data_blocks
    }

    pub fn check_block_count(&self) -> usize {
        self.check_blocks
    }

    pub fn block_refs(&self) -> &[CrossBlockRef] {
        &self.blocks
    }

    pub fn has_succeeded(&self) -> bool {
        self.state.lock().succeeded
    }

    pub fn has_failed(&self) -> bool {
        self.state.lock().failed
    }

    pub fn found_count(&self) -> usize {
        self.state.lock().found_count
    }

    pub(crate) fn fail(&self) {
        let mut state = self.state.lock();
        if state.succeeded || state.failed {
            return;
        }
        state.failed = true;
    }

    /// A segment we reference has accepted (or decoded) a relevant block.
    /// Refresh the found-set for that segment's entries and start a decode
    /// once enough entries are present.
    pub fn on_fetched_relevant_block(self: &Arc<Self>, segment_index: usize) {
        self.refresh(Some(segment_index));
    }

    /// Recompute the whole found-set; used when resuming from disk.
    pub(crate) fn refresh_found(self: &Arc<Self>) {
        self.refresh(None);
    }

    fn refresh(self: &Arc<Self>, only_segment: Option<usize>) {
        let start = {
            let mut state = self.state.lock();
            if state.succeeded || state.failed {
                return;
            }
            for (index, entry) in self.blocks.iter().enumerate() {
                if state.found[index] {
                    continue;
                }
                if only_segment.is_some_and(|segment| segment != entry.segment) {
                    continue;
                }
                let present = self
                    .shared
                    .segment(entry.segment)
                    .map(|segment| segment.has_block(entry.block_number))
                    .unwrap_or(false);
                if present {
                    state.found[index] = true;
                    state.found_count += 1;
                }
            }
            if state.found_count >= self.data_blocks && !state.decode_in_flight {
                state.decode_in_flight = true;
                true
            } else {
                false
            }
        };
        if start {
            self.queue_decode();
        }
    }

    fn queue_decode(self: &Arc<Self>) {
        let fec = self.shared.fec();
        let estimate = (self.blocks.len() * BLOCK_DATA_LENGTH) as u64
            + fec
                .max_memory_overhead_decode(self.data_blocks, self.check_blocks)
                .max(fec.max_memory_overhead_encode(self.data_blocks, self.check_blocks));
        let cross = self.clone();
        self.shared
            .jobs()
            .queue_job(estimate, JobPriority::Low, move |chunk| {
                if let Err(err) = cross.run_decode() {
                    error!(
                        "event=cross_decode_io_error cross={} error={}",
                        cross.cross_index, err
                    );
                    cross.shared.fail_on_disk_error(&err);
                }
                cross.state.lock().decode_in_flight = false;
                chunk.release();
                // Pick up blocks that arrived while this decode ran.
                cross.refresh_found();
            });
    }

    /// Read the slice from the owning segments, verify every block against
    /// its expected key, reconstruct whatever is missing, and push the
    /// reconstructed blocks back to their owners in ascending segment
    /// order.
    fn run_decode(&self) -> Result<(), StoreError> {
        {
            let state = self.state.lock();
            if state.succeeded || state.failed {
                return Ok(());
            }
        }
        let mut bufs: Vec<Option<Vec<u8>>> = Vec::with_capacity(self.blocks.len());
        for entry in &self.blocks {
            let buf = match self.shared.segment(entry.segment) {
                Some(segment) => segment.read_block_copy(entry.block_number)?,
                None => None,
            };
            bufs.push(buf);
        }

        let mut verified_count = 0usize;
        for (index, entry) in self.blocks.iter().enumerate() {
            if bufs[index].is_none() {
                continue;
            }
            let key = match self.shared.segment(entry.segment) {
                Some(segment) => segment.client_key_checked(entry.block_number)?,
                None => None,
            };
            let valid = match (&bufs[index], key) {
                (Some(buf), Some(key)) => codec::encode_block(buf, &key.crypto_key, key.algorithm)
                    .map(|encoded| encoded.key.routing == key.routing)
                    .unwrap_or(false),
                _ => false,
            };
            if valid {
                verified_count += 1;
            } else {
                warn!(
                    "event=cross_block_invalid cross={} segment={} block={}",
                    self.cross_index, entry.segment, entry.block_number
                );
                bufs[index] = None;
            }
        }
        {
            // Reconcile the found-set with what verification actually saw.
            let mut state = self.state.lock();
            if state.succeeded || state.failed {
                return Ok(());
            }
            let mut count = 0usize;
            for (index, buf) in bufs.iter().enumerate() {
                state.found[index] = buf.is_some();
                if buf.is_some() {
                    count += 1;
                }
            }
            state.found_count = count;
        }
        if verified_count < self.data_blocks {
            return Ok(());
        }

        let mut data: Vec<Vec<u8>> = Vec::with_capacity(self.data_blocks);
        let mut data_present = Vec::with_capacity(self.data_blocks);
        let mut check: Vec<Vec<u8>> = Vec::with_capacity(self.check_blocks);
        let mut check_present = Vec::with_capacity(self.check_blocks);
        for (index, buf) in bufs.into_iter().enumerate() {
            let (list, mask) = if index < self.data_blocks {
                (&mut data, &mut data_present)
            } else {
                (&mut check, &mut check_present)
            };
            match buf {
                Some(buf) => {
                    list.push(buf);
                    mask.push(true);
                }
                None => {
                    list.push(vec![0u8; BLOCK_DATA_LENGTH]);
                    mask.push(false);
                }
            }
        }

        if data_present.iter().any(|&present| !present) {
            debug!("event=cross_fec_decode cross={}", self.cross_index);
            if let Err(err) = self.shared.fec().decode(
                &mut data,
                &mut check,
                &data_present,
                &check_present,
                BLOCK_DATA_LENGTH,
            ) {
                error!(
                    "event=cross_fec_failed cross={} error={}",
                    self.cross_index, err
                );
                self.fail();
                return Ok(());
            }
        }
        let mut check_filled = true;
        if check_present.iter().any(|&present| !present) {
            if let Err(err) =
                self.shared
                    .fec()
                    .encode(&data, &mut check, &check_present, BLOCK_DATA_LENGTH)
            {
                warn!(
                    "event=cross_fec_encode_failed cross={} error={}",
                    self.cross_index, err
                );
                check_filled = false;
            }
        }

        // Hand every reconstructed block back to its owning segment,
        // ordered by segment index so concurrent cascades stay deadlock
        // free.
        let mut targets: Vec<(CrossBlockRef, &Vec<u8>)> = Vec::new();
        for index in 0..self.data_blocks {
            if !data_present[index] {
                targets.push((self.blocks[index], &data[index]));
            }
        }
        if check_filled {
            for index in 0..self.check_blocks {
                if !check_present[index] {
                    targets.push((self.blocks[self.data_blocks + index], &check[index]));
                }
            }
        }
        targets.sort_by_key(|(entry, _)| (entry.segment, entry.block_number));
        for (entry, buf) in targets {
            if let Some(segment) = self.shared.segment(entry.segment) {
                if segment.on_decoded_block(entry.block_number, buf)? {
                    debug!(
                        "event=cross_block_redistributed cross={} segment={} block={}",
                        self.cross_index, entry.segment, entry.block_number
                    );
                }
            }
        }

        {
            let mut state = self.state.lock();
            state.succeeded = true;
            for found in state.found.iter_mut() {
                *found = true;
            }
            state.found_count = state.found.len();
        }
        debug!("event=cross_segment_decoded cross={}", self.cross_index);
        Ok(())
    }
}
