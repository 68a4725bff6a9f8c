#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::SeedableRng;
use splitstor::{
    encode_block, CryptoAlgorithm, CrossSegmentGeometry, EncodedBlock, FecCodec, FetchCallbacks,
    Healer, ReedSolomonCodec, SegmentGeometry, SegmentKeyTable, SplitFileStore, StoreConfig,
    StoreParams, BLOCK_DATA_LENGTH, CRYPTO_KEY_LENGTH,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const COMMON_CRYPTO_KEY: [u8; CRYPTO_KEY_LENGTH] = [0x42; CRYPTO_KEY_LENGTH];
pub const RNG_SEED: u64 = 0x5eed_cafe;

/// Callback recorder standing in for the fetch orchestrator.
#[derive(Default)]
pub struct RecordingCallbacks {
    events: Mutex<Vec<(&'static str, usize)>>,
}

impl RecordingCallbacks {
    pub fn events(&self) -> Vec<(&'static str, usize)> {
        self.events.lock().unwrap().clone()
    }
}

impl FetchCallbacks for RecordingCallbacks {
    fn finished_success(&self, segment: usize) {
        self.events.lock().unwrap().push(("success", segment));
    }

    fn finished_encoding(&self, segment: usize) {
        self.events.lock().unwrap().push(("encoding", segment));
    }
}

/// Heal sink recorder.
#[derive(Default)]
pub struct RecordingHealer {
    heals: Mutex<Vec<(Vec<u8>, [u8; CRYPTO_KEY_LENGTH], CryptoAlgorithm)>>,
}

impl RecordingHealer {
    pub fn heal_count(&self) -> usize {
        self.heals.lock().unwrap().len()
    }

    pub fn healed_payloads(&self) -> Vec<Vec<u8>> {
        self.heals
            .lock()
            .unwrap()
            .iter()
            .map(|(data, _, _)| data.clone())
            .collect()
    }
}

impl Healer for RecordingHealer {
    fn queue_heal(
        &self,
        data: Vec<u8>,
        crypto_key: [u8; CRYPTO_KEY_LENGTH],
        algorithm: CryptoAlgorithm,
    ) {
        self.heals
            .lock()
            .unwrap()
            .push((data, crypto_key, algorithm));
    }
}

/// A deterministic full-size plaintext block.
pub fn plaintext_block(seed: u8) -> Vec<u8> {
    (0..BLOCK_DATA_LENGTH)
        .map(|i| seed ^ (i % 251) as u8)
        .collect()
}

/// Everything needed to feed one segment: the plaintexts, the encoded
/// blocks in block-number order, and the expected-key table.
pub struct SegmentPlan {
    /// Data and cross-check plaintexts, in block order (`M` entries).
    pub data: Vec<Vec<u8>>,
    /// FEC check plaintexts (`C` entries).
    pub check: Vec<Vec<u8>>,
    /// All `N` encoded blocks.
    pub blocks: Vec<EncodedBlock>,
    pub keys: SegmentKeyTable,
    pub cross_check_blocks: usize,
}

/// Build a segment plan: FEC-encode the check plaintexts over the data
/// (and cross-check) plaintexts, then CHK-encode everything under the
/// shared crypto key.
pub fn plan_segment(
    data_and_cross: Vec<Vec<u8>>,
    cross_check_blocks: usize,
    check_count: usize,
) -> SegmentPlan {
    let codec = ReedSolomonCodec::new();
    let mut check = vec![vec![0u8; BLOCK_DATA_LENGTH]; check_count];
    if check_count > 0 {
        codec
            .encode(
                &data_and_cross,
                &mut check,
                &vec![false; check_count],
                BLOCK_DATA_LENGTH,
            )
            .unwrap();
    }
    let blocks: Vec<EncodedBlock> = data_and_cross
        .iter()
        .chain(check.iter())
        .map(|plain| {
            encode_block(plain, &COMMON_CRYPTO_KEY, CryptoAlgorithm::Aes256GcmSha256).unwrap()
        })
        .collect();
    let fetched = data_and_cross.len();
    let keys = SegmentKeyTable::with_common_crypto_key(
        blocks[..fetched].iter().map(|b| b.key.clone()).collect(),
        blocks[fetched..].iter().map(|b| b.key.clone()).collect(),
    )
    .unwrap();
    SegmentPlan {
        data: data_and_cross,
        check,
        blocks,
        keys,
        cross_check_blocks,
    }
}

fn geometry(plan: &SegmentPlan, with_keys: bool) -> SegmentGeometry {
    SegmentGeometry {
        data_blocks: plan.data.len() - plan.cross_check_blocks,
        cross_check_blocks: plan.cross_check_blocks,
        check_blocks: plan.check.len(),
        common_crypto_key: true,
        keys: with_keys.then(|| plan.keys.clone()),
    }
}

pub struct StoreFixture {
    pub store: SplitFileStore,
    pub callbacks: Arc<RecordingCallbacks>,
    pub healer: Arc<RecordingHealer>,
}

fn params(
    path: &Path,
    plans: &[&SegmentPlan],
    cross_segments: Vec<CrossSegmentGeometry>,
    config: StoreConfig,
    with_keys: bool,
) -> (StoreParams, Arc<RecordingCallbacks>, Arc<RecordingHealer>) {
    let callbacks = Arc::new(RecordingCallbacks::default());
    let healer = Arc::new(RecordingHealer::default());
    let params = StoreParams {
        path: path.to_path_buf(),
        segments: plans.iter().map(|plan| geometry(plan, with_keys)).collect(),
        cross_segments,
        fec: Arc::new(ReedSolomonCodec::new()),
        callbacks: callbacks.clone(),
        healer: healer.clone(),
        config,
    };
    (params, callbacks, healer)
}

pub fn create_store(
    path: &Path,
    plans: &[&SegmentPlan],
    cross_segments: Vec<CrossSegmentGeometry>,
    config: StoreConfig,
) -> StoreFixture {
    let (params, callbacks, healer) = params(path, plans, cross_segments, config, true);
    let mut rng = StdRng::seed_from_u64(RNG_SEED);
    StoreFixture {
        store: SplitFileStore::create(params, &mut rng).unwrap(),
        callbacks,
        healer,
    }
}

/// Re-open an existing backing file. Key tables are deliberately omitted
/// so they are re-read (and checksum-verified) from disk.
pub fn open_store(
    path: &Path,
    plans: &[&SegmentPlan],
    cross_segments: Vec<CrossSegmentGeometry>,
    config: StoreConfig,
) -> StoreFixture {
    let (params, callbacks, healer) = params(path, plans, cross_segments, config, false);
    let mut rng = StdRng::seed_from_u64(RNG_SEED);
    StoreFixture {
        store: SplitFileStore::open(params, &mut rng).unwrap(),
        callbacks,
        healer,
    }
}

/// Route one of the plan's blocks into the store.
pub fn deliver(store: &SplitFileStore, plan: &SegmentPlan, block_number: usize) -> bool {
    let block = &plan.blocks[block_number];
    store
        .route_block(&block.key.routing, &block.ciphertext)
        .unwrap()
}

/// Poll until the predicate holds or the timeout expires.
pub fn wait_for(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    predicate()
}

pub fn wait_timeout() -> Duration {
    Duration::from_secs(10)
}
