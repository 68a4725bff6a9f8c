//! Per-segment fetch storage engine for content-addressed splitfiles.
//!
//! A splitfile is a large payload broken into fixed-size encrypted blocks,
//! each addressable by a content hash. Blocks within a segment are
//! protected by a systematic FEC code; larger files additionally protect
//! blocks across segments through a second FEC layer. This crate accepts
//! candidate blocks from an unreliable network, verifies them against
//! their expected content keys, persists them to a shared random-access
//! file, reconstructs missing blocks once enough have arrived, and emits
//! healing blocks for re-insertion. Its own on-disk metadata is treated as
//! untrusted and is re-checked opportunistically, so the engine tolerates
//! (though is not immune to) disk corruption.
#![deny(unreachable_pub)]
#![deny(unused_must_use)]

pub mod block;
pub mod cross_segment;
pub mod error;
pub mod fec;
pub mod jobs;
pub mod raf;
pub mod segment;
pub mod store;

pub use block::{
    decode_block, encode_block, stored_key_list_length, stored_key_table_length, verify_block,
    BlockCodecError, ClientKey, CryptoAlgorithm, EncodedBlock, KeyTableError, RoutingKey,
    SegmentKeyTable, BLOCK_CIPHERTEXT_LENGTH, BLOCK_DATA_LENGTH, BLOCK_TAG_LENGTH,
    CRYPTO_KEY_LENGTH, ROUTING_KEY_LENGTH,
};
pub use cross_segment::{CrossBlockRef, CrossSegmentStorage};
pub use error::StoreError;
pub use fec::{FecCodec, FecError, ReedSolomonCodec};
pub use jobs::{JobPriority, JobRunnerConfig, MemoryChunk, MemoryLimitedJobRunner};
pub use raf::{LockableRandomAccessFile, RafError, RafLock};
pub use segment::{
    padded_stored_status_length, stored_status_length, SegmentLayout, SegmentStorage,
    SEGMENT_FORMAT_VERSION,
};
pub use store::{
    CrossSegmentGeometry, FetchCallbacks, Healer, SegmentGeometry, SplitFileStore, StoreConfig,
    StoreParams,
};
