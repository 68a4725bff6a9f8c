//! Content-hash-keyed block handling: the single-block codec and the
//! per-segment expected-key tables.

pub mod codec;
pub mod keys;

pub use codec::{
    decode_block, encode_block, verify_block, BlockCodecError, ClientKey, CryptoAlgorithm,
    EncodedBlock, RoutingKey, BLOCK_CIPHERTEXT_LENGTH, BLOCK_DATA_LENGTH, BLOCK_TAG_LENGTH,
    CRYPTO_KEY_LENGTH, ROUTING_KEY_LENGTH,
};
pub use keys::{
    stored_key_list_length, stored_key_table_length, KeyTableError, SegmentKeyTable,
};
