use crate::block::codec::{
    ClientKey, CryptoAlgorithm, RoutingKey, CRYPTO_KEY_LENGTH, ROUTING_KEY_LENGTH,
};
use crc32fast::Hasher as Crc32Hasher;
use thiserror::Error;

const FLAG_COMMON_CRYPTO_KEY: u8 = 0x01;
const HEADER_LENGTH: usize = 2;
const CHECKSUM_LENGTH: usize = 4;

/// Immutable table of the expected content keys for one segment: the keys
/// for the data and cross-check blocks first, then the FEC check blocks.
/// Built once when the splitfile descriptor is constructed and thereafter
/// only read; the parent may drop cached instances under memory pressure
/// and re-materialize them from the on-disk key list region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentKeyTable {
    data_keys: Vec<ClientKey>,
    check_keys: Vec<ClientKey>,
    common_crypto_key: Option<[u8; CRYPTO_KEY_LENGTH]>,
    algorithm: CryptoAlgorithm,
}

impl SegmentKeyTable {
    /// Table in which every block carries its own crypto key.
    pub fn new(
        data_keys: Vec<ClientKey>,
        check_keys: Vec<ClientKey>,
    ) -> Result<Self, KeyTableError> {
        Self::build(data_keys, check_keys, false)
    }

    /// Table for a splitfile whose blocks all share one crypto key. The
    /// shared key is stored once in the serialized form, and makes
    /// content-probing of unattributed slots possible during decode.
    pub fn with_common_crypto_key(
        data_keys: Vec<ClientKey>,
        check_keys: Vec<ClientKey>,
    ) -> Result<Self, KeyTableError> {
        Self::build(data_keys, check_keys, true)
    }

    fn build(
        data_keys: Vec<ClientKey>,
        check_keys: Vec<ClientKey>,
        common: bool,
    ) -> Result<Self, KeyTableError> {
        let first = data_keys
            .first()
            .or_else(|| check_keys.first())
            .ok_or(KeyTableError::Empty)?;
        let algorithm = first.algorithm;
        let common_crypto_key = common.then_some(first.crypto_key);
        for key in data_keys.iter().chain(check_keys.iter()) {
            if key.algorithm != algorithm {
                return Err(KeyTableError::MixedAlgorithms);
            }
            if let Some(shared) = common_crypto_key {
                if key.crypto_key != shared {
                    return Err(KeyTableError::MixedCryptoKeys);
                }
            }
        }
        Ok(Self {
            data_keys,
            check_keys,
            common_crypto_key,
            algorithm,
        })
    }

    pub fn data_block_count(&self) -> usize {
        self.data_keys.len()
    }

    pub fn check_block_count(&self) -> usize {
        self.check_keys.len()
    }

    pub fn total_blocks(&self) -> usize {
        self.data_keys.len() + self.check_keys.len()
    }

    pub fn algorithm(&self) -> CryptoAlgorithm {
        self.algorithm
    }

    /// The splitfile-wide crypto key, if this table uses one.
    pub fn common_crypto_key(&self) -> Option<&[u8; CRYPTO_KEY_LENGTH]> {
        self.common_crypto_key.as_ref()
    }

    /// Expected key for a block number. Data and cross-check blocks come
    /// first, check blocks after.
    pub fn key_at(&self, block_number: usize) -> &ClientKey {
        if block_number < self.data_keys.len() {
            &self.data_keys[block_number]
        } else {
            &self.check_keys[block_number - self.data_keys.len()]
        }
    }

    /// Which block number does this routing key belong to, if any? Indices
    /// whose bit is set in `ignore` are skipped, so a block already present
    /// is not matched a second time.
    pub fn block_number_of(
        &self,
        routing: &RoutingKey,
        ignore: Option<&[bool]>,
    ) -> Option<usize> {
        let keys = self.data_keys.iter().chain(self.check_keys.iter());
        for (index, key) in keys.enumerate() {
            if let Some(mask) = ignore {
                if mask.get(index).copied().unwrap_or(false) {
                    continue;
                }
            }
            if key.routing == *routing {
                return Some(index);
            }
        }
        None
    }

    /// Serialize the key bytes (header plus entries, no checksum).
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.algorithm.wire_id());
        let flags = if self.common_crypto_key.is_some() {
            FLAG_COMMON_CRYPTO_KEY
        } else {
            0
        };
        out.push(flags);
        if let Some(shared) = &self.common_crypto_key {
            out.extend_from_slice(shared);
        }
        for key in self.data_keys.iter().chain(self.check_keys.iter()) {
            out.extend_from_slice(&key.routing.0);
            if self.common_crypto_key.is_none() {
                out.extend_from_slice(&key.crypto_key);
            }
        }
    }

    /// Serialize the key bytes followed by a big-endian CRC-32 over them.
    pub fn write_with_checksum(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(stored_key_list_length(
            self.data_keys.len(),
            self.check_keys.len(),
            self.common_crypto_key.is_some(),
        ));
        self.write_to(&mut out);
        let mut hasher = Crc32Hasher::new();
        hasher.update(&out);
        out.extend_from_slice(&hasher.finalize().to_be_bytes());
        out
    }

    /// Parse a serialized table, verifying the trailing checksum. The block
    /// counts are construction parameters of the owning segment, so a
    /// mismatch between them and the buffer length is corruption.
    pub fn read_from(
        buf: &[u8],
        data_blocks: usize,
        check_blocks: usize,
    ) -> Result<Self, KeyTableError> {
        if buf.len() < HEADER_LENGTH + CHECKSUM_LENGTH {
            return Err(KeyTableError::Truncated {
                observed: buf.len(),
                needed: HEADER_LENGTH + CHECKSUM_LENGTH,
            });
        }
        let algorithm = CryptoAlgorithm::from_wire_id(buf[0])
            .ok_or(KeyTableError::UnknownAlgorithm(buf[0]))?;
        let common = buf[1] & FLAG_COMMON_CRYPTO_KEY != 0;
        let needed = stored_key_list_length(data_blocks, check_blocks, common);
        if buf.len() < needed {
            return Err(KeyTableError::Truncated {
                observed: buf.len(),
                needed,
            });
        }
        let buf = &buf[..needed];
        let (body, checksum) = buf.split_at(buf.len() - CHECKSUM_LENGTH);
        let expected = u32::from_be_bytes([checksum[0], checksum[1], checksum[2], checksum[3]]);
        let mut hasher = Crc32Hasher::new();
        hasher.update(body);
        let observed = hasher.finalize();
        if observed != expected {
            return Err(KeyTableError::ChecksumMismatch { expected, observed });
        }

        let mut cursor = HEADER_LENGTH;
        let common_crypto_key = if common {
            let mut shared = [0u8; CRYPTO_KEY_LENGTH];
            shared.copy_from_slice(&body[cursor..cursor + CRYPTO_KEY_LENGTH]);
            cursor += CRYPTO_KEY_LENGTH;
            Some(shared)
        } else {
            None
        };
        let mut read_entry = |cursor: &mut usize| -> ClientKey {
            let mut routing = [0u8; ROUTING_KEY_LENGTH];
            routing.copy_from_slice(&body[*cursor..*cursor + ROUTING_KEY_LENGTH]);
            *cursor += ROUTING_KEY_LENGTH;
            let crypto_key = match common_crypto_key {
                Some(shared) => shared,
                None => {
                    let mut key = [0u8; CRYPTO_KEY_LENGTH];
                    key.copy_from_slice(&body[*cursor..*cursor + CRYPTO_KEY_LENGTH]);
                    *cursor += CRYPTO_KEY_LENGTH;
                    key
                }
            };
            ClientKey {
                routing: RoutingKey(routing),
                crypto_key,
                algorithm,
            }
        };
        let data_keys = (0..data_blocks).map(|_| read_entry(&mut cursor)).collect();
        let check_keys = (0..check_blocks).map(|_| read_entry(&mut cursor)).collect();
        Ok(Self {
            data_keys,
            check_keys,
            common_crypto_key,
            algorithm,
        })
    }
}

/// Serialized length of the key table itself, a pure function of the
/// segment geometry and key mode.
pub fn stored_key_table_length(
    data_blocks: usize,
    check_blocks: usize,
    common_crypto_key: bool,
) -> usize {
    let per_entry = ROUTING_KEY_LENGTH
        + if common_crypto_key {
            0
        } else {
            CRYPTO_KEY_LENGTH
        };
    let shared = if common_crypto_key {
        CRYPTO_KEY_LENGTH
    } else {
        0
    };
    HEADER_LENGTH + shared + (data_blocks + check_blocks) * per_entry
}

/// Length of the on-disk key list region: the table plus its checksum.
pub fn stored_key_list_length(
    data_blocks: usize,
    check_blocks: usize,
    common_crypto_key: bool,
) -> usize {
    stored_key_table_length(data_blocks, check_blocks, common_crypto_key) + CHECKSUM_LENGTH
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyTableError {
    #[error("key list checksum mismatch: expected {expected:#010x}, observed {observed:#010x}")]
    ChecksumMismatch { expected: u32, observed: u32 },
    #[error("key list truncated: {observed} bytes, needed {needed}")]
    Truncated { observed: usize, needed: usize },
    #[error("unknown crypto algorithm id {0}")]
    UnknownAlgorithm(u8),
    #[error("key table has no entries")]
    Empty,
    #[error("key table mixes crypto algorithms")]
    MixedAlgorithms,
    #[error("common-key table contains differing crypto keys")]
    MixedCryptoKeys,
}
