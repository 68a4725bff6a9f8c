//! Forward-error-correction codec boundary. The engine only depends on the
//! `FecCodec` trait; the shipped implementation wraps a systematic
//! Reed-Solomon code over GF(2^8).

use reed_solomon_erasure::galois_8::ReedSolomon;
use thiserror::Error;

/// Systematic FEC codec over fixed-length blocks. Implementations are
/// stateless and shared by every segment of a splitfile.
pub trait FecCodec: Send + Sync {
    /// Fill every missing data block in `data` from the present data and
    /// check blocks. Present buffers are left untouched; missing buffers
    /// (presence bit false) are overwritten with the reconstructed payload.
    /// Succeeds whenever at least `data.len()` blocks are present overall.
    fn decode(
        &self,
        data: &mut [Vec<u8>],
        check: &mut [Vec<u8>],
        data_present: &[bool],
        check_present: &[bool],
        block_length: usize,
    ) -> Result<(), FecError>;

    /// Fill every missing check block from a complete set of data blocks.
    fn encode(
        &self,
        data: &[Vec<u8>],
        check: &mut [Vec<u8>],
        check_present: &[bool],
        block_length: usize,
    ) -> Result<(), FecError>;

    /// Peak transient memory the codec may need beyond the block buffers
    /// themselves, in bytes. Used for job admission, not allocation.
    fn max_memory_overhead_decode(&self, data_blocks: usize, check_blocks: usize) -> u64;

    fn max_memory_overhead_encode(&self, data_blocks: usize, check_blocks: usize) -> u64;
}

/// Reed-Solomon implementation of [`FecCodec`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ReedSolomonCodec;

impl ReedSolomonCodec {
    pub fn new() -> Self {
        ReedSolomonCodec
    }
}

impl FecCodec for ReedSolomonCodec {
    fn decode(
        &self,
        data: &mut [Vec<u8>],
        check: &mut [Vec<u8>],
        data_present: &[bool],
        check_present: &[bool],
        block_length: usize,
    ) -> Result<(), FecError> {
        check_geometry(data, check, data_present, check_present, block_length)?;
        if data_present.iter().all(|&p| p) {
            return Ok(());
        }
        if check.is_empty() {
            return Err(FecError::NotEnoughShards);
        }
        let rs = ReedSolomon::new(data.len(), check.len()).map_err(FecError::from)?;
        let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(data.len() + check.len());
        for (buf, &present) in data.iter().zip(data_present) {
            shards.push(present.then(|| buf.clone()));
        }
        for (buf, &present) in check.iter().zip(check_present) {
            shards.push(present.then(|| buf.clone()));
        }
        rs.reconstruct_data(&mut shards).map_err(FecError::from)?;
        for (index, buf) in data.iter_mut().enumerate() {
            if !data_present[index] {
                *buf = shards[index]
                    .take()
                    .ok_or(FecError::MissingShard { index })?;
            }
        }
        Ok(())
    }

    fn encode(
        &self,
        data: &[Vec<u8>],
        check: &mut [Vec<u8>],
        check_present: &[bool],
        block_length: usize,
    ) -> Result<(), FecError> {
        for buf in data.iter() {
            if buf.len() != block_length {
                return Err(FecError::ShardLength {
                    expected: block_length,
                    observed: buf.len(),
                });
            }
        }
        if check.is_empty() || check_present.iter().all(|&p| p) {
            return Ok(());
        }
        let rs = ReedSolomon::new(data.len(), check.len()).map_err(FecError::from)?;
        let mut shards: Vec<Vec<u8>> = data.to_vec();
        shards.extend(std::iter::repeat_with(|| vec![0u8; block_length]).take(check.len()));
        rs.encode(&mut shards).map_err(FecError::from)?;
        for (index, buf) in check.iter_mut().enumerate() {
            if !check_present[index] {
                *buf = std::mem::take(&mut shards[data.len() + index]);
            }
        }
        Ok(())
    }

    fn max_memory_overhead_decode(&self, data_blocks: usize, check_blocks: usize) -> u64 {
        matrix_overhead(data_blocks, check_blocks)
    }

    fn max_memory_overhead_encode(&self, data_blocks: usize, check_blocks: usize) -> u64 {
        matrix_overhead(data_blocks, check_blocks)
    }
}

// Decode/encode matrices are quadratic in the shard count; the flat term
// covers the GF(2^8) lookup tables.
fn matrix_overhead(data_blocks: usize, check_blocks: usize) -> u64 {
    let total = (data_blocks + check_blocks) as u64;
    total * total + 64 * 1024
}

fn check_geometry(
    data: &[Vec<u8>],
    check: &[Vec<u8>],
    data_present: &[bool],
    check_present: &[bool],
    block_length: usize,
) -> Result<(), FecError> {
    if data.len() != data_present.len() || check.len() != check_present.len() {
        return Err(FecError::PresenceMaskMismatch);
    }
    for (buf, &present) in data.iter().zip(data_present) {
        if present && buf.len() != block_length {
            return Err(FecError::ShardLength {
                expected: block_length,
                observed: buf.len(),
            });
        }
    }
    for (buf, &present) in check.iter().zip(check_present) {
        if present && buf.len() != block_length {
            return Err(FecError::ShardLength {
                expected: block_length,
                observed: buf.len(),
            });
        }
    }
    Ok(())
}

#[derive(Debug, Error, PartialEq)]
pub enum FecError {
    #[error("erasure codec rejected the shard set: {0}")]
    Codec(reed_solomon_erasure::Error),
    #[error("not enough shards present to reconstruct")]
    NotEnoughShards,
    #[error("shard length mismatch: expected {expected}, observed {observed}")]
    ShardLength { expected: usize, observed: usize },
    #[error("presence mask length does not match shard count")]
    PresenceMaskMismatch,
    #[error("codec reported success but shard {index} is still missing")]
    MissingShard { index: usize },
}

impl From<reed_solomon_erasure::Error> for FecError {
    fn from(err: reed_solomon_erasure::Error) -> Self {
        match err {
            reed_solomon_erasure::Error::TooFewShardsPresent => FecError::NotEnoughShards,
            other => FecError::Codec(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEN: usize = 64;

    fn blocks(seeds: &[u8]) -> Vec<Vec<u8>> {
        seeds.iter().map(|&s| vec![s; LEN]).collect()
    }

    fn encoded_fixture(data_count: usize, check_count: usize) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        let codec = ReedSolomonCodec::new();
        let data: Vec<Vec<u8>> = (0..data_count).map(|i| vec![i as u8 + 1; LEN]).collect();
        let mut check = vec![vec![0u8; LEN]; check_count];
        let present = vec![false; check_count];
        codec.encode(&data, &mut check, &present, LEN).unwrap();
        (data, check)
    }

    #[test]
    fn decode_reconstructs_missing_data() {
        let codec = ReedSolomonCodec::new();
        let (data, check) = encoded_fixture(3, 2);
        let expected = data.clone();

        let mut damaged = data;
        damaged[1] = vec![0u8; LEN];
        let data_present = vec![true, false, true];
        let check_present = vec![true, true];
        let mut check_copy = check;
        codec
            .decode(&mut damaged, &mut check_copy, &data_present, &check_present, LEN)
            .unwrap();
        assert_eq!(damaged, expected);
    }

    #[test]
    fn decode_uses_single_check_block() {
        let codec = ReedSolomonCodec::new();
        let (data, check) = encoded_fixture(4, 3);
        let expected = data.clone();

        let mut damaged = data;
        damaged[0] = vec![0u8; LEN];
        let data_present = vec![false, true, true, true];
        let mut partial_check = vec![vec![0u8; LEN], check[1].clone(), vec![0u8; LEN]];
        let check_present = vec![false, true, false];
        codec
            .decode(&mut damaged, &mut partial_check, &data_present, &check_present, LEN)
            .unwrap();
        assert_eq!(damaged, expected);
    }

    #[test]
    fn decode_without_enough_shards_fails() {
        let codec = ReedSolomonCodec::new();
        let mut data = blocks(&[1, 0, 0]);
        let mut check = vec![vec![0u8; LEN]; 2];
        let err = codec
            .decode(
                &mut data,
                &mut check,
                &[true, false, false],
                &[false, false],
                LEN,
            )
            .unwrap_err();
        assert_eq!(err, FecError::NotEnoughShards);
    }

    #[test]
    fn decode_with_everything_present_is_a_no_op() {
        let codec = ReedSolomonCodec::new();
        let mut data = blocks(&[1, 2]);
        let snapshot = data.clone();
        let mut check: Vec<Vec<u8>> = Vec::new();
        codec
            .decode(&mut data, &mut check, &[true, true], &[], LEN)
            .unwrap();
        assert_eq!(data, snapshot);
    }

    #[test]
    fn encode_fills_only_missing_check_blocks() {
        let codec = ReedSolomonCodec::new();
        let (data, canonical) = encoded_fixture(3, 2);
        let sentinel = vec![0xaa; LEN];
        let mut check = vec![vec![0u8; LEN], sentinel.clone()];
        // Slot 1 claims presence, so encode must not touch it.
        codec.encode(&data, &mut check, &[false, true], LEN).unwrap();
        assert_eq!(check[0], canonical[0]);
        assert_eq!(check[1], sentinel);
    }

    #[test]
    fn mask_length_mismatch_is_rejected() {
        let codec = ReedSolomonCodec::new();
        let mut data = blocks(&[1, 2]);
        let mut check = vec![vec![0u8; LEN]];
        let err = codec
            .decode(&mut data, &mut check, &[true], &[true], LEN)
            .unwrap_err();
        assert_eq!(err, FecError::PresenceMaskMismatch);
    }
}
