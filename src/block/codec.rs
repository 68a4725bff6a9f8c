// aes-gcm relies on generic-array 0.14, so suppress the upstream deprecation locally.
#[allow(deprecated)]
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadCore, AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Plaintext payload length of every block.
pub const BLOCK_DATA_LENGTH: usize = 32 * 1024;
/// Detached AEAD tag appended to the ciphertext.
pub const BLOCK_TAG_LENGTH: usize = 16;
/// Full on-the-wire block length.
pub const BLOCK_CIPHERTEXT_LENGTH: usize = BLOCK_DATA_LENGTH + BLOCK_TAG_LENGTH;
pub const ROUTING_KEY_LENGTH: usize = 32;
pub const CRYPTO_KEY_LENGTH: usize = 32;

const IV_DOMAIN: &[u8] = b"Block-IV v1";
const AAD_VERSION: u8 = 1;

/// Block encryption suite. A splitfile never changes suite mid-fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CryptoAlgorithm {
    Aes256GcmSha256 = 1,
}

impl CryptoAlgorithm {
    pub fn wire_id(self) -> u8 {
        self as u8
    }

    pub fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(CryptoAlgorithm::Aes256GcmSha256),
            _ => None,
        }
    }
}

/// Self-certifying block identity: the SHA-256 of the ciphertext. This is
/// what the network routes on and what arrives with a candidate block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutingKey(pub [u8; ROUTING_KEY_LENGTH]);

impl RoutingKey {
    pub fn as_bytes(&self) -> &[u8; ROUTING_KEY_LENGTH] {
        &self.0
    }
}

/// Full client-side key for one block: routing identity plus the material
/// needed to decrypt and to re-encode for verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientKey {
    pub routing: RoutingKey,
    pub crypto_key: [u8; CRYPTO_KEY_LENGTH],
    pub algorithm: CryptoAlgorithm,
}

/// Result of encoding a plaintext block.
#[derive(Debug, Clone)]
pub struct EncodedBlock {
    pub ciphertext: Vec<u8>,
    pub key: ClientKey,
}

/// Encrypt a plaintext block and derive its content key. Deterministic: the
/// same plaintext and crypto key always produce the same ciphertext and
/// routing key, which is what makes re-encoding usable as verification.
pub fn encode_block(
    plaintext: &[u8],
    crypto_key: &[u8; CRYPTO_KEY_LENGTH],
    algorithm: CryptoAlgorithm,
) -> Result<EncodedBlock, BlockCodecError> {
    if plaintext.len() != BLOCK_DATA_LENGTH {
        return Err(BlockCodecError::LengthMismatch {
            expected: BLOCK_DATA_LENGTH,
            observed: plaintext.len(),
        });
    }
    let cipher = Aes256Gcm::new(key_ref(crypto_key));
    let mut buffer = plaintext.to_vec();
    let nonce = derive_nonce(crypto_key);
    let aad = build_aad(algorithm);
    let tag = cipher
        .encrypt_in_place_detached(nonce_ref(&nonce), &aad, &mut buffer)
        .map_err(|_| BlockCodecError::Encrypt)?;
    buffer.extend(tag.iter().copied());
    let routing = routing_hash(&buffer);
    Ok(EncodedBlock {
        ciphertext: buffer,
        key: ClientKey {
            routing,
            crypto_key: *crypto_key,
            algorithm,
        },
    })
}

/// Check that a candidate ciphertext really is the block named by
/// `expected`: exact length and matching routing hash.
pub fn verify_block(ciphertext: &[u8], expected: &ClientKey) -> Result<(), BlockCodecError> {
    if ciphertext.len() != BLOCK_CIPHERTEXT_LENGTH {
        return Err(BlockCodecError::VerifyFailed);
    }
    if routing_hash(ciphertext) != expected.routing {
        return Err(BlockCodecError::VerifyFailed);
    }
    Ok(())
}

/// Decrypt a verified ciphertext block back to its plaintext payload.
pub fn decode_block(ciphertext: &[u8], key: &ClientKey) -> Result<Vec<u8>, BlockCodecError> {
    if ciphertext.len() != BLOCK_CIPHERTEXT_LENGTH {
        return Err(BlockCodecError::DecodeFailed);
    }
    let (data, tag) = ciphertext.split_at(BLOCK_DATA_LENGTH);
    let cipher = Aes256Gcm::new(key_ref(&key.crypto_key));
    let mut buffer = data.to_vec();
    let nonce = derive_nonce(&key.crypto_key);
    let aad = build_aad(key.algorithm);
    cipher
        .decrypt_in_place_detached(nonce_ref(&nonce), &aad, &mut buffer, tag_ref(tag))
        .map_err(|_| BlockCodecError::DecodeFailed)?;
    Ok(buffer)
}

/// Routing identity of a ciphertext.
pub fn routing_hash(ciphertext: &[u8]) -> RoutingKey {
    let mut hasher = Sha256::new();
    hasher.update(ciphertext);
    let digest: [u8; 32] = hasher.finalize().into();
    RoutingKey(digest)
}

fn build_aad(algorithm: CryptoAlgorithm) -> [u8; 2] {
    [AAD_VERSION, algorithm.wire_id()]
}

fn derive_nonce(crypto_key: &[u8; CRYPTO_KEY_LENGTH]) -> [u8; 12] {
    let mut hasher = Sha256::new();
    hasher.update(crypto_key);
    hasher.update(IV_DOMAIN);
    let digest: [u8; 32] = hasher.finalize().into();
    let mut iv = [0u8; 12];
    iv.copy_from_slice(&digest[..12]);
    iv
}

#[allow(deprecated)]
fn key_ref(bytes: &[u8; 32]) -> &Key<Aes256Gcm> {
    Key::<Aes256Gcm>::from_slice(bytes)
}

#[allow(deprecated)]
fn nonce_ref(bytes: &[u8; 12]) -> &GenericArray<u8, <Aes256Gcm as AeadCore>::NonceSize> {
    GenericArray::from_slice(bytes)
}

#[allow(deprecated)]
fn tag_ref(bytes: &[u8]) -> &GenericArray<u8, <Aes256Gcm as AeadCore>::TagSize> {
    GenericArray::from_slice(bytes)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockCodecError {
    #[error("block length mismatch: expected {expected} bytes, observed {observed}")]
    LengthMismatch { expected: usize, observed: usize },
    #[error("block verification failed")]
    VerifyFailed,
    #[error("block decode failed")]
    DecodeFailed,
    #[error("block encryption failure")]
    Encrypt,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(seed: u8) -> [u8; CRYPTO_KEY_LENGTH] {
        [seed; CRYPTO_KEY_LENGTH]
    }

    #[test]
    fn encode_verify_decode_round_trip() {
        let plaintext = vec![0x5a; BLOCK_DATA_LENGTH];
        let encoded =
            encode_block(&plaintext, &test_key(1), CryptoAlgorithm::Aes256GcmSha256).unwrap();
        assert_eq!(encoded.ciphertext.len(), BLOCK_CIPHERTEXT_LENGTH);
        verify_block(&encoded.ciphertext, &encoded.key).unwrap();
        let decoded = decode_block(&encoded.ciphertext, &encoded.key).unwrap();
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn encode_is_deterministic() {
        let plaintext = vec![7; BLOCK_DATA_LENGTH];
        let a = encode_block(&plaintext, &test_key(2), CryptoAlgorithm::Aes256GcmSha256).unwrap();
        let b = encode_block(&plaintext, &test_key(2), CryptoAlgorithm::Aes256GcmSha256).unwrap();
        assert_eq!(a.ciphertext, b.ciphertext);
        assert_eq!(a.key, b.key);
    }

    #[test]
    fn verify_rejects_flipped_byte() {
        let plaintext = vec![3; BLOCK_DATA_LENGTH];
        let mut encoded =
            encode_block(&plaintext, &test_key(3), CryptoAlgorithm::Aes256GcmSha256).unwrap();
        encoded.ciphertext[100] ^= 0xff;
        assert_eq!(
            verify_block(&encoded.ciphertext, &encoded.key),
            Err(BlockCodecError::VerifyFailed)
        );
    }

    #[test]
    fn decode_rejects_wrong_crypto_key() {
        let plaintext = vec![9; BLOCK_DATA_LENGTH];
        let encoded =
            encode_block(&plaintext, &test_key(4), CryptoAlgorithm::Aes256GcmSha256).unwrap();
        let mut wrong = encoded.key.clone();
        wrong.crypto_key = test_key(5);
        assert_eq!(
            decode_block(&encoded.ciphertext, &wrong),
            Err(BlockCodecError::DecodeFailed)
        );
    }

    #[test]
    fn encode_rejects_short_plaintext() {
        let err = encode_block(&[0; 16], &test_key(6), CryptoAlgorithm::Aes256GcmSha256)
            .unwrap_err();
        assert!(matches!(err, BlockCodecError::LengthMismatch { .. }));
    }
}
