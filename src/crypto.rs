//! Write-key derivation for gateway commands.
//! The gateway authorises a `write` only when it carries the session token
//! encrypted with the developer key: AES-128-CBC, fixed IV, no padding.

use crate::error::{GatewayError, Result};
use aes::Aes128;
use cbc::Encryptor;
use cipher::{BlockEncryptMut, KeyIvInit};

/// Fixed initialisation vector used by the gateway firmware.
const GATEWAY_IV: [u8; 16] = [
    0x17, 0x99, 0x6d, 0x09, 0x3d, 0x28, 0xdd, 0xb3, 0xba, 0x69, 0x5a, 0x2e, 0x6f, 0x58, 0x56, 0x2e,
];

/// Derives the write authorisation field from a token and a developer key.
///
/// Implementations must be deterministic: the same token and key always
/// produce the same ciphertext.
pub trait KeyEncryptor: Send + Sync {
    fn encrypt(&self, token: &str, key: &str) -> Result<String>;
}

/// The gateway's own scheme, rendered as upper-case hex.
#[derive(Debug, Default, Clone, Copy)]
pub struct AesKeyEncryptor;

impl AesKeyEncryptor {
    pub fn new() -> Self {
        Self
    }
}

impl KeyEncryptor for AesKeyEncryptor {
    fn encrypt(&self, token: &str, key: &str) -> Result<String> {
        if token.is_empty() {
            return Err(GatewayError::EncryptionFailed(
                "no session token received from gateway yet".into(),
            ));
        }
        if key.len() != 16 {
            return Err(GatewayError::EncryptionFailed(format!(
                "developer key must be 16 bytes, got {}",
                key.len()
            )));
        }
        if token.len() % 16 != 0 {
            return Err(GatewayError::EncryptionFailed(format!(
                "token length {} is not a multiple of the block size",
                token.len()
            )));
        }

        let mut k = [0u8; 16];
        k.copy_from_slice(key.as_bytes());
        let mut encryptor = Encryptor::<Aes128>::new(&k.into(), &GATEWAY_IV.into());

        let mut ciphertext = token.as_bytes().to_vec();
        for chunk in ciphertext.chunks_mut(16) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            encryptor.encrypt_block_mut(block);
        }

        Ok(hex::encode_upper(ciphertext))
    }
}
