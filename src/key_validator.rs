// src/key_validator.rs

/// Format precondition applied to every wallet before a batch is accepted.
pub trait KeyValidator: Send + Sync {
    fn validate(&self, key: &str) -> Result<(), String>;
}

const PUBKEY_LEN: usize = 32;
// A 32-byte value never needs more than 44 base58 digits.
const MAX_ENCODED_LEN: usize = 44;

/// Accepts base58 strings that decode to a 32-byte ed25519 public key.
#[derive(Debug, Default, Clone, Copy)]
pub struct SolanaAddressValidator;

impl KeyValidator for SolanaAddressValidator {
    fn validate(&self, key: &str) -> Result<(), String> {
        if key.is_empty() || key.len() > MAX_ENCODED_LEN {
            return Err(format!("invalid length {}", key.len()));
        }
        let decoded = bs58::decode(key)
            .into_vec()
            .map_err(|e| format!("not base58: {}", e))?;
        if decoded.len() != PUBKEY_LEN {
            return Err(format!("decodes to {} bytes, expected {}", decoded.len(), PUBKEY_LEN));
        }
        Ok(())
    }
}
