use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use base64::{engine::general_purpose, Engine as _};
use rand::Rng;
use rand_core::RngCore;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption error")]
    Encrypt,
    #[error("decryption error")]
    Decrypt,
    #[error("invalid key")]
    InvalidKey,
}

/// AES-256-GCM cipher for personal fields (name, phone) stored at rest.
#[derive(Clone)]
pub struct PiiCipher {
    cipher: Aes256Gcm,
}

impl PiiCipher {
    pub fn from_base64_key(key_b64: &str) -> Result<Self, CryptoError> {
        let key_bytes = general_purpose::STANDARD
            .decode(key_b64.trim())
            .map_err(|_| CryptoError::InvalidKey)?;
        Self::from_key_bytes(&key_bytes)
    }

    pub fn from_key_bytes(key_bytes: &[u8]) -> Result<Self, CryptoError> {
        if key_bytes.len() != 32 {
            return Err(CryptoError::InvalidKey);
        }
        let cipher =
            Aes256Gcm::new_from_slice(key_bytes).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { cipher })
    }

    /// nonce (12 bytes) || ciphertext, base64.
    pub fn seal(&self, value: &str) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let mut ciphertext = self
            .cipher
            .encrypt(nonce, value.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;
        let mut combined = nonce_bytes.to_vec();
        combined.append(&mut ciphertext);
        Ok(general_purpose::STANDARD.encode(combined))
    }

    pub fn open(&self, encoded: &str) -> Result<String, CryptoError> {
        let data = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| CryptoError::Decrypt)?;
        if data.len() < 13 {
            return Err(CryptoError::Decrypt);
        }
        let (nonce_bytes, cipher_bytes) = data.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plain = self
            .cipher
            .decrypt(nonce, cipher_bytes)
            .map_err(|_| CryptoError::Decrypt)?;
        String::from_utf8(plain).map_err(|_| CryptoError::Decrypt)
    }

    pub fn seal_opt(&self, value: Option<&str>) -> Result<Option<String>, CryptoError> {
        value.map(|v| self.seal(v)).transpose()
    }

    /// Undecryptable values come back as `None` instead of failing the whole listing.
    pub fn open_opt(&self, encoded: Option<&str>) -> Option<String> {
        let encoded = encoded?;
        match self.open(encoded) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Failed to decrypt stored field: {}", e);
                None
            }
        }
    }
}

/// Argon2id PHC string with a fresh salt.
pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {e}"))?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Six-digit one-time code.
pub fn generate_otp() -> String {
    rand::thread_rng().gen_range(100_000..1_000_000).to_string()
}

/// 32 random bytes, hex encoded.
pub fn generate_reset_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> PiiCipher {
        PiiCipher::from_key_bytes(&[7u8; 32]).unwrap()
    }

    #[test]
    fn sealed_fields_open_back() {
        let cipher = cipher();
        let sealed = cipher.seal("Jane Doe").unwrap();
        assert_ne!(sealed, "Jane Doe");
        assert_eq!(cipher.open(&sealed).unwrap(), "Jane Doe");
        // Fresh nonce per call.
        assert_ne!(cipher.seal("Jane Doe").unwrap(), sealed);
    }

    #[test]
    fn wrong_key_or_garbage_fails() {
        let sealed = cipher().seal("555-0100").unwrap();
        let other = PiiCipher::from_key_bytes(&[9u8; 32]).unwrap();
        assert!(other.open(&sealed).is_err());
        assert!(cipher().open("not base64!").is_err());
        assert_eq!(other.open_opt(Some(&sealed)), None);
        assert!(PiiCipher::from_key_bytes(&[1u8; 16]).is_err());
    }

    #[test]
    fn base64_key_is_accepted() {
        let key = general_purpose::STANDARD.encode([3u8; 32]);
        assert!(PiiCipher::from_base64_key(&key).is_ok());
    }

    #[test]
    fn passwords_verify_against_their_hash() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong horse", &hash));
        assert!(!verify_password("correct horse", "not-a-phc-string"));
    }

    #[test]
    fn generated_codes_have_expected_shape() {
        let otp = generate_otp();
        assert_eq!(otp.len(), 6);
        assert!(otp.chars().all(|c| c.is_ascii_digit()));

        let token = generate_reset_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
