//! Field-level encryption for device tokens.
//!
//! Encrypted values are stored as `hex(nonce):hex(ciphertext || tag)`.
//! Values not in that shape are legacy plaintext and decrypt to themselves.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Nonce size for ChaCha20-Poly1305.
pub const NONCE_SIZE: usize = 12;

/// Expected length of the hex-encoded key.
pub const KEY_HEX_LEN: usize = 64;

const KEY_SIZE: usize = 32;
const TAG_SIZE: usize = 16;

type HmacSha256 = Hmac<Sha256>;

struct KeyMaterial {
    cipher: ChaCha20Poly1305,
    mac_key: Zeroizing<[u8; KEY_SIZE]>,
}

/// Encrypts token values and computes their lookup hashes.
///
/// Without a key, `encrypt` is the identity and `lookup_hash` is an unkeyed
/// SHA-256. That mode is functional but offers no confidentiality.
pub struct FieldCipher {
    key: Option<KeyMaterial>,
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher")
            .field("keyed", &self.is_keyed())
            .finish()
    }
}

impl FieldCipher {
    /// Build from an optional 64-char hex key. `None` or a blank string
    /// yields a pass-through cipher.
    pub fn new(key_hex: Option<&str>) -> Result<Self, CryptoError> {
        match key_hex.map(str::trim).filter(|k| !k.is_empty()) {
            None => Ok(Self::disabled()),
            Some(hex_key) => {
                if hex_key.len() != KEY_HEX_LEN {
                    return Err(CryptoError::InvalidKeyLength {
                        expected: KEY_HEX_LEN,
                        actual: hex_key.len(),
                    });
                }
                let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
                hex::decode_to_slice(hex_key, bytes.as_mut())
                    .map_err(|e| CryptoError::InvalidKeyEncoding(e.to_string()))?;
                Ok(Self::from_key_bytes(&bytes))
            }
        }
    }

    /// Build from raw key bytes.
    pub fn from_key_bytes(bytes: &[u8; KEY_SIZE]) -> Self {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(bytes));
        Self {
            key: Some(KeyMaterial {
                cipher,
                mac_key: Zeroizing::new(*bytes),
            }),
        }
    }

    /// A cipher with no key: pass-through encryption, unkeyed hashing.
    pub const fn disabled() -> Self {
        Self { key: None }
    }

    /// Whether a server-side key is configured.
    pub const fn is_keyed(&self) -> bool {
        self.key.is_some()
    }

    /// Encrypt a value with a fresh random nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let Some(key) = &self.key else {
            return Ok(plaintext.to_string());
        };

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = key
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        Ok(format!(
            "{}:{}",
            hex::encode(nonce_bytes),
            hex::encode(ciphertext)
        ))
    }

    /// Decrypt a stored value. Legacy plaintext is returned unchanged.
    pub fn decrypt(&self, stored: &str) -> Result<String, CryptoError> {
        let Some(key) = &self.key else {
            return Ok(stored.to_string());
        };
        if !Self::is_encrypted(stored) {
            return Ok(stored.to_string());
        }

        let (nonce_hex, ct_hex) = stored
            .split_once(':')
            .ok_or_else(|| CryptoError::MalformedCiphertext("missing separator".into()))?;
        let nonce_bytes =
            hex::decode(nonce_hex).map_err(|e| CryptoError::MalformedCiphertext(e.to_string()))?;
        let ciphertext =
            hex::decode(ct_hex).map_err(|e| CryptoError::MalformedCiphertext(e.to_string()))?;

        let plaintext = key
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;

        String::from_utf8(plaintext).map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }

    /// Whether `value` has the `nonce:ciphertext` shape produced by `encrypt`.
    ///
    /// Raw provider tokens never match: Apple tokens have no separator and
    /// Google tokens carry non-hex characters.
    pub fn is_encrypted(value: &str) -> bool {
        let Some((nonce_hex, ct_hex)) = value.split_once(':') else {
            return false;
        };
        nonce_hex.len() == NONCE_SIZE * 2
            && ct_hex.len() >= TAG_SIZE * 2
            && ct_hex.len() % 2 == 0
            && nonce_hex.bytes().all(|b| b.is_ascii_hexdigit())
            && ct_hex.bytes().all(|b| b.is_ascii_hexdigit())
    }

    /// Deterministic hex digest of the normalized token, used for dedup.
    pub fn lookup_hash(&self, token: &str) -> String {
        let normalized = normalize_token(token);
        match &self.key {
            Some(key) => {
                // HMAC accepts keys of any length; this cannot fail.
                let mut mac = <HmacSha256 as Mac>::new_from_slice(key.mac_key.as_ref())
                    .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
                mac.update(normalized.as_bytes());
                hex::encode(mac.finalize().into_bytes())
            }
            None => hex::encode(Sha256::digest(normalized.as_bytes())),
        }
    }
}

/// Trim surrounding whitespace and lower-case.
pub fn normalize_token(token: &str) -> String {
    token.trim().to_lowercase()
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
    const OTHER_KEY: &str = "ff0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
    const APNS_TOKEN: &str = "740f4707bebcf74f9b7c25d48e3358945f6aa01da5ddb387462c7eaf61bb78ad";
    const FCM_TOKEN: &str = "dQw4w9WgXcQ:APA91bHun4MxP5egoKMwt2KZFBaFUH-1RYqx";

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let cipher = FieldCipher::new(Some(KEY)).unwrap();
        let stored = cipher.encrypt(APNS_TOKEN).unwrap();
        assert_ne!(stored, APNS_TOKEN);
        assert!(FieldCipher::is_encrypted(&stored));
        assert_eq!(cipher.decrypt(&stored).unwrap(), APNS_TOKEN);
    }

    #[test]
    fn same_plaintext_encrypts_differently() {
        let cipher = FieldCipher::new(Some(KEY)).unwrap();
        let a = cipher.encrypt(FCM_TOKEN).unwrap();
        let b = cipher.encrypt(FCM_TOKEN).unwrap();
        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a).unwrap(), cipher.decrypt(&b).unwrap());
    }

    #[test]
    fn no_key_is_pass_through() {
        for key in [None, Some(""), Some("   ")] {
            let cipher = FieldCipher::new(key).unwrap();
            assert!(!cipher.is_keyed());
            assert_eq!(cipher.encrypt(APNS_TOKEN).unwrap(), APNS_TOKEN);
            assert_eq!(cipher.decrypt(APNS_TOKEN).unwrap(), APNS_TOKEN);
        }
    }

    #[test]
    fn legacy_plaintext_decrypts_to_itself() {
        let cipher = FieldCipher::new(Some(KEY)).unwrap();
        assert_eq!(cipher.decrypt(APNS_TOKEN).unwrap(), APNS_TOKEN);
        assert_eq!(cipher.decrypt(FCM_TOKEN).unwrap(), FCM_TOKEN);
    }

    #[test]
    fn raw_tokens_are_not_mistaken_for_ciphertext() {
        assert!(!FieldCipher::is_encrypted(APNS_TOKEN));
        assert!(!FieldCipher::is_encrypted(FCM_TOKEN));
        assert!(!FieldCipher::is_encrypted("abc"));
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let stored = FieldCipher::new(Some(KEY))
            .unwrap()
            .encrypt(APNS_TOKEN)
            .unwrap();
        let other = FieldCipher::new(Some(OTHER_KEY)).unwrap();
        assert!(matches!(
            other.decrypt(&stored),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let cipher = FieldCipher::new(Some(KEY)).unwrap();
        let stored = cipher.encrypt(APNS_TOKEN).unwrap();
        let last = stored.chars().last().unwrap();
        let flipped = if last == '0' { '1' } else { '0' };
        let tampered = format!("{}{flipped}", &stored[..stored.len() - 1]);
        assert!(cipher.decrypt(&tampered).is_err());
    }

    #[test]
    fn rejects_bad_keys() {
        assert!(matches!(
            FieldCipher::new(Some("abcd")),
            Err(CryptoError::InvalidKeyLength {
                expected: 64,
                actual: 4
            })
        ));
        let not_hex = "z".repeat(64);
        assert!(matches!(
            FieldCipher::new(Some(&not_hex)),
            Err(CryptoError::InvalidKeyEncoding(_))
        ));
    }

    #[test]
    fn lookup_hash_ignores_case_and_whitespace() {
        for cipher in [FieldCipher::new(Some(KEY)).unwrap(), FieldCipher::disabled()] {
            let canonical = cipher.lookup_hash("abc");
            assert_eq!(cipher.lookup_hash("  ABC\n"), canonical);
            assert_eq!(cipher.lookup_hash("aBc"), canonical);
            assert_ne!(cipher.lookup_hash("abd"), canonical);
            assert_eq!(canonical.len(), 64);
        }
    }

    #[test]
    fn keyed_hash_differs_from_unkeyed_and_between_keys() {
        let keyed = FieldCipher::new(Some(KEY)).unwrap().lookup_hash(APNS_TOKEN);
        let other = FieldCipher::new(Some(OTHER_KEY))
            .unwrap()
            .lookup_hash(APNS_TOKEN);
        let unkeyed = FieldCipher::disabled().lookup_hash(APNS_TOKEN);
        assert_ne!(keyed, unkeyed);
        assert_ne!(keyed, other);
    }

    #[test]
    fn debug_does_not_leak_key() {
        let rendered = format!("{:?}", FieldCipher::new(Some(KEY)).unwrap());
        assert_eq!(rendered, "FieldCipher { keyed: true }");
    }
}
