//! Citewalk field encryption library
//!
//! Protects device token material at rest.
//!
//! ## Crypto primitives
//!
//! - **Encryption**: ChaCha20-Poly1305 AEAD, random 12-byte nonce per value,
//!   stored as `hex(nonce):hex(ciphertext)`
//! - **Lookup hash**: HMAC-SHA256 over the normalized value, so equal tokens
//!   can be found without decrypting every row
//!
//! Without a configured key both degrade to pass-through / unkeyed SHA-256.

pub mod error;
pub mod field;

pub use error::CryptoError;
pub use field::{FieldCipher, KEY_HEX_LEN, NONCE_SIZE, normalize_token};
