//! Cipher engine for attribute encryption, decryption and search hashing.
//!
//! Envelopes are `base64(IV || AES-256-CBC(plaintext))` with PKCS#7 padding
//! and a fresh random IV per call, so equal plaintexts never share a
//! ciphertext. Equality search goes through [`CipherEngine::hash`] instead,
//! a SHA-256 digest of the trimmed plaintext.
//!
//! Key material is the hex SHA-512 digest of the base key (or of
//! `base_key ":" context`). AES-256 consumes the first 32 bytes of that hex
//! string, which keeps envelopes readable by OpenSSL-based writers that pass
//! the same digest string as their key.

use crate::error::{Error, Result};
use aes::Aes256;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256, Sha512};
use std::collections::BTreeMap;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// IV size for a 128-bit block cipher.
pub const IV_SIZE: usize = 16;

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;

/// Symmetric algorithm used for envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    /// AES-256 in CBC mode with PKCS#7 padding (default).
    #[default]
    Aes256Cbc,
}

impl Algorithm {
    /// Returns the conventional name of the algorithm.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Aes256Cbc => "AES-256-CBC",
        }
    }
}

/// Stateless cryptographic primitives bound to one base key.
///
/// # Example
///
/// ```
/// use dbcrypt::cipher::CipherEngine;
///
/// let engine = CipherEngine::new("base-key");
/// let envelope = engine.encrypt(Some("123-45-6789"), None).unwrap();
/// let plaintext = engine.decrypt(Some(&envelope), None).unwrap();
/// assert_eq!(plaintext, "123-45-6789");
/// ```
#[derive(Clone)]
pub struct CipherEngine {
    base_key: Option<SecretString>,
    algorithm: Algorithm,
}

impl std::fmt::Debug for CipherEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherEngine")
            .field("has_key", &self.base_key.is_some())
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl CipherEngine {
    /// Creates an engine with the given base key.
    #[must_use]
    pub fn new(base_key: impl Into<String>) -> Self {
        Self::from_secret(Some(SecretString::new(base_key.into())))
    }

    /// Creates an engine from an optional secret, as held by
    /// [`Config`](crate::config::Config). Blank keys count as missing; any
    /// other key is used verbatim.
    #[must_use]
    pub fn from_secret(base_key: Option<SecretString>) -> Self {
        let base_key = base_key.filter(|k| !k.expose_secret().trim().is_empty());
        Self { base_key, algorithm: Algorithm::default() }
    }

    /// Creates an engine from a configuration.
    #[must_use]
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::from_secret(config.key.clone())
    }

    /// Returns the configured algorithm.
    #[must_use]
    pub const fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Derives key material from the base key and an optional context.
    ///
    /// The result is the lowercase hex SHA-512 digest of the base key, or of
    /// `base_key ":" trim(context)` when a context is given.
    ///
    /// # Errors
    ///
    /// Returns `Error::MissingKey` if no base key is configured.
    pub fn derive_key(&self, context: Option<&str>) -> Result<SecretString> {
        let base = self.base_key.as_ref().ok_or(Error::MissingKey)?;
        let input = match context {
            Some(ctx) => Zeroizing::new(format!("{}:{}", base.expose_secret(), ctx.trim())),
            None => Zeroizing::new(base.expose_secret().clone()),
        };
        let digest = Zeroizing::new(Sha512::digest(input.as_bytes()).to_vec());
        Ok(SecretString::new(hex::encode(&*digest)))
    }

    fn cipher_key(&self, context: Option<&str>) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        let material = self.derive_key(context)?;
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(&material.expose_secret().as_bytes()[..KEY_SIZE]);
        Ok(key)
    }

    /// Encrypts a plaintext into a base64 envelope.
    ///
    /// An empty string is encrypted like any other value; whether to store
    /// "nothing" is the caller's decision.
    ///
    /// # Errors
    ///
    /// - `Error::NullInput` if `plaintext` is `None`
    /// - `Error::MissingKey` if no base key is configured
    /// - `Error::CipherFailure` if the cipher rejects the key or IV
    pub fn encrypt(&self, plaintext: Option<&str>, context: Option<&str>) -> Result<String> {
        let plaintext = plaintext.ok_or(Error::NullInput)?;
        let key = self.cipher_key(context)?;

        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);

        let ciphertext = match self.algorithm {
            Algorithm::Aes256Cbc => Aes256CbcEnc::new_from_slices(&key[..], &iv)
                .map_err(|_| Error::CipherFailure("invalid key or IV length"))?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes()),
        };

        let mut envelope = Vec::with_capacity(IV_SIZE + ciphertext.len());
        envelope.extend_from_slice(&iv);
        envelope.extend_from_slice(&ciphertext);

        Ok(STANDARD.encode(envelope))
    }

    /// Decrypts a base64 envelope produced by [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// - `Error::NullInput` if `envelope` is `None`
    /// - `Error::InvalidEncoding` if the envelope is not strict base64
    /// - `Error::MissingKey` if no base key is configured
    /// - `Error::CipherFailure` on a wrong key, corrupted data or bad padding
    pub fn decrypt(&self, envelope: Option<&str>, context: Option<&str>) -> Result<String> {
        let envelope = envelope.ok_or(Error::NullInput)?;
        let decoded = STANDARD.decode(envelope.trim()).map_err(|_| Error::InvalidEncoding)?;
        let key = self.cipher_key(context)?;

        if decoded.len() < IV_SIZE {
            return Err(Error::CipherFailure("envelope shorter than IV"));
        }
        let (iv, ciphertext) = decoded.split_at(IV_SIZE);

        let plaintext = match self.algorithm {
            Algorithm::Aes256Cbc => Aes256CbcDec::new_from_slices(&key[..], iv)
                .map_err(|_| Error::CipherFailure("invalid key or IV length"))?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| Error::CipherFailure("decryption failed"))?,
        };

        String::from_utf8(plaintext).map_err(|e| {
            let mut bytes = e.into_bytes();
            zeroize::Zeroize::zeroize(&mut bytes);
            Error::CipherFailure("plaintext is not valid UTF-8")
        })
    }

    /// Returns the search hash of a value: lowercase hex SHA-256 of the
    /// trimmed input. Independent of the base key.
    #[must_use]
    pub fn hash(value: &str) -> String {
        hex::encode(Sha256::digest(value.trim().as_bytes()))
    }

    /// Checks whether `envelope` decrypts to `plaintext`.
    ///
    /// Any decryption failure yields `false`. The comparison runs in
    /// constant time.
    #[must_use]
    pub fn verify(&self, plaintext: &str, envelope: &str) -> bool {
        self.decrypt(Some(envelope), None).is_ok_and(|decrypted| {
            let decrypted = Zeroizing::new(decrypted);
            decrypted.as_bytes().ct_eq(plaintext.as_bytes()).into()
        })
    }

    /// Encrypts every non-empty value of a map, passing `None` and empty
    /// strings through unchanged.
    ///
    /// # Errors
    ///
    /// Returns the first encryption error encountered.
    pub fn encrypt_batch<K: Ord>(
        &self,
        values: BTreeMap<K, Option<String>>,
        context: Option<&str>,
    ) -> Result<BTreeMap<K, Option<String>>> {
        values
            .into_iter()
            .map(|(k, v)| match v {
                Some(value) if !value.is_empty() => {
                    let value = Zeroizing::new(value);
                    Ok((k, Some(self.encrypt(Some(&value), context)?)))
                }
                other => Ok((k, other)),
            })
            .collect()
    }

    /// Decrypts every non-empty envelope of a map, passing `None` and empty
    /// strings through unchanged.
    ///
    /// # Errors
    ///
    /// Returns the first decryption error encountered.
    pub fn decrypt_batch<K: Ord>(
        &self,
        envelopes: BTreeMap<K, Option<String>>,
        context: Option<&str>,
    ) -> Result<BTreeMap<K, Option<String>>> {
        envelopes
            .into_iter()
            .map(|(k, v)| match v {
                Some(envelope) if !envelope.is_empty() => {
                    Ok((k, Some(self.decrypt(Some(&envelope), context)?)))
                }
                other => Ok((k, other)),
            })
            .collect()
    }

    /// Reports whether the configured algorithm works in this build.
    ///
    /// Runs a round-trip with a throwaway key, so it succeeds even when no
    /// base key is configured.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        const SAMPLE: &str = "dbcrypt-self-test";
        let scratch =
            Self { base_key: Some(SecretString::new(SAMPLE.into())), algorithm: self.algorithm };
        scratch
            .encrypt(Some(SAMPLE), None)
            .and_then(|envelope| scratch.decrypt(Some(&envelope), None))
            .is_ok_and(|plaintext| plaintext == SAMPLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn engine() -> CipherEngine {
        CipherEngine::new("test-base-key")
    }

    #[test]
    fn test_round_trip() {
        let engine = engine();
        let envelope = engine.encrypt(Some("test_data"), None).unwrap();
        assert_eq!(engine.decrypt(Some(&envelope), None).unwrap(), "test_data");
    }

    #[test]
    fn test_random_iv_per_call() {
        let engine = engine();
        let first = engine.encrypt(Some("repeatable"), None).unwrap();
        let second = engine.encrypt(Some("repeatable"), None).unwrap();

        assert_ne!(first, second);
        assert_eq!(engine.decrypt(Some(&first), None).unwrap(), "repeatable");
        assert_eq!(engine.decrypt(Some(&second), None).unwrap(), "repeatable");
    }

    #[test]
    fn test_envelope_layout() {
        let envelope = engine().encrypt(Some("abc"), None).unwrap();
        let decoded = STANDARD.decode(envelope).unwrap();
        // one padded block after the IV
        assert_eq!(decoded.len(), IV_SIZE + 16);
    }

    #[test]
    fn test_empty_plaintext_is_encrypted() {
        let engine = engine();
        let envelope = engine.encrypt(Some(""), None).unwrap();
        assert_eq!(engine.decrypt(Some(&envelope), None).unwrap(), "");
    }

    #[test]
    fn test_null_guards() {
        let engine = engine();
        assert!(matches!(engine.encrypt(None, None), Err(Error::NullInput)));
        assert!(matches!(engine.decrypt(None, None), Err(Error::NullInput)));
    }

    #[test]
    fn test_invalid_base64() {
        let result = engine().decrypt(Some("not_base64!"), None);
        assert!(matches!(result, Err(Error::InvalidEncoding)));
    }

    #[test]
    fn test_missing_key() {
        let engine = CipherEngine::from_secret(None);
        assert!(matches!(engine.encrypt(Some("x"), None), Err(Error::MissingKey)));
        assert!(matches!(engine.derive_key(None), Err(Error::MissingKey)));

        let empty = CipherEngine::new("");
        assert!(matches!(empty.encrypt(Some("x"), None), Err(Error::MissingKey)));
    }

    #[test]
    fn test_wrong_key_fails() {
        let envelope = engine().encrypt(Some("secret"), None).unwrap();
        let other = CipherEngine::new("another-key");
        // a wrong key can still unpad by chance; it must never yield the plaintext
        match other.decrypt(Some(&envelope), None) {
            Err(err) => assert!(matches!(err, Error::CipherFailure(_))),
            Ok(plaintext) => assert_ne!(plaintext, "secret"),
        }
    }

    #[test]
    fn test_truncated_envelope_fails() {
        let short = STANDARD.encode([0u8; 8]);
        assert!(matches!(engine().decrypt(Some(&short), None), Err(Error::CipherFailure(_))));
    }

    #[test]
    fn test_context_changes_key() {
        let engine = engine();
        let plain = engine.derive_key(None).unwrap();
        let scoped = engine.derive_key(Some("tenant_1")).unwrap();
        let trimmed = engine.derive_key(Some("  tenant_1 ")).unwrap();

        assert_ne!(plain.expose_secret(), scoped.expose_secret());
        assert_eq!(scoped.expose_secret(), trimmed.expose_secret());
        assert_eq!(plain.expose_secret().len(), 128);

        let envelope = engine.encrypt(Some("value"), Some("tenant_1")).unwrap();
        assert_eq!(engine.decrypt(Some(&envelope), Some("tenant_1")).unwrap(), "value");
    }

    #[test]
    fn test_derive_key_is_sha512_hex() {
        let expected = hex::encode(Sha512::digest(b"test-base-key:ctx"));
        assert_eq!(engine().derive_key(Some("ctx")).unwrap().expose_secret(), &expected);
    }

    #[test]
    fn test_hash_is_trimmed_hex() {
        let hash = CipherEngine::hash("test_value");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(CipherEngine::hash(" x "), CipherEngine::hash("x"));
        assert_ne!(CipherEngine::hash("x"), CipherEngine::hash("y"));
    }

    #[test]
    fn test_hash_known_vector() {
        assert_eq!(
            CipherEngine::hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_verify() {
        let engine = engine();
        let envelope = engine.encrypt(Some("4111-1111"), None).unwrap();
        assert!(engine.verify("4111-1111", &envelope));
        assert!(!engine.verify("4111-1112", &envelope));
        assert!(!engine.verify("4111-1111", "not_base64!"));
    }

    #[test]
    fn test_batch_passes_through_empty_values() {
        let engine = engine();
        let mut values = BTreeMap::new();
        values.insert("a", Some("alpha".to_string()));
        values.insert("b", Some(String::new()));
        values.insert("c", None);

        let encrypted = engine.encrypt_batch(values, None).unwrap();
        assert_ne!(encrypted["a"].as_deref(), Some("alpha"));
        assert_eq!(encrypted["b"].as_deref(), Some(""));
        assert_eq!(encrypted["c"], None);

        let decrypted = engine.decrypt_batch(encrypted, None).unwrap();
        assert_eq!(decrypted["a"].as_deref(), Some("alpha"));
        assert_eq!(decrypted["b"].as_deref(), Some(""));
        assert_eq!(decrypted["c"], None);
    }

    #[test]
    fn test_is_supported_without_key() {
        assert!(CipherEngine::from_secret(None).is_supported());
        assert_eq!(engine().algorithm().name(), "AES-256-CBC");
    }

    proptest! {
        #[test]
        fn prop_round_trip(plaintext in ".*") {
            let engine = engine();
            let envelope = engine.encrypt(Some(&plaintext), None).unwrap();
            prop_assert_eq!(engine.decrypt(Some(&envelope), None).unwrap(), plaintext);
        }
    }
}
