//! Property value encryption
//!
//! Values are encrypted with a 128 bit block cipher in CBC mode with PKCS#7
//! padding. Every encrypting write draws a fresh random IV; the IV is stored
//! next to the ciphertext (as a separate column in the database, prepended
//! to the ciphertext in the bootstrap file). The one exception is the key
//! that protects the other keys: it is sealed with a built-in key and a
//! fixed IV so it can be recovered before any configuration is readable.

use aes::Aes128;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use camellia::Camellia128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::Rng;

use crate::prelude::*;

/// Key and block size of both supported ciphers
pub const KEY_LEN: usize = 16;

/// Built-in key material used when no key is configured and for sealing the
/// configured key itself. Provides obfuscation only, not secrecy.
const DEFAULT_KEY_MATERIAL: &str = "9c82cbd14e6b7fa3d02155e8a9301d47";

/// Fixed IV for the key-sealing cipher. Never used for property values.
const SEAL_IV: [u8; KEY_LEN] = [
	0x1b, 0x74, 0xc2, 0x0f, 0x5a, 0x99, 0xe3, 0x28, 0x46, 0xd1, 0x8b, 0x60, 0x3e, 0xf7, 0x2d, 0x95,
];

/// Supported property encryption algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
	Aes,
	Camellia,
}

impl CipherAlgorithm {
	/// Resolve an algorithm name from the security file.
	///
	/// A missing or unrecognized name selects Camellia, which is what
	/// existing installations without an explicit algorithm setting used.
	pub fn from_name(name: Option<&str>) -> Self {
		match name {
			Some("AES") => CipherAlgorithm::Aes,
			Some("Camellia") | None => CipherAlgorithm::Camellia,
			Some(other) => {
				warn!("Unknown encryption algorithm '{}', falling back to Camellia", other);
				CipherAlgorithm::Camellia
			}
		}
	}

	pub fn name(&self) -> &'static str {
		match self {
			CipherAlgorithm::Aes => "AES",
			CipherAlgorithm::Camellia => "Camellia",
		}
	}
}

/// Derive a fixed-size cipher key from configured key material.
///
/// The material's UTF-8 bytes are truncated or zero-padded to [`KEY_LEN`].
fn derive_key(material: Option<&str>) -> [u8; KEY_LEN] {
	let bytes = material.unwrap_or(DEFAULT_KEY_MATERIAL).as_bytes();
	let mut key = [0u8; KEY_LEN];
	let n = bytes.len().min(KEY_LEN);
	key[..n].copy_from_slice(&bytes[..n]);
	key
}

/// A concrete algorithm + key pair used to encrypt and decrypt values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherStrategy {
	pub algorithm: CipherAlgorithm,
	key: [u8; KEY_LEN],
}

impl CipherStrategy {
	/// Create a strategy from configured key material (`None` selects the
	/// built-in default key).
	pub fn new(algorithm: CipherAlgorithm, material: Option<&str>) -> Self {
		Self { algorithm, key: derive_key(material) }
	}

	/// The cipher that seals the configured key itself: AES with the
	/// built-in key and a fixed IV.
	pub fn sealing() -> Self {
		Self { algorithm: CipherAlgorithm::Aes, key: derive_key(None) }
	}

	fn encrypt_raw(&self, iv: &[u8; KEY_LEN], plain: &[u8]) -> Vec<u8> {
		match self.algorithm {
			CipherAlgorithm::Aes => cbc::Encryptor::<Aes128>::new(&self.key.into(), &(*iv).into())
				.encrypt_padded_vec_mut::<Pkcs7>(plain),
			CipherAlgorithm::Camellia => {
				cbc::Encryptor::<Camellia128>::new(&self.key.into(), &(*iv).into())
					.encrypt_padded_vec_mut::<Pkcs7>(plain)
			}
		}
	}

	fn decrypt_raw(&self, iv: &[u8; KEY_LEN], ciphertext: &[u8]) -> BtResult<Vec<u8>> {
		let res = match self.algorithm {
			CipherAlgorithm::Aes => cbc::Decryptor::<Aes128>::new(&self.key.into(), &(*iv).into())
				.decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
			CipherAlgorithm::Camellia => {
				cbc::Decryptor::<Camellia128>::new(&self.key.into(), &(*iv).into())
					.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
			}
		};
		res.map_err(|_| Error::CryptoError)
	}

	/// Encrypt a value with a fresh random IV.
	///
	/// Returns `(iv, ciphertext)`, both base64 encoded.
	pub fn encrypt(&self, plain: &str) -> (Box<str>, Box<str>) {
		let mut iv = [0u8; KEY_LEN];
		rand::rng().fill_bytes(&mut iv);
		let ciphertext = self.encrypt_raw(&iv, plain.as_bytes());
		(B64.encode(iv).into(), B64.encode(ciphertext).into())
	}

	/// Decrypt a `(iv, ciphertext)` base64 pair.
	pub fn decrypt(&self, iv_b64: &str, ciphertext_b64: &str) -> BtResult<Box<str>> {
		let iv_bytes = B64.decode(iv_b64).map_err(|_| Error::CryptoError)?;
		let iv: [u8; KEY_LEN] = iv_bytes.try_into().map_err(|_| Error::CryptoError)?;
		let ciphertext = B64.decode(ciphertext_b64).map_err(|_| Error::CryptoError)?;
		let plain = self.decrypt_raw(&iv, &ciphertext)?;
		String::from_utf8(plain).map(String::into_boxed_str).map_err(|_| Error::CryptoError)
	}

	/// Encrypt with a fresh IV into a single base64 string of `iv || ct`.
	///
	/// Used by the bootstrap file, which stores one text node per value.
	pub fn encrypt_embedded(&self, plain: &str) -> Box<str> {
		let mut iv = [0u8; KEY_LEN];
		rand::rng().fill_bytes(&mut iv);
		let mut out = iv.to_vec();
		out.extend(self.encrypt_raw(&iv, plain.as_bytes()));
		B64.encode(out).into()
	}

	/// Decrypt a single base64 string of `iv || ct`.
	pub fn decrypt_embedded(&self, data: &str) -> BtResult<Box<str>> {
		let bytes = B64.decode(data).map_err(|_| Error::CryptoError)?;
		if bytes.len() <= KEY_LEN {
			return Err(Error::CryptoError);
		}
		let iv: [u8; KEY_LEN] = bytes[..KEY_LEN].try_into().map_err(|_| Error::CryptoError)?;
		let plain = self.decrypt_raw(&iv, &bytes[KEY_LEN..])?;
		String::from_utf8(plain).map(String::into_boxed_str).map_err(|_| Error::CryptoError)
	}

	/// Seal a value with the fixed IV. Only [`CipherStrategy::sealing`]
	/// should call this; property values always get fresh IVs.
	pub fn seal(&self, plain: &str) -> Box<str> {
		B64.encode(self.encrypt_raw(&SEAL_IV, plain.as_bytes())).into()
	}

	/// Inverse of [`CipherStrategy::seal`].
	pub fn open(&self, data: &str) -> BtResult<Box<str>> {
		let ciphertext = B64.decode(data).map_err(|_| Error::CryptoError)?;
		let plain = self.decrypt_raw(&SEAL_IV, &ciphertext)?;
		String::from_utf8(plain).map(String::into_boxed_str).map_err(|_| Error::CryptoError)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_round_trip_aes() {
		let cipher = CipherStrategy::new(CipherAlgorithm::Aes, Some("test key"));
		let (iv, ct) = cipher.encrypt("secret value");
		assert_eq!(cipher.decrypt(&iv, &ct).unwrap().as_ref(), "secret value");
	}

	#[test]
	fn test_round_trip_camellia() {
		let cipher = CipherStrategy::new(CipherAlgorithm::Camellia, Some("test key"));
		let (iv, ct) = cipher.encrypt("secret value");
		assert_eq!(cipher.decrypt(&iv, &ct).unwrap().as_ref(), "secret value");
	}

	#[test]
	fn test_fresh_iv_per_encryption() {
		let cipher = CipherStrategy::new(CipherAlgorithm::Aes, Some("test key"));
		let (iv1, _) = cipher.encrypt("same value");
		let (iv2, _) = cipher.encrypt("same value");
		assert_ne!(iv1, iv2);
	}

	#[test]
	fn test_wrong_key_fails() {
		let cipher = CipherStrategy::new(CipherAlgorithm::Aes, Some("key one"));
		let other = CipherStrategy::new(CipherAlgorithm::Aes, Some("key two"));
		let (iv, ct) = cipher.encrypt("secret value");
		// Wrong key either fails padding validation or produces garbage;
		// it must never return the plaintext
		if let Ok(plain) = other.decrypt(&iv, &ct) {
			assert_ne!(plain.as_ref(), "secret value");
		}
	}

	#[test]
	fn test_key_material_padding() {
		// Material longer than the key is truncated, so two materials with
		// the same 16 byte prefix are the same key
		let a = CipherStrategy::new(CipherAlgorithm::Aes, Some("0123456789abcdefXXX"));
		let b = CipherStrategy::new(CipherAlgorithm::Aes, Some("0123456789abcdefYYY"));
		let (iv, ct) = a.encrypt("value");
		assert_eq!(b.decrypt(&iv, &ct).unwrap().as_ref(), "value");
	}

	#[test]
	fn test_embedded_round_trip() {
		let cipher = CipherStrategy::new(CipherAlgorithm::Camellia, None);
		let data = cipher.encrypt_embedded("bootstrap secret");
		assert_eq!(cipher.decrypt_embedded(&data).unwrap().as_ref(), "bootstrap secret");
	}

	#[test]
	fn test_seal_is_deterministic() {
		let sealing = CipherStrategy::sealing();
		let a = sealing.seal("key material");
		let b = sealing.seal("key material");
		assert_eq!(a, b);
		assert_eq!(sealing.open(&a).unwrap().as_ref(), "key material");
	}

	#[test]
	fn test_garbage_input_is_an_error() {
		let cipher = CipherStrategy::new(CipherAlgorithm::Aes, None);
		assert!(cipher.decrypt("not base64!!", "zzz").is_err());
		assert!(cipher.decrypt_embedded("c2hvcnQ=").is_err());
	}
}

// vim: ts=4
