use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use parking_lot::RwLock;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use zeroize::{Zeroize, Zeroizing};

use crate::engine::buffer;
use crate::{Error, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Size of the derived AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;
/// Default PBKDF2 iteration count for [`CipherProvider::generate_password_hash`].
pub const DEFAULT_HASH_ITERATIONS: u32 = 991;

const SALT_SIZE: usize = 16;
const HASH_SIZE: usize = 64;

// Shared by every key. Whole snapshots are re-encrypted on each write, so a passphrase
// must not be reused to encrypt unrelated plaintexts where IV reuse would matter.
const FIXED_IV: [u8; BLOCK_SIZE] = [
    0x51, 0x75, 0x69, 0x76, 0x65, 0x72, 0x2d, 0x53, 0x74, 0x6f, 0x72, 0x65, 0x2d, 0x49, 0x56, 0x31,
];

/// AES-256-CBC with PKCS7 padding under a key derived from a passphrase.
///
/// The key is SHA-256 of the UTF-8 passphrase. Key material is zeroized on
/// [`release`](Self::release) and on drop; any use after release fails with
/// [`Error::Released`] (or degrades to an empty result on the lenient decrypt path).
pub struct CipherProvider {
    key: RwLock<Option<Zeroizing<[u8; KEY_SIZE]>>>,
}

impl CipherProvider {
    /// Derives a provider from `passphrase`.
    pub fn new(passphrase: &str) -> Result<Self> {
        if passphrase.is_empty() {
            return Err(Error::InvalidArgument(
                "encryption passphrase must not be empty".to_string(),
            ));
        }

        let mut staged = buffer::bytes().rent(passphrase.len());
        staged.write(passphrase.as_bytes());
        let digest = Sha256::digest(staged.written());
        staged.written_mut().zeroize();

        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(&digest);
        Ok(Self {
            key: RwLock::new(Some(key)),
        })
    }

    /// Length of the ciphertext produced for `plaintext_len` bytes.
    pub fn encrypted_len(plaintext_len: usize) -> usize {
        (plaintext_len / BLOCK_SIZE + 1) * BLOCK_SIZE
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.with_key(|key| {
            let enc = Aes256CbcEnc::new_from_slices(key, &FIXED_IV)
                .map_err(|e| Error::Encryption(e.to_string()))?;
            Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
        })
    }

    /// Encrypts into `destination`, returning the number of bytes written.
    ///
    /// `destination` must hold at least [`encrypted_len`](Self::encrypted_len) bytes.
    pub fn encrypt_into(&self, plaintext: &[u8], destination: &mut [u8]) -> Result<usize> {
        let needed = Self::encrypted_len(plaintext.len());
        if destination.len() < needed {
            return Err(Error::OutOfRange {
                requested: needed,
                available: destination.len(),
            });
        }
        self.with_key(|key| {
            let enc = Aes256CbcEnc::new_from_slices(key, &FIXED_IV)
                .map_err(|e| Error::Encryption(e.to_string()))?;
            enc.encrypt_padded_b2b_mut::<Pkcs7>(plaintext, destination)
                .map(|out| out.len())
                .map_err(|_| Error::Encryption("padding failed".to_string()))
        })
    }

    /// Decrypts `ciphertext`, returning an empty vector on any failure.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Vec<u8> {
        self.try_decrypt(ciphertext).unwrap_or_else(|e| {
            log::debug!("Lenient decrypt returned empty result: {}", e);
            Vec::new()
        })
    }

    /// Decrypts `ciphertext`, reporting wrong keys, corrupt data and bad padding.
    pub fn try_decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        check_ciphertext(ciphertext)?;
        self.with_key(|key| {
            let dec = Aes256CbcDec::new_from_slices(key, &FIXED_IV)
                .map_err(|e| Error::Decryption(e.to_string()))?;
            dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| Error::Decryption("wrong key or corrupt data".to_string()))
        })
    }

    /// Decrypts into `destination`, returning the plaintext length.
    ///
    /// `destination` must hold at least `ciphertext.len()` bytes.
    pub fn decrypt_into(&self, ciphertext: &[u8], destination: &mut [u8]) -> Result<usize> {
        check_ciphertext(ciphertext)?;
        if destination.len() < ciphertext.len() {
            return Err(Error::OutOfRange {
                requested: ciphertext.len(),
                available: destination.len(),
            });
        }
        self.with_key(|key| {
            let dec = Aes256CbcDec::new_from_slices(key, &FIXED_IV)
                .map_err(|e| Error::Decryption(e.to_string()))?;
            dec.decrypt_padded_b2b_mut::<Pkcs7>(ciphertext, destination)
                .map(|out| out.len())
                .map_err(|_| Error::Decryption("wrong key or corrupt data".to_string()))
        })
    }

    /// Encrypts UTF-8 text into unpadded URL-safe Base64.
    pub fn encrypt_url(&self, text: &str) -> Result<String> {
        let sealed = self.encrypt(text.as_bytes())?;
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    /// Reverses [`encrypt_url`](Self::encrypt_url).
    pub fn decrypt_url(&self, encoded: &str) -> Result<String> {
        let sealed = URL_SAFE_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .map_err(|e| Error::Decryption(e.to_string()))?;
        let plain = self.try_decrypt(&sealed)?;
        String::from_utf8(plain).map_err(|e| Error::Decryption(e.to_string()))
    }

    /// Hashes `password` with PBKDF2-HMAC-SHA512 and a random salt.
    ///
    /// The result reads `salt|iterations|hash`, with salt and hash in Base64.
    pub fn generate_password_hash(password: &str, iterations: u32) -> Result<String> {
        if iterations == 0 {
            return Err(Error::InvalidArgument(
                "iteration count must be positive".to_string(),
            ));
        }
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        let hash = derive_password(password, &salt, iterations);
        Ok(format!(
            "{}|{}|{}",
            STANDARD.encode(salt),
            iterations,
            STANDARD.encode(&hash[..])
        ))
    }

    /// Checks `password` against a hash produced by
    /// [`generate_password_hash`](Self::generate_password_hash). Malformed hashes never verify.
    pub fn verify_password(password: &str, hash: &str) -> bool {
        let mut parts = hash.split('|');
        let (Some(salt), Some(iterations), Some(expected), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return false;
        };
        let (Ok(salt), Ok(iterations), Ok(expected)) = (
            STANDARD.decode(salt),
            iterations.parse::<u32>(),
            STANDARD.decode(expected),
        ) else {
            return false;
        };
        if iterations == 0 || expected.len() != HASH_SIZE {
            return false;
        }
        let actual = derive_password(password, &salt, iterations);
        constant_time_eq(&actual[..], &expected)
    }

    /// Zeroizes the key. Calling it more than once is harmless.
    pub fn release(&self) {
        self.key.write().take();
    }

    pub fn is_released(&self) -> bool {
        self.key.read().is_none()
    }

    fn with_key<R>(&self, f: impl FnOnce(&[u8]) -> Result<R>) -> Result<R> {
        let guard = self.key.read();
        match guard.as_ref() {
            Some(key) => f(&key[..]),
            None => Err(Error::Released),
        }
    }
}

impl std::fmt::Debug for CipherProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherProvider")
            .field("key", &"[REDACTED]")
            .field("released", &self.is_released())
            .finish()
    }
}

fn check_ciphertext(ciphertext: &[u8]) -> Result<()> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(Error::Decryption(format!(
            "ciphertext length {} is not a positive multiple of {}",
            ciphertext.len(),
            BLOCK_SIZE
        )));
    }
    Ok(())
}

fn derive_password(password: &str, salt: &[u8], iterations: u32) -> Zeroizing<[u8; HASH_SIZE]> {
    let mut out = Zeroizing::new([0u8; HASH_SIZE]);
    pbkdf2::pbkdf2_hmac::<Sha512>(password.as_bytes(), salt, iterations, &mut out[..]);
    out
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = CipherProvider::new("correct horse").unwrap();
        let plaintext = b"Hello, Quiver!";
        let sealed = cipher.encrypt(plaintext).unwrap();
        assert_ne!(&sealed[..], &plaintext[..]);
        assert_eq!(sealed.len(), CipherProvider::encrypted_len(plaintext.len()));
        assert_eq!(cipher.decrypt(&sealed), plaintext);
    }

    #[test]
    fn test_same_passphrase_same_ciphertext() {
        let a = CipherProvider::new("k").unwrap();
        let b = CipherProvider::new("k").unwrap();
        assert_eq!(a.encrypt(b"abc").unwrap(), b.encrypt(b"abc").unwrap());
    }

    #[test]
    fn test_decrypt_with_wrong_key_is_lenient_by_default() {
        let right = CipherProvider::new("right").unwrap();
        let wrong = CipherProvider::new("wrong").unwrap();
        let sealed = right.encrypt(b"Secret message").unwrap();

        let lenient = wrong.decrypt(&sealed);
        assert_ne!(lenient, b"Secret message");
        assert!(wrong.decrypt(b"not a block multiple").is_empty());
        assert!(matches!(
            wrong.try_decrypt(b"not a block multiple"),
            Err(Error::Decryption(_))
        ));
    }

    #[test]
    fn test_into_variants() {
        let cipher = CipherProvider::new("k").unwrap();
        let mut sealed = [0u8; 64];
        let n = cipher.encrypt_into(b"0123456789abcdef", &mut sealed).unwrap();
        assert_eq!(n, 32);

        let mut plain = [0u8; 32];
        let m = cipher.decrypt_into(&sealed[..n], &mut plain).unwrap();
        assert_eq!(&plain[..m], b"0123456789abcdef");

        let mut tiny = [0u8; 8];
        assert!(matches!(
            cipher.encrypt_into(b"abc", &mut tiny),
            Err(Error::OutOfRange { requested: 16, available: 8 })
        ));
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        assert!(matches!(CipherProvider::new(""), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_release_is_idempotent() {
        let cipher = CipherProvider::new("k").unwrap();
        let sealed = cipher.encrypt(b"data").unwrap();
        cipher.release();
        cipher.release();
        assert!(cipher.is_released());
        assert!(matches!(cipher.encrypt(b"data"), Err(Error::Released)));
        assert!(cipher.decrypt(&sealed).is_empty());
    }

    #[test]
    fn test_password_hash_roundtrip() {
        let hash = CipherProvider::generate_password_hash("pa55word", DEFAULT_HASH_ITERATIONS).unwrap();
        let parts: Vec<&str> = hash.split('|').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1], "991");

        assert!(CipherProvider::verify_password("pa55word", &hash));
        assert!(!CipherProvider::verify_password("password", &hash));
        assert!(!CipherProvider::verify_password("pa55word", "garbage"));
    }

    #[test]
    fn test_password_hash_is_salted() {
        let a = CipherProvider::generate_password_hash("same", 10).unwrap();
        let b = CipherProvider::generate_password_hash("same", 10).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_url_roundtrip() {
        let cipher = CipherProvider::new("k").unwrap();
        let encoded = cipher.encrypt_url("user=42&role=admin").unwrap();
        assert!(!encoded.contains('+') && !encoded.contains('/') && !encoded.contains('='));
        assert_eq!(cipher.decrypt_url(&encoded).unwrap(), "user=42&role=admin");
        assert!(cipher.decrypt_url("!!!").is_err());
    }
}
