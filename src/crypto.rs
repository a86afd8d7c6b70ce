//! Security handshake cryptography
//!
//! This module provides the primitives behind the encrypted and substituted
//! credential mechanisms:
//! - Diffie-Hellman key agreement over the fixed DRDA group
//! - DES-CBC encryption and decryption of credentials
//! - Strong password substitution (SHA-1)
//!
//! The 256-bit Diffie-Hellman group and single DES are weak by modern
//! standards. They are fixed by the protocol and exist here only for wire
//! compatibility with servers that require them.

use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use num_bigint::BigUint;
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::constants::secmec;
use crate::exception::{SqlException, SqlResult};

type DesCbcEnc = cbc::Encryptor<des::Des>;
type DesCbcDec = cbc::Decryptor<des::Des>;

/// Width of public keys and shared secrets on the wire
pub const KEY_WIDTH: usize = 32;

/// Length of the DES key and of the encryption token
pub const DES_KEY_LENGTH: usize = 8;

/// Offset of the DES key inside the shared secret, and of the token inside
/// the peer public key
const KEY_OFFSET: usize = 12;

/// Number of bits in a generated private exponent
const PRIVATE_KEY_BITS: usize = 255;

/// Length of a strong password substitute seed
pub const SEED_LENGTH: usize = 8;

/// Length of a password substitute
pub const SUBSTITUTE_LENGTH: usize = 20;

const DES_BLOCK: usize = 8;

/// Fixed DRDA Diffie-Hellman prime
const PRIME: [u8; KEY_WIDTH] = [
    0xC6, 0x21, 0x12, 0xD7, 0x3E, 0xE6, 0x13, 0xF0, 0x94, 0x7A, 0xB3, 0x1F, 0x0F, 0x68, 0x46,
    0xA1, 0xBF, 0xF5, 0xB3, 0xA4, 0xCA, 0x0D, 0x60, 0xBC, 0x1E, 0x4C, 0x7A, 0x0D, 0x8C, 0x16,
    0xB3, 0xE3,
];

/// Fixed DRDA Diffie-Hellman generator
const GENERATOR: [u8; KEY_WIDTH] = [
    0x46, 0x90, 0xFA, 0x1F, 0x7B, 0x9E, 0x1D, 0x44, 0x42, 0xC8, 0x6C, 0x91, 0x14, 0x60, 0x3F,
    0xDE, 0xCF, 0x07, 0x1E, 0xDC, 0xEC, 0x5F, 0x62, 0x6E, 0x21, 0xE2, 0x56, 0xAE, 0xD9, 0xEA,
    0x34, 0xE4,
];

/// Prefix of the stored SHA-1 password form
const SHA1_SCHEME_PREFIX: &str = "3b60";

/// Password sequence constant mixed into the substitute
const PWSEQS: [u8; 8] = [0, 0, 0, 0, 0, 0, 0, 1];

/// Per-connection security state
///
/// Holds the Diffie-Hellman key pair, the shared secret and DES key once
/// derived, and the cached encryption token. [`EncryptionManager::reset`]
/// clears all of it before a connection re-authenticates.
pub struct EncryptionManager {
    private_key: BigUint,
    public_key: [u8; KEY_WIDTH],
    shared_secret: Option<[u8; KEY_WIDTH]>,
    des_key: Option<[u8; DES_KEY_LENGTH]>,
    token: Option<[u8; DES_KEY_LENGTH]>,
}

impl EncryptionManager {
    /// Create a manager with a freshly generated key pair
    pub fn new() -> Self {
        Self::with_private_key(generate_private_key())
    }

    fn with_private_key(private_key: BigUint) -> Self {
        let prime = BigUint::from_bytes_be(&PRIME);
        let generator = BigUint::from_bytes_be(&GENERATOR);
        let public = generator.modpow(&private_key, &prime);
        // The public value is below the 256-bit prime, so it always fits
        let public_key = normalize_key(&public.to_bytes_be()).unwrap_or([0; KEY_WIDTH]);
        Self {
            private_key,
            public_key,
            shared_secret: None,
            des_key: None,
            token: None,
        }
    }

    /// Create a manager from a fixed private exponent
    pub fn from_private_key(private_key: &[u8]) -> Self {
        Self::with_private_key(BigUint::from_bytes_be(private_key))
    }

    /// Public key as sent in SECTKN
    pub fn public_key_bytes(&self) -> [u8; KEY_WIDTH] {
        self.public_key
    }

    /// Whether a shared key has been derived
    pub fn has_shared_key(&self) -> bool {
        self.des_key.is_some()
    }

    /// Complete the key agreement and return the DES key
    ///
    /// The key is derived once; later calls return the cached key.
    pub fn derive_shared_key(&mut self, peer_public_key: &[u8]) -> SqlResult<[u8; DES_KEY_LENGTH]> {
        if let Some(key) = self.des_key {
            return Ok(key);
        }
        let peer = normalize_key(peer_public_key)?;
        let prime = BigUint::from_bytes_be(&PRIME);
        let peer_value = BigUint::from_bytes_be(&peer);
        if peer_value < BigUint::from(2u8) || peer_value >= prime {
            return Err(SqlException::security("peer public key out of range"));
        }
        let secret = normalize_key(&peer_value.modpow(&self.private_key, &prime).to_bytes_be())?;

        let mut key = [0u8; DES_KEY_LENGTH];
        key.copy_from_slice(&secret[KEY_OFFSET..KEY_OFFSET + DES_KEY_LENGTH]);
        fix_parity(&mut key);

        tracing::trace!("Derived shared DES key");
        self.shared_secret = Some(secret);
        self.des_key = Some(key);
        Ok(key)
    }

    /// Normalized shared secret, once derived
    pub fn shared_secret(&self) -> Option<&[u8; KEY_WIDTH]> {
        self.shared_secret.as_ref()
    }

    /// Encrypt `plaintext` with DES-CBC and PKCS#5 padding
    ///
    /// The token used as IV is derived from `iv_source` on first use
    /// according to `mechanism` and cached with the key.
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        mechanism: u16,
        iv_source: &[u8],
        peer_public_key: &[u8],
    ) -> SqlResult<Vec<u8>> {
        let (key, iv) = self.cipher_params(mechanism, iv_source, peer_public_key)?;

        let padding = DES_BLOCK - plaintext.len() % DES_BLOCK;
        let mut buffer = plaintext.to_vec();
        buffer.extend(std::iter::repeat(padding as u8).take(padding));
        let total = buffer.len();

        let cipher = DesCbcEnc::new_from_slices(&key, &iv)
            .map_err(|e| SqlException::security(format!("invalid DES key: {}", e)))?;
        let ciphertext = cipher
            .encrypt_padded_mut::<NoPadding>(&mut buffer, total)
            .map_err(|e| SqlException::security(format!("DES encryption failed: {}", e)))?;
        Ok(ciphertext.to_vec())
    }

    /// Decrypt DES-CBC ciphertext produced by [`EncryptionManager::encrypt`]
    pub fn decrypt(
        &mut self,
        ciphertext: &[u8],
        mechanism: u16,
        iv_source: &[u8],
        peer_public_key: &[u8],
    ) -> SqlResult<Vec<u8>> {
        if ciphertext.is_empty() || ciphertext.len() % DES_BLOCK != 0 {
            return Err(SqlException::security(format!(
                "ciphertext length {} is not a multiple of {}",
                ciphertext.len(),
                DES_BLOCK
            )));
        }
        let (key, iv) = self.cipher_params(mechanism, iv_source, peer_public_key)?;

        let cipher = DesCbcDec::new_from_slices(&key, &iv)
            .map_err(|e| SqlException::security(format!("invalid DES key: {}", e)))?;
        let mut buffer = ciphertext.to_vec();
        let plain = cipher
            .decrypt_padded_mut::<NoPadding>(&mut buffer)
            .map_err(|e| SqlException::security(format!("DES decryption failed: {}", e)))?;

        let padding = plain.last().copied().unwrap_or(0) as usize;
        if padding == 0
            || padding > DES_BLOCK
            || plain[plain.len() - padding..].iter().any(|b| *b as usize != padding)
        {
            return Err(SqlException::security("bad padding in decrypted data"));
        }
        Ok(plain[..plain.len() - padding].to_vec())
    }

    fn cipher_params(
        &mut self,
        mechanism: u16,
        iv_source: &[u8],
        peer_public_key: &[u8],
    ) -> SqlResult<([u8; DES_KEY_LENGTH], [u8; DES_KEY_LENGTH])> {
        let key = self.derive_shared_key(peer_public_key)?;
        let token = match self.token {
            Some(token) => token,
            None => {
                let token = encryption_token(mechanism, iv_source)?;
                self.token = Some(token);
                token
            }
        };
        Ok((key, token))
    }

    /// Compute the strong password substitute
    ///
    /// ```text
    /// stored   = "3b60" + hex(SHA1(hex_bytes(password)))
    /// token    = SHA1(user, hex_bytes(stored))
    /// result   = SHA1(token, target_seed, source_seed, user, PWSEQS)
    /// ```
    pub fn substitute_password(
        &self,
        user: &str,
        password: &str,
        source_seed: &[u8],
        target_seed: &[u8],
    ) -> SqlResult<[u8; SUBSTITUTE_LENGTH]> {
        if source_seed.len() != SEED_LENGTH || target_seed.len() != SEED_LENGTH {
            return Err(SqlException::security(format!(
                "password substitute seeds must be {} bytes",
                SEED_LENGTH
            )));
        }

        let hashed = Sha1::digest(to_hex_byte(password));
        let stored = format!("{}{}", SHA1_SCHEME_PREFIX, hex::encode(hashed));

        let mut digest = Sha1::new();
        digest.update(user.as_bytes());
        digest.update(to_hex_byte(&stored));
        let password_token = digest.finalize();

        let mut digest = Sha1::new();
        digest.update(password_token);
        digest.update(target_seed);
        digest.update(source_seed);
        digest.update(user.as_bytes());
        digest.update(PWSEQS);

        let mut substitute = [0u8; SUBSTITUTE_LENGTH];
        substitute.copy_from_slice(&digest.finalize());
        Ok(substitute)
    }

    /// Forget all negotiated state and generate a new key pair
    pub fn reset(&mut self) {
        *self = Self::new();
        tracing::trace!("Security state reset");
    }
}

impl Default for EncryptionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EncryptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionManager")
            .field("public_key", &hex::encode(self.public_key))
            .field("has_shared_key", &self.has_shared_key())
            .finish()
    }
}

fn generate_private_key() -> BigUint {
    let mut bytes = [0u8; KEY_WIDTH];
    OsRng.fill_bytes(&mut bytes);
    let excess_bits = KEY_WIDTH * 8 - PRIVATE_KEY_BITS;
    bytes[0] &= 0xFF >> excess_bits;
    bytes[0] |= 0x80 >> excess_bits;
    BigUint::from_bytes_be(&bytes)
}

/// Generate a random client seed for password substitution
pub fn generate_seed() -> [u8; SEED_LENGTH] {
    let mut seed = [0u8; SEED_LENGTH];
    OsRng.fill_bytes(&mut seed);
    seed
}

/// Normalize a big-endian integer to exactly [`KEY_WIDTH`] bytes
///
/// A single leading zero sign byte is stripped; shorter values are
/// left-padded with zeros. Anything else longer fails.
pub fn normalize_key(bytes: &[u8]) -> SqlResult<[u8; KEY_WIDTH]> {
    let mut out = [0u8; KEY_WIDTH];
    match bytes.len() {
        n if n == KEY_WIDTH + 1 && bytes[0] == 0 => out.copy_from_slice(&bytes[1..]),
        n if n <= KEY_WIDTH => out[KEY_WIDTH - n..].copy_from_slice(bytes),
        n => {
            return Err(SqlException::security(format!(
                "key length {} exceeds {} bytes",
                n, KEY_WIDTH
            )))
        }
    }
    Ok(out)
}

/// Force odd parity on every byte by adjusting its low bit
pub fn fix_parity(key: &mut [u8]) {
    for byte in key.iter_mut() {
        let high_bits = (*byte >> 1).count_ones();
        if high_bits % 2 == 0 {
            *byte |= 0x01;
        } else {
            *byte &= 0xFE;
        }
    }
}

/// Derive the 8-byte encryption token for a mechanism
///
/// `USRENCPWD` uses the first eight bytes of the user id, zero padded.
/// `EUSRIDPWD` uses bytes 12..20 of the peer public key.
pub fn encryption_token(mechanism: u16, iv_source: &[u8]) -> SqlResult<[u8; DES_KEY_LENGTH]> {
    let mut token = [0u8; DES_KEY_LENGTH];
    match mechanism {
        secmec::USRENCPWD => {
            let n = iv_source.len().min(DES_KEY_LENGTH);
            token[..n].copy_from_slice(&iv_source[..n]);
        }
        secmec::EUSRIDPWD => {
            let slice = iv_source
                .get(KEY_OFFSET..KEY_OFFSET + DES_KEY_LENGTH)
                .ok_or_else(|| SqlException::security("peer public key too short for token"))?;
            token.copy_from_slice(slice);
        }
        other => {
            return Err(SqlException::security(format!(
                "security mechanism {} does not use encryption",
                other
            )))
        }
    }
    Ok(token)
}

/// Nibble expansion used by the stored password form
///
/// Produces `2 * len` bytes. Each character writes its high nibble at index
/// `i` and its low nibble at `i + 1`, so every low nibble except the last is
/// overwritten by the next character's high nibble and the upper half stays
/// zero. Servers compute the same bytes, so the layout must not change.
pub fn to_hex_byte(s: &str) -> Vec<u8> {
    let units: Vec<u16> = s.encode_utf16().collect();
    let mut data = vec![0u8; units.len() * 2];
    for (i, unit) in units.iter().enumerate() {
        data[i] = ((unit & 0xF0) >> 4) as u8;
        data[i + 1] = (unit & 0x0F) as u8;
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_key_widths() {
        let short = vec![0xAB; KEY_WIDTH - 1];
        let normalized = normalize_key(&short).unwrap();
        assert_eq!(normalized[0], 0);
        assert_eq!(&normalized[1..], &short[..]);

        let exact = vec![0xCD; KEY_WIDTH];
        assert_eq!(normalize_key(&exact).unwrap().to_vec(), exact);

        let mut long = vec![0x00];
        long.extend(vec![0xEF; KEY_WIDTH]);
        assert_eq!(normalize_key(&long).unwrap().to_vec(), vec![0xEF; KEY_WIDTH]);

        let err = normalize_key(&vec![0x01; KEY_WIDTH + 1]).unwrap_err();
        assert_eq!(err.sql_state(), "08001");
    }

    #[test]
    fn test_fix_parity() {
        let mut key = [0x00, 0x01, 0xFE, 0x80, 0x7F, 0x13, 0x2C, 0xFF];
        fix_parity(&mut key);
        for byte in key {
            assert_eq!(byte.count_ones() % 2, 1, "byte {:02X}", byte);
        }
        assert_eq!(key[0], 0x01);
        assert_eq!(key[1], 0x01);
    }

    #[test]
    fn test_key_agreement_and_round_trip() {
        let mut client = EncryptionManager::new();
        let mut server = EncryptionManager::new();
        let client_public = client.public_key_bytes();
        let server_public = server.public_key_bytes();

        let k1 = client.derive_shared_key(&server_public).unwrap();
        let k2 = server.derive_shared_key(&client_public).unwrap();
        assert_eq!(k1, k2);
        assert!(k1.iter().all(|b| b.count_ones() % 2 == 1));

        let encrypted = client
            .encrypt(b"secret", secmec::EUSRIDPWD, &server_public, &server_public)
            .unwrap();
        assert_eq!(encrypted.len(), 8);
        let plain = server
            .decrypt(&encrypted, secmec::EUSRIDPWD, &server_public, &client_public)
            .unwrap();
        assert_eq!(plain, b"secret");
    }

    #[test]
    fn test_token_rules() {
        assert_eq!(
            encryption_token(secmec::USRENCPWD, b"app").unwrap(),
            [b'a', b'p', b'p', 0, 0, 0, 0, 0]
        );
        assert_eq!(
            encryption_token(secmec::USRENCPWD, b"application").unwrap(),
            *b"applicat"
        );
        let peer: Vec<u8> = (0..32).collect();
        assert_eq!(
            encryption_token(secmec::EUSRIDPWD, &peer).unwrap(),
            [12, 13, 14, 15, 16, 17, 18, 19]
        );
        assert!(encryption_token(secmec::USRIDPWD, &peer).is_err());
    }

    #[test]
    fn test_to_hex_byte_overlap() {
        // '1' = 0x31, '2' = 0x32
        assert_eq!(to_hex_byte("12"), vec![0x3, 0x3, 0x2, 0x0]);
        assert!(to_hex_byte("").is_empty());
    }

    #[test]
    fn test_substitute_is_deterministic() {
        let manager = EncryptionManager::new();
        let source = [1u8; 8];
        let target = [2u8; 8];
        let a = manager.substitute_password("APP", "pw", &source, &target).unwrap();
        let b = manager.substitute_password("APP", "pw", &source, &target).unwrap();
        assert_eq!(a, b);
        let c = manager.substitute_password("APP", "pw", &target, &source).unwrap();
        assert_ne!(a, c);
        assert!(manager.substitute_password("APP", "pw", &[0; 4], &target).is_err());
    }

    #[test]
    fn test_reset_forgets_secret() {
        let mut client = EncryptionManager::new();
        let server = EncryptionManager::new();
        client.derive_shared_key(&server.public_key_bytes()).unwrap();
        let old_public = client.public_key_bytes();
        client.reset();
        assert!(!client.has_shared_key());
        assert!(client.shared_secret().is_none());
        assert_ne!(client.public_key_bytes(), old_public);
    }

    #[test]
    fn test_bad_ciphertext_length() {
        let mut client = EncryptionManager::new();
        let server = EncryptionManager::new();
        let err = client
            .decrypt(&[1, 2, 3], secmec::EUSRIDPWD, &server.public_key_bytes(), &server.public_key_bytes())
            .unwrap_err();
        assert_eq!(err.sql_state(), "08001");
    }
}
