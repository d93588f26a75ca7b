//! Key material and the Orion2 chained block-cipher decryption.
//!
//! One shared 16-byte master key bootstraps per-device "work keys": a
//! master-key-encrypted exchange delivers a fresh 16-byte work key and its
//! initial 4-byte counter for one traffic direction of one address. Ordinary
//! traffic is then encrypted under the work key, with the counter advancing
//! per frame.
//!
//! The cipher mode is protocol-specific, not a standard library mode: the
//! first keystream block is the AES-ECB encryption of the IV, and every
//! subsequent keystream block is the encryption of the *previous ciphertext
//! block* under the same key.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use tracing::debug;

use crate::registry::{Mac, NUM_ADDRESSES};
use crate::{Error, Result};

/// Shared bus master key. Every installation ships the same constant; it can
/// be overridden per engine for bench rigs and tests.
pub const MASTER_KEY: [u8; 16] = [
    0x4f, 0x72, 0x69, 0x6f, 0x6e, 0x32, 0x4d, 0x61, 0x73, 0x74, 0x65, 0x72, 0x4b, 0x65, 0x79,
    0x21,
];

/// Parse a 32-character hex string into a 16-byte key, for overriding
/// [MASTER_KEY] from configuration text.
///
/// # Errors
/// [Error::Hex] for non-hex input, [Error::Config] for a wrong-length key.
pub fn parse_key(s: &str) -> Result<[u8; 16]> {
    let bytes = hex::decode(s.trim())?;
    bytes
        .try_into()
        .map_err(|_| Error::Config("master key must be exactly 16 bytes".to_string()))
}

/// Traffic direction relative to the addressed device.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Direction {
    /// Destination MAC is the address's registered MAC.
    In = 0,
    /// Traffic leaving the addressed device.
    Out = 1,
}

/// Work-key material for one direction of one address.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkKeyState {
    pub key: Option<[u8; 16]>,
    /// Little-endian 4-byte counter.
    pub counter: Option<[u8; 4]>,
}

/// Key material for one bus address.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyState {
    /// Little-endian counter captured from a number-assign service command,
    /// used in the IV of master-key-encrypted frames.
    pub master_counter: Option<[u8; 4]>,
    /// Per-direction work keys, indexed by [Direction].
    pub work: [WorkKeyState; 2],
}

/// Counter synchronization result.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Sync {
    /// Low byte already matched the frame sequence.
    InSync,
    /// A single increment caught the counter up (one dropped frame).
    Advanced,
    /// Low byte was forcibly overwritten with the received sequence;
    /// decryption output should be treated with suspicion.
    Forced,
}

/// Outcome of a decryption attempt. Missing key material is an expected
/// mid-session condition, not an error.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum CipherOutcome {
    Plaintext { data: Vec<u8>, sync: Sync },
    MissingMasterCounter,
    MissingWorkKey,
}

/// Decrypt `ciphertext` with the chained keystream construction.
///
/// Pure and deterministic: identical inputs always yield identical output.
/// A trailing partial block XORs against the keystream prefix.
#[must_use]
pub fn chained_decrypt(key: &[u8; 16], iv: &[u8; 16], ciphertext: &[u8]) -> Vec<u8> {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut keystream = GenericArray::clone_from_slice(iv);
    cipher.encrypt_block(&mut keystream);

    let mut plain = Vec::with_capacity(ciphertext.len());
    for block in ciphertext.chunks(16) {
        for (c, k) in block.iter().zip(keystream.iter()) {
            plain.push(c ^ k);
        }
        if block.len() == 16 {
            // Next keystream block chains on the ciphertext, not on the
            // keystream or plaintext.
            keystream = GenericArray::clone_from_slice(block);
            cipher.encrypt_block(&mut keystream);
        }
    }
    plain
}

fn build_iv(src: &Mac, dst: &Mac, counter: &[u8; 4]) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..6].copy_from_slice(src);
    iv[6..12].copy_from_slice(dst);
    iv[12..].copy_from_slice(counter);
    iv
}

/// Re-align a counter with the sequence byte carried by the current frame.
///
/// On mismatch the counter is incremented once (little-endian, wrapping) and
/// re-compared; if still mismatched its low byte is forced to the received
/// value, keeping the higher-order bytes. Tolerates single dropped or
/// duplicated frames without losing synchronization entirely.
fn resync(counter: &mut [u8; 4], sequence: u8) -> Sync {
    if counter[0] == sequence {
        return Sync::InSync;
    }
    *counter = u32::from_le_bytes(*counter).wrapping_add(1).to_le_bytes();
    if counter[0] == sequence {
        return Sync::Advanced;
    }
    counter[0] = sequence;
    Sync::Forced
}

/// Per-address key material plus the process-wide master key.
pub struct KeyTable {
    master_key: [u8; 16],
    states: [KeyState; NUM_ADDRESSES],
}

impl KeyTable {
    #[must_use]
    pub fn new(master_key: [u8; 16]) -> Self {
        KeyTable {
            master_key,
            states: [KeyState::default(); NUM_ADDRESSES],
        }
    }

    #[must_use]
    pub fn state(&self, address: u8) -> &KeyState {
        &self.states[(address & 0x1f) as usize]
    }

    /// Store the master counter announced by a number-assign command.
    pub fn seed_master_counter(&mut self, address: u8, counter: [u8; 4]) {
        debug!(address, counter = hex::encode(counter), "master counter seeded");
        self.states[(address & 0x1f) as usize].master_counter = Some(counter);
    }

    /// Decrypt a master-key frame and harvest the work key it delivers.
    ///
    /// The recovered plaintext's trailing 16 bytes are the new work key for
    /// `direction`; the 8 ASCII-hex characters immediately preceding them
    /// decode to that direction's initial work counter.
    pub fn decrypt_master(
        &mut self,
        address: u8,
        direction: Direction,
        src: &Mac,
        dst: &Mac,
        sequence: u8,
        ciphertext: &[u8],
    ) -> CipherOutcome {
        let state = &mut self.states[(address & 0x1f) as usize];
        let Some(counter) = state.master_counter.as_mut() else {
            return CipherOutcome::MissingMasterCounter;
        };

        let sync = resync(counter, sequence);
        let iv = build_iv(src, dst, counter);
        let data = chained_decrypt(&self.master_key, &iv, ciphertext);

        if data.len() >= 24 {
            let n = data.len();
            let mut key = [0u8; 16];
            key.copy_from_slice(&data[n - 16..]);
            match parse_hex_counter(&data[n - 24..n - 16]) {
                Some(work_counter) => {
                    debug!(
                        address,
                        ?direction,
                        counter = hex::encode(work_counter),
                        "work key installed"
                    );
                    state.work[direction as usize] = WorkKeyState {
                        key: Some(key),
                        counter: Some(work_counter),
                    };
                }
                None => debug!(address, "work counter field is not hex; key not installed"),
            }
        }

        CipherOutcome::Plaintext { data, sync }
    }

    /// Decrypt an ordinary work-key frame. On success the direction's work
    /// counter advances by one.
    pub fn decrypt_work(
        &mut self,
        address: u8,
        direction: Direction,
        src: &Mac,
        dst: &Mac,
        sequence: u8,
        ciphertext: &[u8],
    ) -> CipherOutcome {
        let work = &mut self.states[(address & 0x1f) as usize].work[direction as usize];
        let (Some(key), Some(counter)) = (work.key, work.counter.as_mut()) else {
            return CipherOutcome::MissingWorkKey;
        };

        let sync = resync(counter, sequence);
        let iv = build_iv(src, dst, counter);
        let data = chained_decrypt(&key, &iv, ciphertext);
        *counter = u32::from_le_bytes(*counter).wrapping_add(1).to_le_bytes();

        CipherOutcome::Plaintext { data, sync }
    }

    pub fn clear(&mut self) {
        self.states = [KeyState::default(); NUM_ADDRESSES];
    }
}

/// Decode 8 ASCII-hex characters into a 4-byte little-endian counter.
fn parse_hex_counter(dat: &[u8]) -> Option<[u8; 4]> {
    let text = std::str::from_utf8(dat).ok()?;
    let bytes = hex::decode(text).ok()?;
    bytes.try_into().ok()
}
