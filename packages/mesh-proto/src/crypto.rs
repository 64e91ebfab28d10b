//! Channel-key derivation and packet decryption.
//!
//! Meshtastic channels are protected by a pre-shared key configured as
//! base64 text. Short PSKs select one of the stock firmware keys; full-length
//! PSKs are used directly; anything else is hashed down to 128 bits. Packet
//! payloads are AES-CTR with a nonce built from the packet id and sender id.

use aes::cipher::{KeyIvInit, StreamCipher};
use base64::Engine;
use sha2::{Digest, Sha256};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// The stock firmware PSK ("AQ==" / channel key index 1).
const DEFAULT_PSK: [u8; 16] = [
    0xd4, 0xf1, 0xbb, 0x3a, 0x20, 0x29, 0x07, 0x59,
    0xf0, 0xbc, 0xff, 0xab, 0xcf, 0x4e, 0x69, 0x01,
];

/// Number of indexed "simple" keys the firmware ships.
const PSK_TABLE_LEN: u8 = 8;

/// Indexed PSK table: entries 0 and 1 are the stock key, higher entries
/// increment its last byte; indices past the table fall back to entry 0.
fn indexed_psk(index: u8) -> [u8; 16] {
    let mut key = DEFAULT_PSK;
    if (2..PSK_TABLE_LEN).contains(&index) {
        key[15] = key[15].wrapping_add(index - 1);
    }
    key
}

/// A derived symmetric channel key.
#[derive(Clone)]
pub enum ChannelKey {
    Aes128([u8; 16]),
    Aes256([u8; 32]),
}

impl ChannelKey {
    /// Derive the channel key from a base64 PSK string.
    ///
    /// Rules, in order: undecodable text → SHA-256(text) truncated to 16
    /// bytes; empty → stock key; one byte → indexed key table; 16 or 32
    /// bytes → used directly; any other length → SHA-256(bytes) truncated.
    pub fn from_psk(psk_b64: &str) -> Self {
        let bytes = match base64::engine::general_purpose::STANDARD.decode(psk_b64) {
            Ok(b) => b,
            Err(_) => return Self::Aes128(sha256_16(psk_b64.as_bytes())),
        };
        match bytes.len() {
            0 => Self::Aes128(indexed_psk(0)),
            1 => Self::Aes128(indexed_psk(bytes[0])),
            16 => {
                let mut key = [0u8; 16];
                key.copy_from_slice(&bytes);
                Self::Aes128(key)
            }
            32 => {
                let mut key = [0u8; 32];
                key.copy_from_slice(&bytes);
                Self::Aes256(key)
            }
            _ => Self::Aes128(sha256_16(&bytes)),
        }
    }

    /// Decrypt (or encrypt — CTR is symmetric) a packet payload in place.
    ///
    /// Nonce layout is the published wire format: packet id as 8 LE bytes,
    /// sender id as 4 LE bytes, 4 zero bytes.
    pub fn apply(&self, packet_id: u32, from_node: u32, buf: &mut [u8]) {
        let mut nonce = [0u8; 16];
        nonce[..8].copy_from_slice(&(packet_id as u64).to_le_bytes());
        nonce[8..12].copy_from_slice(&from_node.to_le_bytes());
        match self {
            Self::Aes128(key) => {
                Aes128Ctr::new(key.into(), (&nonce).into()).apply_keystream(buf)
            }
            Self::Aes256(key) => {
                Aes256Ctr::new(key.into(), (&nonce).into()).apply_keystream(buf)
            }
        }
    }

    pub fn decrypt(&self, packet_id: u32, from_node: u32, ciphertext: &[u8]) -> Vec<u8> {
        let mut buf = ciphertext.to_vec();
        self.apply(packet_id, from_node, &mut buf);
        buf
    }
}

fn sha256_16(input: &[u8]) -> [u8; 16] {
    let digest = Sha256::digest(input);
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_bytes(key: &ChannelKey) -> Vec<u8> {
        match key {
            ChannelKey::Aes128(k) => k.to_vec(),
            ChannelKey::Aes256(k) => k.to_vec(),
        }
    }

    #[test]
    fn default_psk_from_index_one() {
        // "AQ==" decodes to [0x01]
        let key = ChannelKey::from_psk("AQ==");
        assert_eq!(key_bytes(&key), DEFAULT_PSK.to_vec());
    }

    #[test]
    fn empty_psk_uses_stock_key() {
        let key = ChannelKey::from_psk("");
        assert_eq!(key_bytes(&key), DEFAULT_PSK.to_vec());
    }

    #[test]
    fn out_of_table_index_falls_back_to_stock_key() {
        // base64 of [0x2a]
        let key = ChannelKey::from_psk("Kg==");
        assert_eq!(key_bytes(&key), DEFAULT_PSK.to_vec());
    }

    #[test]
    fn indexed_keys_vary_last_byte() {
        let key = ChannelKey::from_psk(
            &base64::engine::general_purpose::STANDARD.encode([0x02u8]),
        );
        let mut expected = DEFAULT_PSK;
        expected[15] = expected[15].wrapping_add(1);
        assert_eq!(key_bytes(&key), expected.to_vec());
    }

    #[test]
    fn full_length_psks_are_used_directly() {
        let raw = [0x11u8; 16];
        let key = ChannelKey::from_psk(
            &base64::engine::general_purpose::STANDARD.encode(raw),
        );
        assert_eq!(key_bytes(&key), raw.to_vec());

        let raw = [0x22u8; 32];
        let key = ChannelKey::from_psk(
            &base64::engine::general_purpose::STANDARD.encode(raw),
        );
        assert_eq!(key_bytes(&key), raw.to_vec());
    }

    #[test]
    fn odd_length_psk_is_hashed() {
        let raw = [0x33u8; 5];
        let key = ChannelKey::from_psk(
            &base64::engine::general_purpose::STANDARD.encode(raw),
        );
        assert_eq!(key_bytes(&key), sha256_16(&raw).to_vec());
    }

    #[test]
    fn undecodable_psk_is_hashed_as_text() {
        let key = ChannelKey::from_psk("!!not base64!!");
        assert_eq!(key_bytes(&key), sha256_16(b"!!not base64!!").to_vec());
    }

    #[test]
    fn decrypt_round_trips() {
        let key = ChannelKey::from_psk("AQ==");
        let plain = b"temperature packet payload";
        let cipher = key.decrypt(0x1234_5678, 0xdead_beef, plain);
        assert_ne!(cipher, plain.to_vec());
        let back = key.decrypt(0x1234_5678, 0xdead_beef, &cipher);
        assert_eq!(back, plain.to_vec());
    }

    #[test]
    fn different_nonce_gives_different_keystream() {
        let key = ChannelKey::from_psk("AQ==");
        let plain = [0u8; 16];
        let a = key.decrypt(1, 100, &plain);
        let b = key.decrypt(2, 100, &plain);
        assert_ne!(a, b);
    }
}
