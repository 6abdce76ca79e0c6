// Fallback used when src/config.rs has not been generated yet (clean checkout, CI).
// `crabshell pack` overwrites src/config.rs with fresh key material.

const KEY_PART_1: [u8; 32] = [0u8; 32];
const KEY_PART_2: [u8; 32] = [0u8; 32];

pub const STRING_XOR_KEY: [u8; 32] = [0u8; 32];

#[inline(always)]
pub fn get_aes_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    for i in 0..32 {
        key[i] = KEY_PART_1[i] ^ KEY_PART_2[i];
    }
    key
}

pub const PAYLOAD_HASH: [u8; 32] = [0u8; 32];
pub const EXPECTED_SIGNATURE_HASH: [u8; 32] = [0u8; 32];
