//! AES-NI key expansion and block transform.
//!
//! Every function requires the `aes` and `sse2` CPU features; callers must
//! have checked them with `is_x86_feature_detected!` first.

use core::arch::x86_64::{
    __m128i, _mm_aesdec_si128, _mm_aesdeclast_si128, _mm_aesenc_si128, _mm_aesenclast_si128,
    _mm_aesimc_si128, _mm_aeskeygenassist_si128, _mm_cvtsi128_si32, _mm_loadu_si128,
    _mm_set_epi32, _mm_shuffle_epi32, _mm_storeu_si128, _mm_xor_si128,
};

use super::RCON;

#[target_feature(enable = "aes,sse2")]
unsafe fn load(bytes: &[u8]) -> __m128i {
    let bytes = &bytes[..16];
    unsafe { _mm_loadu_si128(bytes.as_ptr().cast::<__m128i>()) }
}

#[target_feature(enable = "aes,sse2")]
unsafe fn store(bytes: &mut [u8], value: __m128i) {
    let bytes = &mut bytes[..16];
    unsafe { _mm_storeu_si128(bytes.as_mut_ptr().cast::<__m128i>(), value) }
}

/// `AESKEYGENASSIST` on a word placed in lane 1: lane 0 then holds
/// `SubWord(word)` and lane 1 `RotWord(SubWord(word))`.
#[target_feature(enable = "aes,sse2")]
unsafe fn keygen_assist(word: u32) -> __m128i {
    let word = i32::from_ne_bytes(word.to_ne_bytes());
    _mm_aeskeygenassist_si128::<0>(_mm_set_epi32(0, 0, word, 0))
}

#[target_feature(enable = "aes,sse2")]
unsafe fn sub_word(word: u32) -> u32 {
    let lane = unsafe { _mm_cvtsi128_si32(keygen_assist(word)) };
    u32::from_ne_bytes(lane.to_ne_bytes())
}

#[target_feature(enable = "aes,sse2")]
unsafe fn rot_sub_word(word: u32) -> u32 {
    let lane = unsafe { _mm_cvtsi128_si32(_mm_shuffle_epi32::<0x55>(keygen_assist(word))) };
    u32::from_ne_bytes(lane.to_ne_bytes())
}

fn read_word(schedule: &[u8], index: usize) -> u32 {
    let mut word = [0_u8; 4];
    word.copy_from_slice(&schedule[4 * index..4 * (index + 1)]);
    u32::from_le_bytes(word)
}

/// Expand `key` into `enc`, whose length sets the number of rounds.
///
/// Words are handled as little endian integers, the byte order the AES
/// instructions use, so `RotWord` and the round constant land on the same
/// bytes as in the portable expansion.
#[target_feature(enable = "aes,sse2")]
pub(super) unsafe fn expand_key(key: &[u8], enc: &mut [u8]) {
    let nk = key.len() / 4;
    enc[..key.len()].copy_from_slice(key);
    for i in nk..enc.len() / 4 {
        let mut temp = read_word(enc, i - 1);
        if i % nk == 0 {
            temp = unsafe { rot_sub_word(temp) } ^ u32::from(RCON[i / nk - 1]);
        } else if nk > 6 && i % nk == 4 {
            temp = unsafe { sub_word(temp) };
        }
        let word = read_word(enc, i - nk) ^ temp;
        enc[4 * i..4 * (i + 1)].copy_from_slice(&word.to_le_bytes());
    }
}

#[target_feature(enable = "aes,sse2")]
pub(super) unsafe fn invert_key_schedule(enc: &[u8], dec: &mut [u8], rounds: usize) {
    unsafe {
        store(&mut dec[..16], load(&enc[16 * rounds..]));
        for r in 1..rounds {
            let round_key = _mm_aesimc_si128(load(&enc[16 * (rounds - r)..]));
            store(&mut dec[16 * r..], round_key);
        }
        store(&mut dec[16 * rounds..], load(&enc[..16]));
    }
}

#[target_feature(enable = "aes,sse2")]
pub(super) unsafe fn encrypt_block(enc: &[u8], rounds: usize, block: &mut [u8; 16]) {
    unsafe {
        let mut state = _mm_xor_si128(load(&block[..]), load(enc));
        for r in 1..rounds {
            state = _mm_aesenc_si128(state, load(&enc[16 * r..]));
        }
        state = _mm_aesenclast_si128(state, load(&enc[16 * rounds..]));
        store(block, state);
    }
}

#[target_feature(enable = "aes,sse2")]
pub(super) unsafe fn decrypt_block(dec: &[u8], rounds: usize, block: &mut [u8; 16]) {
    unsafe {
        let mut state = _mm_xor_si128(load(&block[..]), load(dec));
        for r in 1..rounds {
            state = _mm_aesdec_si128(state, load(&dec[16 * r..]));
        }
        state = _mm_aesdeclast_si128(state, load(&dec[16 * rounds..]));
        store(block, state);
    }
}
