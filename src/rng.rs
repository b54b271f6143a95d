//! Seedable deterministic randomness with exportable state.
//!
//! Every probabilistic path in the engine draws from this source, so one
//! seed plus the same external inputs reproduces the exact same run. The
//! generator is a SplitMix64 stream exposed through `rand::RngCore`; each
//! public draw consumes exactly one 64-bit word, which is what makes
//! call-count replay possible.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Exportable generator state. `state_digest` is the hex of the first eight
/// bytes of SHA-256 over the raw generator word; it identifies the stream
/// position without revealing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngState {
    pub seed: u64,
    pub call_count: u64,
    pub state_digest: String,
}

pub struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }
}

impl RngCore for SplitMix64 {
    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        let mut i = 0;
        while i < dest.len() {
            let word = self.next_u64().to_le_bytes();
            let n = (dest.len() - i).min(8);
            dest[i..i + n].copy_from_slice(&word[..n]);
            i += n;
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

pub struct DeterministicRng {
    seed: u64,
    gen: SplitMix64,
    call_count: u64,
}

impl DeterministicRng {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            gen: SplitMix64::new(seed),
            call_count: 0,
        }
    }

    /// Reset to a fresh stream. Call count restarts at zero.
    pub fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
        self.gen = SplitMix64::new(seed);
        self.call_count = 0;
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn call_count(&self) -> u64 {
        self.call_count
    }

    /// Uniform float in [0, 1). Consumes one word.
    pub fn random(&mut self) -> f64 {
        self.call_count += 1;
        (self.gen.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Uniform float in [a, b). Consumes one word.
    pub fn uniform(&mut self, a: f64, b: f64) -> f64 {
        self.call_count += 1;
        let u = (self.gen.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64);
        a + (b - a) * u
    }

    /// Pick one element of a non-empty slice. Consumes one word.
    pub fn choice<'a, T>(&mut self, seq: &'a [T]) -> &'a T {
        self.call_count += 1;
        let u = (self.gen.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64);
        let idx = ((u * seq.len() as f64) as usize).min(seq.len() - 1);
        &seq[idx]
    }

    pub fn state(&self) -> RngState {
        let mut h = Sha256::new();
        h.update(self.gen.state.to_le_bytes());
        let digest = h.finalize();
        RngState {
            seed: self.seed,
            call_count: self.call_count,
            state_digest: hex::encode(&digest[..8]),
        }
    }

    /// Restore an exported state by replaying the stream. Each public draw
    /// consumes exactly one word, so `call_count` draws land on the same
    /// stream position.
    pub fn restore(&mut self, state: &RngState) {
        self.set_seed(state.seed);
        for _ in 0..state.call_count {
            self.gen.next_u64();
        }
        self.call_count = state.call_count;
    }
}
