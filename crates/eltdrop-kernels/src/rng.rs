//! Uniform random streams consumed by the forward pass.
//!
//! A stream is an explicit, caller-owned context: the kernels never reach
//! for process-wide state. Forward passes pull one chunk of draws per mask
//! chunk, tail chunks included, so the stream position after a call depends
//! only on the shape and chunk width.

use eltdrop_common::{KernelConfig, KernelError, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Source of uniform floats in `[0, 1)`.
pub trait UniformStream {
    /// Fill `out` with the next `out.len()` draws, in order.
    fn next_chunk(&mut self, out: &mut [f32]);
}

impl<S: UniformStream + ?Sized> UniformStream for &mut S {
    fn next_chunk(&mut self, out: &mut [f32]) {
        (**self).next_chunk(out)
    }
}

/// Seeded ChaCha8 stream. Two streams built from the same seed yield the
/// same sequence on every platform.
#[derive(Debug, Clone)]
pub struct RngStream {
    seed: u64,
    rng: ChaCha8Rng,
    draws: u64,
}

impl RngStream {
    pub fn new(seed: u64) -> Self {
        Self { seed, rng: ChaCha8Rng::seed_from_u64(seed), draws: 0 }
    }

    pub fn from_config(config: &KernelConfig) -> Self {
        Self::new(config.seed)
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Number of uniforms produced so far.
    pub fn draws(&self) -> u64 {
        self.draws
    }
}

impl UniformStream for RngStream {
    fn next_chunk(&mut self, out: &mut [f32]) {
        for r in out.iter_mut() {
            *r = self.rng.random::<f32>();
        }
        self.draws += out.len() as u64;
    }
}

/// Replays a fixed sequence of draws, wrapping around at the end.
///
/// Used for golden vectors where the exact draws must be known.
#[derive(Debug, Clone)]
pub struct ReplayStream {
    values: Vec<f32>,
    position: usize,
}

impl ReplayStream {
    /// Fails when `values` is empty or holds a value outside `[0, 1)`.
    pub fn new(values: Vec<f32>) -> Result<Self> {
        if values.is_empty() {
            return Err(KernelError::precondition("replay stream needs at least one draw").into());
        }
        if let Some(bad) = values.iter().find(|v| !(0.0..1.0).contains(*v)) {
            return Err(KernelError::precondition(format!(
                "replayed draws must lie in [0, 1), got {bad}"
            ))
            .into());
        }
        Ok(Self { values, position: 0 })
    }

    /// Total draws consumed so far, counting wrap-arounds.
    pub fn position(&self) -> usize {
        self.position
    }
}

impl UniformStream for ReplayStream {
    fn next_chunk(&mut self, out: &mut [f32]) {
        for r in out.iter_mut() {
            *r = self.values[self.position % self.values.len()];
            self.position += 1;
        }
    }
}
