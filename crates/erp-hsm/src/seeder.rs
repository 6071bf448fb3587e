//! Seed material carved out of large HSM random blocks
//!
//! One device round trip yields `block_size` bytes, handed out as
//! consecutive `seed_bytes` slices. Slicing happens under a mutex, so
//! concurrent callers get disjoint seeds in exactly the order the device
//! produced them.

use erp_core::config::SeederConfig;
use erp_core::{ErpError, ErpResult};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;
use zeroize::Zeroize;

/// Anything that can produce random bytes; the HSM pool in production.
pub trait RandomSource: Send + Sync {
    fn random_bytes(&self, count: usize) -> ErpResult<Vec<u8>>;
}

struct SeedBlock {
    bytes: Vec<u8>,
    offset: usize,
}

pub struct Seeder {
    source: Arc<dyn RandomSource>,
    block_size: usize,
    seed_bytes: usize,
    block: Mutex<SeedBlock>,
}

impl Seeder {
    pub fn new(source: Arc<dyn RandomSource>, config: &SeederConfig) -> ErpResult<Self> {
        config.validate()?;
        Ok(Self {
            source,
            block_size: config.block_size,
            seed_bytes: config.seed_bytes,
            block: Mutex::new(SeedBlock {
                bytes: Vec::new(),
                offset: 0,
            }),
        })
    }

    pub fn seed_bytes(&self) -> usize {
        self.seed_bytes
    }

    pub fn get_next_seed(&self) -> ErpResult<Vec<u8>> {
        let mut block = self.block.lock().unwrap_or_else(PoisonError::into_inner);
        if block.offset + self.seed_bytes > block.bytes.len() {
            let fresh = self.source.random_bytes(self.block_size)?;
            if fresh.len() != self.block_size {
                return Err(ErpError::Hsm(format!(
                    "asked for {} random bytes, got {}",
                    self.block_size,
                    fresh.len()
                )));
            }
            block.bytes.zeroize();
            block.bytes = fresh;
            block.offset = 0;
            debug!(size = self.block_size, "seed block refilled");
        }
        let start = block.offset;
        let end = start + self.seed_bytes;
        let seed = block.bytes[start..end].to_vec();
        block.bytes[start..end].zeroize();
        block.offset = end;
        Ok(seed)
    }

    /// A fast userland RNG seeded from the next HSM seed(s).
    pub fn seeded_rng(&self) -> ErpResult<StdRng> {
        let mut seed = [0u8; 32];
        let mut filled = 0;
        while filled < seed.len() {
            let mut next = self.get_next_seed()?;
            let take = next.len().min(seed.len() - filled);
            seed[filled..filled + take].copy_from_slice(&next[..take]);
            next.zeroize();
            filled += take;
        }
        let rng = StdRng::from_seed(seed);
        seed.zeroize();
        Ok(rng)
    }
}

impl Drop for SeedBlock {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use std::sync::atomic::{AtomicU8, Ordering};

    /// Counts up from 0, one byte at a time, recording every block.
    struct CountingSource {
        next: AtomicU8,
        blocks: Mutex<Vec<Vec<u8>>>,
    }

    impl CountingSource {
        fn new() -> Self {
            Self {
                next: AtomicU8::new(0),
                blocks: Mutex::new(Vec::new()),
            }
        }
    }

    impl RandomSource for CountingSource {
        fn random_bytes(&self, count: usize) -> ErpResult<Vec<u8>> {
            let block: Vec<u8> = (0..count)
                .map(|_| self.next.fetch_add(1, Ordering::SeqCst))
                .collect();
            self.blocks.lock().unwrap().push(block.clone());
            Ok(block)
        }
    }

    fn config(block_size: usize, seed_bytes: usize) -> SeederConfig {
        SeederConfig {
            block_size,
            seed_bytes,
        }
    }

    #[test]
    fn test_sequential_slices() {
        let source = Arc::new(CountingSource::new());
        let seeder = Seeder::new(source.clone(), &config(8, 4)).unwrap();
        assert_eq!(seeder.get_next_seed().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(seeder.get_next_seed().unwrap(), vec![4, 5, 6, 7]);
        assert_eq!(seeder.get_next_seed().unwrap(), vec![8, 9, 10, 11]);
        assert_eq!(source.blocks.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_rejects_bad_config() {
        let source = Arc::new(CountingSource::new());
        assert!(Seeder::new(source, &config(10, 4)).is_err());
    }

    #[test]
    fn test_short_block_is_an_error() {
        struct Short;
        impl RandomSource for Short {
            fn random_bytes(&self, count: usize) -> ErpResult<Vec<u8>> {
                Ok(vec![0; count / 2])
            }
        }
        let seeder = Seeder::new(Arc::new(Short), &config(64, 32)).unwrap();
        assert!(matches!(seeder.get_next_seed(), Err(ErpError::Hsm(_))));
    }

    #[test]
    fn test_seeded_rng_spans_small_seeds() {
        let source = Arc::new(CountingSource::new());
        let seeder = Seeder::new(source, &config(32, 8)).unwrap();
        let mut a = seeder.seeded_rng().unwrap();
        let mut b = seeder.seeded_rng().unwrap();
        assert_ne!(a.next_u64(), b.next_u64());
    }
}
