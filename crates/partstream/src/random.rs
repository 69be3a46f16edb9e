use rand::{Rng, rng};

/// A source of random message ids.
///
/// Lets tests pin the correlation ids the coordinator assigns.
pub trait RandSource: Send + Sync {
    fn rand(&self) -> u64;
}

/// A [`RandSource`] backed by the thread-local RNG.
///
/// Zero-sized; each call reaches the calling thread's generator, so it can be
/// shared across transport threads without contention.
#[derive(Default, Clone, Copy, Debug)]
pub struct ThreadRandom;

impl RandSource for ThreadRandom {
    fn rand(&self) -> u64 {
        rng().random()
    }
}
