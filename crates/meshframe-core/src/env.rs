//! Environment abstraction for deterministic testing.
//!
//! Decouples mesh logic from system resources (time, randomness). Production
//! uses the real clock and the OS RNG; tests use a virtual clock and a seeded
//! RNG so every run is reproducible.

use std::{ops::Sub, time::Duration};

use rand::{CryptoRng, RngCore};

/// Abstract environment providing time, randomness, and async primitives.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `random_bytes()` uses cryptographically secure entropy in production
pub trait Environment: Clone + Send + Sync + 'static {
    /// Monotonic instant type.
    ///
    /// Production uses `tokio::time::Instant` so paused-clock tests observe
    /// virtual time; unit tests use a hand-advanced clock.
    type Instant: Copy + Ord + Send + Sync + std::fmt::Debug + Sub<Output = Duration>;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Wall-clock milliseconds since the Unix epoch, for ping timestamps and
    /// last-seen fields.
    fn wall_clock_millis(&self) -> u64;

    /// Sleeps for the specified duration.
    ///
    /// Only driver code awaits this; state machines take `now` as input.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random 128-bit identifier as lowercase hex.
    ///
    /// Used for message and file identifiers.
    fn random_id(&self) -> String {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        format!("{:032x}", u128::from_be_bytes(bytes))
    }
}

/// Adapts an [`Environment`] into the `rand` RNG traits consumed by
/// `meshframe-crypto`.
pub struct EnvRng<'a, E: Environment>(pub &'a E);

impl<E: Environment> RngCore for EnvRng<'_, E> {
    fn next_u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        self.0.random_bytes(&mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn next_u64(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        self.0.random_bytes(&mut bytes);
        u64::from_le_bytes(bytes)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.random_bytes(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.0.random_bytes(dest);
        Ok(())
    }
}

/// `Environment::random_bytes` is required to be cryptographically secure.
impl<E: Environment> CryptoRng for EnvRng<'_, E> {}

/// Deterministic environment for tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use std::{
        sync::{Arc, Mutex, PoisonError},
        time::{Duration, Instant},
    };

    use rand::{RngCore, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    use super::Environment;

    /// Base wall-clock time for mock environments (2023-11-14T22:13:20Z)
    const MOCK_WALL_CLOCK_START_MS: u64 = 1_700_000_000_000;

    struct MockState {
        offset: Duration,
        rng: ChaCha20Rng,
    }

    /// Virtual clock plus seeded ChaCha RNG.
    ///
    /// Clones share the same clock and RNG stream.
    #[derive(Clone)]
    pub struct MockEnv {
        base: Instant,
        state: Arc<Mutex<MockState>>,
    }

    impl MockEnv {
        /// Create an environment whose RNG is seeded with `seed`.
        #[allow(clippy::disallowed_methods)]
        pub fn with_seed(seed: u64) -> Self {
            Self {
                base: Instant::now(),
                state: Arc::new(Mutex::new(MockState {
                    offset: Duration::ZERO,
                    rng: ChaCha20Rng::seed_from_u64(seed),
                })),
            }
        }

        /// Advance the virtual clock.
        pub fn advance(&self, duration: Duration) {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.offset += duration;
        }

        fn offset(&self) -> Duration {
            self.state.lock().unwrap_or_else(PoisonError::into_inner).offset
        }
    }

    impl Environment for MockEnv {
        type Instant = Instant;

        fn now(&self) -> Instant {
            self.base + self.offset()
        }

        fn wall_clock_millis(&self) -> u64 {
            MOCK_WALL_CLOCK_START_MS + self.offset().as_millis() as u64
        }

        fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            self.advance(duration);
            std::future::ready(())
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.rng.fill_bytes(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{test_utils::MockEnv, *};

    #[test]
    fn mock_clock_advances_only_when_told() {
        let env = MockEnv::with_seed(1);
        let t0 = env.now();
        assert_eq!(env.now() - t0, Duration::ZERO);

        env.advance(Duration::from_secs(5));
        assert_eq!(env.now() - t0, Duration::from_secs(5));
    }

    #[test]
    fn same_seed_same_bytes() {
        let a = MockEnv::with_seed(9);
        let b = MockEnv::with_seed(9);
        assert_eq!(a.random_u64(), b.random_u64());
        assert_eq!(a.random_id(), b.random_id());
    }

    #[test]
    fn env_rng_draws_from_environment() {
        let a = MockEnv::with_seed(3);
        let b = MockEnv::with_seed(3);

        let mut from_rng = [0u8; 16];
        EnvRng(&a).fill_bytes(&mut from_rng);
        let mut direct = [0u8; 16];
        b.random_bytes(&mut direct);

        assert_eq!(from_rng, direct);
    }

    #[test]
    fn random_ids_are_hex() {
        let env = MockEnv::with_seed(4);
        let id = env.random_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
