//! Production environment: tokio clock and OS randomness.
//!
//! Time comes from `tokio::time::Instant`, so a runtime started with a paused
//! clock drives the coordinator's timeouts in virtual time. Randomness comes
//! from getrandom and is not reproducible.

use std::time::Duration;

use meshframe_core::Environment;

/// Production environment using the tokio clock and the OS RNG.
///
/// # Panics
///
/// Panics if the OS RNG fails. Without working randomness no ratchet key,
/// nonce or identifier can be generated, so there is nothing to fall back to.
#[derive(Debug, Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    #[allow(clippy::disallowed_methods)]
    #[allow(clippy::expect_used)]
    fn wall_clock_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("invariant: system clock is after Unix epoch (1970-01-01)")
            .as_millis() as u64
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn clock_follows_tokio_time() {
        let env = SystemEnv::new();

        let start = env.now();
        env.sleep(Duration::from_secs(30)).await;

        assert_eq!(env.now() - start, Duration::from_secs(30));
    }

    #[test]
    fn random_bytes_differ() {
        let env = SystemEnv::new();

        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        env.random_bytes(&mut a);
        env.random_bytes(&mut b);

        assert_ne!(a, b);
    }

    #[test]
    fn wall_clock_is_after_2020() {
        assert!(SystemEnv::new().wall_clock_millis() > 1_577_836_800_000);
    }
}
