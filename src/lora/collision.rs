//! Collision avoidance by randomized transmit timing.
//!
//! Carrier sense is not usable on this radio: an RSSI reading cannot tell a
//! busy channel from a strong legitimate neighbour. Instead every
//! transmission, relays included, waits a uniformly random delay so nodes
//! that heard the same packet do not answer or relay it in lockstep.
//!
//! When the radio refuses a frame the sender backs off: each retry sleeps an
//! exponential floor (`50 ms * 2^attempt`) plus jitter from a window that
//! doubles with the attempt number.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use dismissal_mesh::clock::ManualClock;
//! use dismissal_mesh::lora::{CollisionAvoidance, CollisionConfig};
//!
//! let clock = Arc::new(ManualClock::new());
//! let ca = CollisionAvoidance::new(CollisionConfig::default(), clock.clone()).unwrap();
//!
//! let mut sent = 0;
//! let result = ca.send_with_backoff(b"frame", 3, |_| {
//!     sent += 1;
//!     sent == 2 // radio refuses the first attempt
//! });
//! assert_eq!(result, Ok(2));
//! ```

use crate::clock::Clock;
use rand_core::{OsRng, RngCore};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for transmit timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollisionConfig {
    /// Lower bound of the pre-transmit jitter window.
    pub min_delay_ms: u32,
    /// Upper bound of the pre-transmit jitter window.
    pub max_delay_ms: u32,
    /// Backoff floor for retry `n` is `backoff_base_ms * 2^n`.
    pub backoff_base_ms: u32,
    /// Cap on any single delay.
    pub max_backoff_ms: u32,
    /// Radio-level retries after the first attempt.
    pub max_retries: u8,
}

impl Default for CollisionConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 10,
            max_delay_ms: 150,
            backoff_base_ms: 50,
            max_backoff_ms: 4_000,
            max_retries: 3,
        }
    }
}

impl CollisionConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), CollisionError> {
        if self.max_delay_ms < self.min_delay_ms {
            return Err(CollisionError::InvalidConfig(
                "max_delay_ms must be >= min_delay_ms",
            ));
        }
        if self.backoff_base_ms == 0 {
            return Err(CollisionError::InvalidConfig("backoff_base_ms must be > 0"));
        }
        if self.max_backoff_ms < self.max_delay_ms {
            return Err(CollisionError::InvalidConfig(
                "max_backoff_ms must be >= max_delay_ms",
            ));
        }
        if self.max_retries > 10 {
            return Err(CollisionError::InvalidConfig("max_retries must be <= 10"));
        }
        Ok(())
    }
}

/// Errors from collision avoidance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollisionError {
    /// Invalid configuration parameter.
    InvalidConfig(&'static str),
    /// The radio refused every attempt.
    GaveUp {
        /// Transmissions attempted.
        attempts: u8,
    },
}

impl fmt::Display for CollisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid collision config: {}", msg),
            Self::GaveUp { attempts } => {
                write!(f, "radio refused frame after {} attempts", attempts)
            }
        }
    }
}

impl std::error::Error for CollisionError {}

/// Randomized transmit timing.
///
/// Methods take `&self` so one instance can be shared by the receive loop and
/// application threads; the jitter generator is a lock-free LCG.
pub struct CollisionAvoidance {
    config: CollisionConfig,
    clock: Arc<dyn Clock>,
    rng_state: AtomicU32,
}

impl CollisionAvoidance {
    /// Create with a jitter seed from the OS RNG.
    pub fn new(config: CollisionConfig, clock: Arc<dyn Clock>) -> Result<Self, CollisionError> {
        Self::with_seed(config, clock, OsRng.next_u32())
    }

    /// Create with a fixed jitter seed.
    pub fn with_seed(
        config: CollisionConfig,
        clock: Arc<dyn Clock>,
        seed: u32,
    ) -> Result<Self, CollisionError> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            rng_state: AtomicU32::new(if seed == 0 { 1 } else { seed }),
        })
    }

    /// The configuration.
    pub fn config(&self) -> &CollisionConfig {
        &self.config
    }

    /// Uniform duration in `[min_ms, max_ms]` (arguments may come in either
    /// order).
    pub fn jitter(&self, min_ms: u32, max_ms: u32) -> Duration {
        let (lo, hi) = if min_ms <= max_ms {
            (min_ms, max_ms)
        } else {
            (max_ms, min_ms)
        };
        let span = (hi - lo) as u64 + 1;
        let offset = (self.next_random() as u64) % span;
        Duration::from_millis(lo as u64 + offset)
    }

    /// Sleep a uniform random duration in `[min_ms, max_ms]`.
    ///
    /// Returns how long it slept.
    pub fn randomized_delay(&self, min_ms: u32, max_ms: u32) -> Duration {
        let delay = self.jitter(min_ms, max_ms);
        self.clock.sleep(delay);
        delay
    }

    /// Sleep the configured pre-transmit jitter.
    pub fn pre_send_delay(&self) -> Duration {
        self.randomized_delay(self.config.min_delay_ms, self.config.max_delay_ms)
    }

    /// Delay before attempt `attempt` (0 = first transmission).
    pub fn backoff_delay(&self, attempt: u8) -> Duration {
        let cap = self.config.max_backoff_ms as u64;
        if attempt == 0 {
            return self.jitter(self.config.min_delay_ms, self.config.max_delay_ms);
        }
        let shift = attempt.min(16) as u32;
        let floor = (self.config.backoff_base_ms as u64) << shift;
        let window_hi = ((self.config.max_delay_ms as u64) << shift).min(cap) as u32;
        let jitter = self.jitter(self.config.min_delay_ms, window_hi).as_millis() as u64;
        Duration::from_millis((floor + jitter).min(cap))
    }

    /// Transmit `data` through `transmit`, retrying with exponential backoff
    /// while it reports failure.
    ///
    /// Every attempt, the first included, is preceded by its delay. Returns
    /// the number of attempts used.
    pub fn send_with_backoff<F>(
        &self,
        data: &[u8],
        max_retries: u8,
        mut transmit: F,
    ) -> Result<u8, CollisionError>
    where
        F: FnMut(&[u8]) -> bool,
    {
        let attempts = max_retries.saturating_add(1);
        for attempt in 0..attempts {
            self.clock.sleep(self.backoff_delay(attempt));
            if transmit(data) {
                return Ok(attempt + 1);
            }
            log::debug!("Radio refused frame (attempt {}/{})", attempt + 1, attempts);
        }
        Err(CollisionError::GaveUp { attempts })
    }

    /// Numerical Recipes LCG; good enough for jitter.
    fn next_random(&self) -> u32 {
        let mut current = self.rng_state.load(Ordering::Relaxed);
        loop {
            let next = current.wrapping_mul(1664525).wrapping_add(1013904223);
            match self.rng_state.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next >> 8,
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn avoidance(seed: u32) -> (CollisionAvoidance, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let ca = CollisionAvoidance::with_seed(CollisionConfig::default(), clock.clone(), seed)
            .unwrap();
        (ca, clock)
    }

    #[test]
    fn test_default_config_valid() {
        assert!(CollisionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_inverted_window_rejected() {
        let config = CollisionConfig {
            min_delay_ms: 200,
            max_delay_ms: 100,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CollisionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_jitter_within_bounds() {
        let (ca, _) = avoidance(12345);
        for _ in 0..500 {
            let d = ca.jitter(20, 80).as_millis();
            assert!((20..=80).contains(&d), "jitter {} out of range", d);
        }
        assert_eq!(ca.jitter(30, 30), Duration::from_millis(30));
    }

    #[test]
    fn test_jitter_spreads() {
        let (ca, _) = avoidance(99);
        let samples: Vec<u128> = (0..50).map(|_| ca.jitter(0, 1000).as_millis()).collect();
        let min = samples.iter().min().unwrap();
        let max = samples.iter().max().unwrap();
        assert!(max - min > 200, "jitter not spread: {}..{}", min, max);
    }

    #[test]
    fn test_randomized_delay_sleeps_on_clock() {
        let (ca, clock) = avoidance(7);
        let slept = ca.randomized_delay(100, 200);
        assert_eq!(clock.total_slept(), slept);
        assert!(slept >= Duration::from_millis(100));
    }

    #[test]
    fn test_pre_send_delay_uses_configured_window() {
        let (ca, clock) = avoidance(11);
        for _ in 0..20 {
            let slept = ca.pre_send_delay();
            assert!(slept >= Duration::from_millis(10) && slept <= Duration::from_millis(150));
        }
        assert!(clock.total_slept() >= Duration::from_millis(200));
    }

    #[test]
    fn test_backoff_floor_grows() {
        let (ca, _) = avoidance(42);
        for attempt in 1..=4u8 {
            let floor = Duration::from_millis(50u64 << attempt);
            let d = ca.backoff_delay(attempt);
            assert!(d >= floor, "attempt {}: {:?} < {:?}", attempt, d, floor);
        }
    }

    #[test]
    fn test_backoff_capped() {
        let (ca, _) = avoidance(42);
        assert!(ca.backoff_delay(10) <= Duration::from_millis(4_000));
    }

    #[test]
    fn test_send_with_backoff_first_try() {
        let (ca, _) = avoidance(1);
        assert_eq!(ca.send_with_backoff(b"x", 3, |_| true), Ok(1));
    }

    #[test]
    fn test_send_with_backoff_gives_up() {
        let (ca, clock) = avoidance(1);
        let mut calls = 0;
        let result = ca.send_with_backoff(b"x", 2, |_| {
            calls += 1;
            false
        });
        assert_eq!(result, Err(CollisionError::GaveUp { attempts: 3 }));
        assert_eq!(calls, 3);
        // floors for attempts 1 and 2: 100 ms + 200 ms
        assert!(clock.total_slept() >= Duration::from_millis(300));
    }

    #[test]
    fn test_same_seed_same_delays() {
        let (a, _) = avoidance(555);
        let (b, _) = avoidance(555);
        for attempt in 0..5 {
            assert_eq!(a.backoff_delay(attempt), b.backoff_delay(attempt));
        }
    }
}
