//! # Reconnect Backoff
//!
//! Per-peer exponential backoff for re-establishing a dropped pubsub stream.
//!
//! | Attempt | Delay |
//! |---------|-------|
//! | first (or after TTL of inactivity) | 0 |
//! | previous below minimum | `MIN_BACKOFF_DELAY` |
//! | otherwise | `2 × previous + jitter`, capped at `MAX_BACKOFF_DELAY` |
//!
//! After `MAX_BACKOFF_ATTEMPTS` consecutive attempts within the TTL the peer is
//! given up on until its record expires.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::identity::PeerId;

pub const MIN_BACKOFF_DELAY: Duration = Duration::from_millis(100);
pub const MAX_BACKOFF_DELAY: Duration = Duration::from_secs(10);
pub const BACKOFF_TTL: Duration = Duration::from_secs(10 * 60);
pub const BACKOFF_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
pub const BACKOFF_MULTIPLIER: u32 = 2;
pub const MAX_BACKOFF_JITTER_MS: u64 = 100;
pub const MAX_BACKOFF_ATTEMPTS: u32 = 4;

#[derive(Clone, Debug)]
pub struct BackoffConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub ttl: Duration,
    pub cleanup_interval: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay: MIN_BACKOFF_DELAY,
            max_delay: MAX_BACKOFF_DELAY,
            ttl: BACKOFF_TTL,
            cleanup_interval: BACKOFF_CLEANUP_INTERVAL,
            max_attempts: MAX_BACKOFF_ATTEMPTS,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_delay > self.max_delay {
            anyhow::bail!("reconnect backoff min delay exceeds max delay");
        }
        if self.max_attempts == 0 {
            anyhow::bail!("reconnect backoff needs at least one attempt");
        }
        if self.cleanup_interval.is_zero() {
            anyhow::bail!("reconnect backoff cleanup interval must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffExhausted {
    pub attempts: u32,
}

impl std::fmt::Display for BackoffExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer reached maximum reconnect attempts ({})", self.attempts)
    }
}

impl std::error::Error for BackoffExhausted {}

struct BackoffHistory {
    duration: Duration,
    last_tried: Instant,
    attempts: u32,
}

pub struct Backoff {
    config: BackoffConfig,
    info: HashMap<PeerId, BackoffHistory>,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            info: HashMap::new(),
        }
    }

    /// Record an attempt for `peer` and return how long to wait before it.
    pub fn update_and_get(&mut self, peer: &PeerId) -> Result<Duration, BackoffExhausted> {
        let now = Instant::now();
        let config = &self.config;
        let fresh = self
            .info
            .get(peer)
            .is_none_or(|h| now.duration_since(h.last_tried) >= config.ttl);
        if fresh {
            self.info.insert(
                *peer,
                BackoffHistory {
                    duration: Duration::ZERO,
                    last_tried: now,
                    attempts: 0,
                },
            );
            return Ok(Duration::ZERO);
        }
        let Some(history) = self.info.get_mut(peer) else {
            return Ok(Duration::ZERO);
        };

        if history.attempts >= config.max_attempts {
            return Err(BackoffExhausted {
                attempts: history.attempts,
            });
        }

        history.duration = if history.duration < config.min_delay {
            config.min_delay
        } else {
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_BACKOFF_JITTER_MS));
            (history.duration * BACKOFF_MULTIPLIER + jitter).min(config.max_delay)
        };
        history.attempts += 1;
        history.last_tried = now;
        Ok(history.duration)
    }

    /// Forget a peer after a successful reconnect.
    pub fn reset(&mut self, peer: &PeerId) {
        self.info.remove(peer);
    }

    /// Drop records idle for longer than the TTL.
    pub fn cleanup(&mut self) {
        let now = Instant::now();
        let ttl = self.config.ttl;
        self.info
            .retain(|_, h| now.duration_since(h.last_tried) < ttl);
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.config.cleanup_interval
    }

    pub fn len(&self) -> usize {
        self.info.len()
    }

    pub fn is_empty(&self) -> bool {
        self.info.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_is_immediate_then_grows() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        let peer = PeerId::from_seed(1);

        assert_eq!(backoff.update_and_get(&peer), Ok(Duration::ZERO));
        assert_eq!(backoff.update_and_get(&peer), Ok(MIN_BACKOFF_DELAY));

        let third = backoff.update_and_get(&peer).expect("third attempt");
        assert!(third >= MIN_BACKOFF_DELAY * 2);
        assert!(third <= MIN_BACKOFF_DELAY * 2 + Duration::from_millis(MAX_BACKOFF_JITTER_MS));
    }

    #[test]
    fn delay_is_capped() {
        let config = BackoffConfig {
            max_delay: Duration::from_millis(150),
            max_attempts: 10,
            ..BackoffConfig::default()
        };
        let mut backoff = Backoff::new(config);
        let peer = PeerId::from_seed(1);
        for _ in 0..8 {
            let delay = backoff.update_and_get(&peer).expect("attempt");
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn attempts_are_bounded() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        let peer = PeerId::from_seed(1);
        backoff.update_and_get(&peer).expect("initial");
        for _ in 0..MAX_BACKOFF_ATTEMPTS {
            backoff.update_and_get(&peer).expect("within budget");
        }
        assert_eq!(
            backoff.update_and_get(&peer),
            Err(BackoffExhausted {
                attempts: MAX_BACKOFF_ATTEMPTS
            })
        );
    }

    #[test]
    fn records_expire_after_ttl() {
        let config = BackoffConfig {
            ttl: Duration::from_millis(10),
            ..BackoffConfig::default()
        };
        let mut backoff = Backoff::new(config);
        let peer = PeerId::from_seed(1);
        backoff.update_and_get(&peer).expect("initial");
        backoff.update_and_get(&peer).expect("second");
        std::thread::sleep(Duration::from_millis(20));

        backoff.cleanup();
        assert!(backoff.is_empty());
        assert_eq!(backoff.update_and_get(&peer), Ok(Duration::ZERO));
    }
}
