//! Fault injection at the transport boundary
//!
//! [`FaultInjectionSocketFactory`] wraps another factory and hands out
//! sockets that silently drop each send with a fixed probability. Protocol
//! code runs unchanged on top; only its retry timers notice the loss.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::error::{Error, Result};

use super::{Frame, Listener, Socket, SocketFactory};

/// Fault injection settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultInjectionConfig {
    /// Probability in `[0, 1]` that a single send is dropped
    pub drop_probability: f64,

    /// Seed for reproducible drop patterns (None = from OS entropy)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl FaultInjectionConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.drop_probability) {
            return Err(Error::config_field_invalid(
                "fault_injection.drop_probability",
                format!("{} is not a probability", self.drop_probability),
            ));
        }
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.drop_probability > 0.0
    }
}

/// Send counters shared by every socket of one factory
#[derive(Debug, Default)]
pub struct FaultInjectionStats {
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl FaultInjectionStats {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct FaultInjectionSocketFactory {
    inner: Arc<dyn SocketFactory>,
    drop_probability: f64,
    seeds: Mutex<StdRng>,
    stats: Arc<FaultInjectionStats>,
}

impl FaultInjectionSocketFactory {
    pub fn new(inner: Arc<dyn SocketFactory>, config: &FaultInjectionConfig) -> Self {
        if !(0.0..=1.0).contains(&config.drop_probability) {
            warn!(
                drop_probability = config.drop_probability,
                "Drop probability out of range, clamping"
            );
        }
        let seeds = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            inner,
            drop_probability: config.drop_probability.clamp(0.0, 1.0),
            seeds: Mutex::new(seeds),
            stats: Arc::new(FaultInjectionStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<FaultInjectionStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl SocketFactory for FaultInjectionSocketFactory {
    async fn bind(&self, address: &str) -> Result<Box<dyn Listener>> {
        self.inner.bind(address).await
    }

    fn connect(&self, address: &str) -> Box<dyn Socket> {
        let seed = self.seeds.lock().next_u64();
        Box::new(FaultInjectionSocket {
            inner: self.inner.connect(address),
            drop_probability: self.drop_probability,
            rng: StdRng::seed_from_u64(seed),
            stats: Arc::clone(&self.stats),
        })
    }
}

/// Socket decorator that drops sends at random
pub struct FaultInjectionSocket {
    inner: Box<dyn Socket>,
    drop_probability: f64,
    rng: StdRng,
    stats: Arc<FaultInjectionStats>,
}

impl Socket for FaultInjectionSocket {
    fn send(&mut self, frames: Vec<Frame>) -> Result<()> {
        if self.rng.random_bool(self.drop_probability) {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            trace!("Fault injection dropped a send");
            return Ok(());
        }
        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        self.inner.send(frames)
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    /// Records every frame set that reaches it
    #[derive(Default)]
    struct RecordingFactory {
        delivered: Arc<AtomicU64>,
    }

    struct RecordingSocket {
        delivered: Arc<AtomicU64>,
    }

    impl Socket for RecordingSocket {
        fn send(&mut self, _frames: Vec<Frame>) -> Result<()> {
            self.delivered.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn close(&mut self) {}
    }

    struct NoListener;

    #[async_trait]
    impl Listener for NoListener {
        fn local_addr(&self) -> SocketAddr {
            SocketAddr::from(([127, 0, 0, 1], 0))
        }

        async fn recv(&mut self) -> Option<Vec<Frame>> {
            None
        }

        fn try_recv(&mut self) -> Option<Vec<Frame>> {
            None
        }

        fn close(&mut self) {}
    }

    #[async_trait]
    impl SocketFactory for RecordingFactory {
        async fn bind(&self, _address: &str) -> Result<Box<dyn Listener>> {
            Ok(Box::new(NoListener))
        }

        fn connect(&self, _address: &str) -> Box<dyn Socket> {
            Box::new(RecordingSocket {
                delivered: Arc::clone(&self.delivered),
            })
        }
    }

    fn wrap(probability: f64, seed: u64) -> (FaultInjectionSocketFactory, Arc<AtomicU64>) {
        let inner = RecordingFactory::default();
        let delivered = Arc::clone(&inner.delivered);
        let factory = FaultInjectionSocketFactory::new(
            Arc::new(inner),
            &FaultInjectionConfig {
                drop_probability: probability,
                seed: Some(seed),
            },
        );
        (factory, delivered)
    }

    #[test]
    fn test_zero_probability_delivers_everything() {
        let (factory, delivered) = wrap(0.0, 1);
        let mut socket = factory.connect("x");
        for _ in 0..100 {
            socket.send(vec![vec![1]]).unwrap();
        }
        assert_eq!(delivered.load(Ordering::Relaxed), 100);
        assert_eq!(factory.stats().dropped(), 0);
    }

    #[test]
    fn test_certain_drop_delivers_nothing() {
        let (factory, delivered) = wrap(1.0, 1);
        let mut socket = factory.connect("x");
        for _ in 0..50 {
            socket.send(vec![vec![1]]).unwrap();
        }
        assert_eq!(delivered.load(Ordering::Relaxed), 0);
        assert_eq!(factory.stats().dropped(), 50);
    }

    #[test]
    fn test_partial_drop_is_reproducible_with_a_seed() {
        let run = |seed| {
            let (factory, delivered) = wrap(0.3, seed);
            let mut socket = factory.connect("x");
            for _ in 0..1000 {
                socket.send(vec![vec![1]]).unwrap();
            }
            delivered.load(Ordering::Relaxed)
        };

        let first = run(42);
        assert_eq!(first, run(42));
        assert!(first > 500 && first < 900, "delivered {first}");
    }

    #[test]
    fn test_out_of_range_probability_is_invalid() {
        let config = FaultInjectionConfig {
            drop_probability: 1.5,
            seed: None,
        };
        assert!(config.validate().is_err());
        assert!(!FaultInjectionConfig::default().is_enabled());
    }
}
