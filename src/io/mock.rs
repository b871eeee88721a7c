//! Synthetic track generator
//!
//! Deterministic random walkers per venue, parameterized by `(venue, count,
//! seed)`. Positions use the monotonic tick cadence with wall-clock sample
//! timestamps, so the generated stream looks exactly like a live feed to
//! everything downstream. Useful for demos and for exercising the engine
//! without hardware.

use crate::domain::session::epoch_ms;
use crate::domain::types::{ObjectType, SourceMessage, SourceState, SourceStatus, TrackSample, VenueId};
use crate::infra::config::MockConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

const SOURCE_ID: &str = "mock";
/// Walker speed bounds in m/s
const SPEED_MIN: f64 = 0.3;
const SPEED_MAX: f64 = 1.6;

struct Walker {
    track_id: i64,
    x: f64,
    z: f64,
    vx: f64,
    vz: f64,
}

/// Deterministic walkers for one venue
pub struct MockGenerator {
    venue_id: VenueId,
    width: f64,
    depth: f64,
    walkers: Vec<Walker>,
    rng: StdRng,
}

impl MockGenerator {
    pub fn new(venue_id: VenueId, count: u32, seed: u64, width: f64, depth: f64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed ^ venue_id.0 as u64);
        let walkers = (0..count)
            .map(|i| {
                let heading = rng.random_range(0.0..std::f64::consts::TAU);
                let speed = rng.random_range(SPEED_MIN..SPEED_MAX);
                Walker {
                    track_id: 1000 + i as i64,
                    x: rng.random_range(0.0..width),
                    z: rng.random_range(0.0..depth),
                    vx: heading.cos() * speed,
                    vz: heading.sin() * speed,
                }
            })
            .collect();
        Self { venue_id, width, depth, walkers, rng }
    }

    /// Advance every walker by `dt_ms` and emit one sample each
    pub fn step(&mut self, dt_ms: u64, ts: u64) -> Vec<TrackSample> {
        let dt = dt_ms as f64 / 1000.0;
        let mut samples = Vec::with_capacity(self.walkers.len());
        for walker in &mut self.walkers {
            // Occasional heading jitter keeps paths organic but reproducible
            if self.rng.random_range(0.0..1.0) < 0.05 {
                let heading = self.rng.random_range(0.0..std::f64::consts::TAU);
                let speed = self.rng.random_range(SPEED_MIN..SPEED_MAX);
                walker.vx = heading.cos() * speed;
                walker.vz = heading.sin() * speed;
            }
            walker.x += walker.vx * dt;
            walker.z += walker.vz * dt;
            if walker.x < 0.0 || walker.x > self.width {
                walker.vx = -walker.vx;
                walker.x = walker.x.clamp(0.0, self.width);
            }
            if walker.z < 0.0 || walker.z > self.depth {
                walker.vz = -walker.vz;
                walker.z = walker.z.clamp(0.0, self.depth);
            }
            samples.push(TrackSample {
                venue_id: self.venue_id,
                source_id: SOURCE_ID.to_string(),
                source_track_id: walker.track_id,
                ts,
                x: walker.x,
                z: walker.z,
                vx: Some(walker.vx),
                vz: Some(walker.vz),
                object_type: ObjectType::Person,
            });
        }
        samples
    }

    /// Run the generator on the engine's frame cadence until shutdown
    pub fn spawn(
        mut self,
        interval_ms: u64,
        tx: mpsc::Sender<SourceMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(venue_id = %self.venue_id, walkers = %self.walkers.len(), "mock_generator_started");
            let _ = tx.try_send(SourceMessage::Status(SourceStatus {
                source_id: SOURCE_ID.to_string(),
                venue_id: Some(self.venue_id),
                state: SourceState::Online,
                detail: None,
                ts: epoch_ms(),
            }));
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for sample in self.step(interval_ms, epoch_ms()) {
                            if tx.try_send(SourceMessage::Sample(sample)).is_err() {
                                // Router backlogged; mock data is disposable
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!(venue_id = %self.venue_id, "mock_generator_stopped");
                            return;
                        }
                    }
                }
            }
        })
    }
}

/// Spawn one generator per configured venue
pub fn spawn_all(
    config: &MockConfig,
    interval_ms: u64,
    bounds: impl Fn(VenueId) -> (f64, f64),
    tx: &mpsc::Sender<SourceMessage>,
    shutdown: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    config
        .venues
        .iter()
        .map(|&venue| {
            let venue_id = VenueId(venue);
            let (width, depth) = bounds(venue_id);
            MockGenerator::new(venue_id, config.tracks, config.seed, width, depth).spawn(
                interval_ms,
                tx.clone(),
                shutdown.clone(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_for_same_seed() {
        let mut a = MockGenerator::new(VenueId(1), 3, 42, 20.0, 20.0);
        let mut b = MockGenerator::new(VenueId(1), 3, 42, 20.0, 20.0);
        for ts in [100u64, 200, 300] {
            let sa = a.step(100, ts);
            let sb = b.step(100, ts);
            for (x, y) in sa.iter().zip(sb.iter()) {
                assert_eq!(x.x, y.x);
                assert_eq!(x.z, y.z);
                assert_eq!(x.source_track_id, y.source_track_id);
            }
        }
    }

    #[test]
    fn test_different_seeds_diverge() {
        let mut a = MockGenerator::new(VenueId(1), 2, 1, 20.0, 20.0);
        let mut b = MockGenerator::new(VenueId(1), 2, 2, 20.0, 20.0);
        let sa = a.step(100, 100);
        let sb = b.step(100, 100);
        assert!(sa.iter().zip(sb.iter()).any(|(x, y)| x.x != y.x || x.z != y.z));
    }

    #[test]
    fn test_walkers_stay_in_bounds() {
        let mut generator = MockGenerator::new(VenueId(1), 5, 7, 10.0, 8.0);
        for tick in 0..2000u64 {
            for sample in generator.step(100, tick * 100) {
                assert!((0.0..=10.0).contains(&sample.x), "x out of bounds: {}", sample.x);
                assert!((0.0..=8.0).contains(&sample.z), "z out of bounds: {}", sample.z);
            }
        }
    }

    #[test]
    fn test_samples_carry_velocity_and_type() {
        let mut generator = MockGenerator::new(VenueId(3), 1, 9, 20.0, 20.0);
        let samples = generator.step(100, 500);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].venue_id, VenueId(3));
        assert!(samples[0].vx.is_some());
        assert_eq!(samples[0].object_type, ObjectType::Person);
        assert_eq!(samples[0].ts, 500);
    }
}
