//! A sampling heap profiler built on allocation steps.
//!
//! Instead of a fixed period, every interval is drawn from an exponential
//! distribution whose mean is the sampling rate. That makes samples a Poisson
//! process over allocated bytes, so an object's chance of being sampled
//! depends only on its size and not on where it lands relative to the
//! previous sample.

use std::{
    fmt,
    fs::File,
    io::{self, Write},
    path::Path,
};

use hashbrown::HashMap;
use log::debug;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{
    config::{ConfigError, SamplingConfig},
    observer::{AllocationObserver, ObserverRef, StepObserver},
    serialize::serde_hex,
    Address, TAGGED_SIZE,
};

/// One sampled allocation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(with = "serde_hex")]
    pub address: Address,
    pub size: usize,
    /// Bytes allocated in the interval that ended with this object
    pub bytes_allocated: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeStats {
    pub samples: usize,
    pub bytes: usize,
}

/// A snapshot of everything a profiler has sampled so far.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub rate: usize,
    pub samples: Vec<Sample>,
    pub by_size: HashMap<usize, SizeStats>,
}

impl Profile {
    /// Estimated number of live-or-dead bytes the samples stand for. A sample
    /// of `size` bytes is taken with probability `1 - e^(-size / rate)`, so
    /// each one is scaled by the inverse of that.
    pub fn estimated_bytes(&self) -> f64 {
        self.samples
            .iter()
            .map(|sample| {
                let size = sample.size as f64;
                size / (1.0 - (-size / self.rate as f64).exp())
            })
            .sum()
    }

    pub fn write_to_file<P>(&self, path: P) -> Result<(), ProfileWriteError>
    where
        P: AsRef<Path>,
    {
        let json = serde_json::to_vec(self).map_err(ProfileWriteError::SerdeJsonError)?;
        let mut file = File::create(path).map_err(ProfileWriteError::IoError)?;
        file.write_all(&json).map_err(ProfileWriteError::IoError)?;
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub enum ProfileWriteError {
    IoError(io::Error),
    SerdeJsonError(serde_json::error::Error),
}

impl fmt::Display for ProfileWriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IoError(e) => write!(f, "could not write profile: {e}"),
            Self::SerdeJsonError(e) => write!(f, "could not serialize profile: {e}"),
        }
    }
}

impl std::error::Error for ProfileWriteError {}

pub struct SamplingHeapProfiler {
    rate: usize,
    suppress_randomness: bool,
    rng: StdRng,
    samples: Vec<Sample>,
    by_size: HashMap<usize, SizeStats>,
}

impl SamplingHeapProfiler {
    pub fn new(config: &SamplingConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        debug!(
            "SamplingHeapProfiler::new(rate: {}, seed: {:?}, suppress_randomness: {})",
            config.rate, config.seed, config.suppress_randomness
        );
        Ok(Self {
            rate: config.rate,
            suppress_randomness: config.suppress_randomness,
            rng,
            samples: Vec::new(),
            by_size: HashMap::new(),
        })
    }

    /// Build a profiler already wrapped for registration, with its first
    /// interval drawn.
    pub fn observer(config: &SamplingConfig) -> Result<ObserverRef<Self>, ConfigError> {
        let mut profiler = Self::new(config)?;
        let first = profiler.next_sample_interval();
        Ok(StepObserver::new(first, profiler).into_ref())
    }

    /// Draw the next interval, clamped to `[TAGGED_SIZE, i32::MAX]`.
    pub fn next_sample_interval(&mut self) -> usize {
        if self.suppress_randomness {
            return self.rate;
        }
        // `gen()` is in [0, 1); ln(0) is -inf, which the clamp absorbs.
        let u: f64 = self.rng.gen();
        let next = -u.ln() * self.rate as f64;
        if next < TAGGED_SIZE as f64 {
            TAGGED_SIZE
        } else if next > i32::MAX as f64 {
            i32::MAX as usize
        } else {
            next as usize
        }
    }

    pub fn rate(&self) -> usize {
        self.rate
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn profile(&self) -> Profile {
        Profile {
            rate: self.rate,
            samples: self.samples.clone(),
            by_size: self.by_size.clone(),
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.by_size.clear();
    }
}

impl AllocationObserver for SamplingHeapProfiler {
    fn step(&mut self, bytes_allocated: usize, soon_object: Address, size: usize) {
        self.samples.push(Sample {
            address: soon_object,
            size,
            bytes_allocated,
        });
        let stats = self.by_size.entry(size).or_default();
        stats.samples += 1;
        stats.bytes += size;
    }

    fn next_step_size(&mut self, _: usize) -> usize {
        self.next_sample_interval()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(rate: usize) -> SamplingHeapProfiler {
        SamplingHeapProfiler::new(&SamplingConfig {
            rate,
            seed: Some(7),
            suppress_randomness: false,
        })
        .unwrap()
    }

    #[test]
    fn suppressed_randomness_samples_at_the_rate() {
        let mut profiler = SamplingHeapProfiler::new(&SamplingConfig {
            rate: 4096,
            seed: None,
            suppress_randomness: true,
        })
        .unwrap();
        for _ in 0..10 {
            assert_eq!(profiler.next_sample_interval(), 4096);
        }
    }

    #[test]
    fn intervals_are_clamped_and_average_out_to_the_rate() {
        let mut profiler = seeded(1024);
        let n = 20_000;
        let mut total = 0usize;
        for _ in 0..n {
            let interval = profiler.next_sample_interval();
            assert!(interval >= TAGGED_SIZE);
            assert!(interval <= i32::MAX as usize);
            total += interval;
        }
        let mean = total as f64 / n as f64;
        assert!((900.0..1150.0).contains(&mean), "mean interval {mean}");
    }

    #[test]
    fn same_seed_same_intervals() {
        let mut a = seeded(1024);
        let mut b = seeded(1024);
        for _ in 0..100 {
            assert_eq!(a.next_sample_interval(), b.next_sample_interval());
        }
    }

    #[test]
    fn steps_become_samples() {
        let mut profiler = seeded(64);
        profiler.step(80, 0x1000, 16);
        profiler.step(70, 0x2000, 16);
        profiler.step(64, 0x3000, 32);
        assert_eq!(profiler.samples().len(), 3);
        let profile = profiler.profile();
        assert_eq!(profile.by_size[&16], SizeStats { samples: 2, bytes: 32 });
        assert_eq!(profile.by_size[&32], SizeStats { samples: 1, bytes: 32 });
        assert!(profile.estimated_bytes() > 64.0);
        profiler.clear();
        assert!(profiler.samples().is_empty());
    }

    #[test]
    fn profile_json_uses_hex_addresses() {
        let mut profiler = seeded(64);
        profiler.step(64, 0xbeef0, 8);
        let profile = profiler.profile();
        let json = serde_json::to_string(&profile).unwrap();
        assert!(json.contains("\"0xbeef0\""), "{json}");
        assert_eq!(Profile::from_json(&json).unwrap(), profile);
    }

    #[test]
    fn rejects_bad_hex() {
        let json = concat!(
            r#"{"rate":64,"samples":[{"address":"beef","size":8,"bytes_allocated":8}],"#,
            r#""by_size":{}}"#
        );
        assert!(Profile::from_json(json).is_err());
    }

    #[test]
    fn writes_profile_to_file() {
        let mut profiler = seeded(64);
        profiler.step(64, 0x1000, 8);
        let path = std::env::temp_dir().join(format!(
            "allocstep-{}-profile.json",
            std::process::id()
        ));
        profiler.profile().write_to_file(&path).unwrap();
        let json = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(Profile::from_json(&json).unwrap(), profiler.profile());
    }

    #[test]
    fn observer_starts_with_a_drawn_interval() {
        let observer = SamplingHeapProfiler::observer(&SamplingConfig {
            rate: 2048,
            seed: None,
            suppress_randomness: true,
        })
        .unwrap();
        assert_eq!(observer.borrow().step_size(), 2048);
        assert_eq!(observer.borrow().get_ref().rate(), 2048);
    }
}
