//! Heap and profiler settings. Everything here can be read from JSON; missing
//! fields fall back to their defaults.

use std::{
    fmt,
    fs::File,
    io::{self, Read},
    path::Path,
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::TAGGED_SIZE;

/// Default mean sampling interval, 512 KiB
pub const DEFAULT_SAMPLING_RATE: usize = 512 * 1024;

#[non_exhaustive]
#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    SerdeJsonError(serde_json::error::Error),
    NoSpaces,
    EmptySpace { name: String },
    DuplicateSpace { name: String },
    InvalidSamplingRate { rate: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IoError(e) => write!(f, "could not read config: {e}"),
            Self::SerdeJsonError(e) => write!(f, "could not parse config: {e}"),
            Self::NoSpaces => write!(f, "a heap needs at least one space"),
            Self::EmptySpace { name } => write!(f, "space {name:?} has no capacity"),
            Self::DuplicateSpace { name } => write!(f, "space {name:?} appears twice"),
            Self::InvalidSamplingRate { rate } => {
                write!(f, "sampling rate {rate} is below {TAGGED_SIZE} bytes")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn read_json<T, P>(path: P) -> Result<T, ConfigError>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let mut file = File::open(path).map_err(ConfigError::IoError)?;
    let mut buf = String::new();
    file.read_to_string(&mut buf).map_err(ConfigError::IoError)?;
    serde_json::from_str(&buf).map_err(ConfigError::SerdeJsonError)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceConfig {
    pub name: String,
    /// Bytes; rounded up to whole pages when the space is mapped
    pub capacity: usize,
}

impl SpaceConfig {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    pub spaces: Vec<SpaceConfig>,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            spaces: vec![
                SpaceConfig::new("new", 8 * 1024 * 1024),
                SpaceConfig::new("old", 64 * 1024 * 1024),
                SpaceConfig::new("large_object", 64 * 1024 * 1024),
            ],
        }
    }
}

impl HeapConfig {
    pub fn from_file<P>(path: P) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
    {
        let config: Self = read_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.spaces.is_empty() {
            return Err(ConfigError::NoSpaces);
        }
        for (i, space) in self.spaces.iter().enumerate() {
            if space.capacity == 0 {
                return Err(ConfigError::EmptySpace {
                    name: space.name.clone(),
                });
            }
            if self.spaces[..i].iter().any(|other| other.name == space.name) {
                return Err(ConfigError::DuplicateSpace {
                    name: space.name.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Mean number of bytes between samples
    pub rate: usize,
    /// Seed for the interval generator; `None` seeds from the OS
    pub seed: Option<u64>,
    /// Sample exactly every `rate` bytes instead of drawing intervals
    pub suppress_randomness: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            rate: DEFAULT_SAMPLING_RATE,
            seed: None,
            suppress_randomness: false,
        }
    }
}

impl SamplingConfig {
    pub fn from_file<P>(path: P) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
    {
        let config: Self = read_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate < TAGGED_SIZE {
            return Err(ConfigError::InvalidSamplingRate { rate: self.rate });
        }
        Ok(())
    }
}
