use anyhow::{bail, Error};

use crate::chunker::{CHUNK_SIZE_AVG, CHUNK_SIZE_MAX, CHUNK_SIZE_MIN};
use crate::git::GitRepo;

/// Per-process filter configuration, read from git config once at
/// startup. Requests within a session all see the same values.
#[derive(Clone, Copy, Debug)]
pub struct FilterConfig {
    /// Spill request payloads to a temp file instead of RAM.
    pub ondisk: bool,
    pub chunk_size_min: usize,
    pub chunk_size_avg: usize,
    pub chunk_size_max: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            ondisk: false,
            chunk_size_min: CHUNK_SIZE_MIN,
            chunk_size_avg: CHUNK_SIZE_AVG,
            chunk_size_max: CHUNK_SIZE_MAX,
        }
    }
}

pub fn verify_chunk_params(min: usize, avg: usize, max: usize) -> Result<(), Error> {
    if !(64..=1024 * 1024).contains(&min) {
        bail!("got unsupported minimum chunk size '{min}'");
    }
    if !(256..=4 * 1024 * 1024).contains(&avg) {
        bail!("got unsupported average chunk size '{avg}'");
    }
    if !(1024..=16 * 1024 * 1024).contains(&max) {
        bail!("got unsupported maximum chunk size '{max}'");
    }
    if min > avg || avg > max {
        bail!("chunk sizes must satisfy min <= avg <= max - got {min}/{avg}/{max}");
    }
    Ok(())
}

impl FilterConfig {
    pub fn load(repo: &GitRepo) -> Result<Self, Error> {
        let defaults = Self::default();

        let ondisk = repo
            .config_get_bool("fastcdc.ondisk")?
            .unwrap_or(defaults.ondisk);
        let chunk_size_min = match repo.config_get_size("fastcdc.min")? {
            Some(value) => value as usize,
            None => defaults.chunk_size_min,
        };
        let chunk_size_avg = match repo.config_get_size("fastcdc.avg")? {
            Some(value) => value as usize,
            None => defaults.chunk_size_avg,
        };
        let chunk_size_max = match repo.config_get_size("fastcdc.max")? {
            Some(value) => value as usize,
            None => defaults.chunk_size_max,
        };

        verify_chunk_params(chunk_size_min, chunk_size_avg, chunk_size_max)?;

        Ok(Self {
            ondisk,
            chunk_size_min,
            chunk_size_avg,
            chunk_size_max,
        })
    }
}
