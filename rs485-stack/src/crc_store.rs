//! Persisted CRC-error counter, surviving daemon restarts. Grounded on
//! `red_rs485_extension.c`'s `crc_error_count_file` /
//! `update_crc_error_count_to_fs`, reusing the generic key=value format
//! from `support::config` instead of a bespoke one-line file.

use std::io;
use std::path::{Path, PathBuf};

use support::config::ConfFile;

const KEY: &str = "crc_error_count";

pub struct CrcErrorCounter {
    path: PathBuf,
    value: u64,
}

impl CrcErrorCounter {
    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<CrcErrorCounter> {
        let path = path.as_ref().to_path_buf();
        let conf = ConfFile::read(&path)?;

        let value = conf.get(KEY).and_then(|v| v.parse().ok()).unwrap_or(0);

        Ok(CrcErrorCounter { path, value })
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    /// Increments the in-memory counter; the caller decides how often to
    /// call `flush` (the original throttles this to once every four
    /// seconds via `CRC_ERROR_COUNT_UPDATE_INTERVAL`).
    pub fn increment(&mut self) {
        self.value += 1;
    }

    pub fn flush(&self) -> io::Result<()> {
        let mut conf = ConfFile::read(&self.path)?;
        conf.set(KEY, self.value.to_string());
        conf.write(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_fresh_counter_starts_at_zero() {
        let file = NamedTempFile::new().unwrap();
        std::fs::remove_file(file.path()).ok();

        let counter = CrcErrorCounter::load(file.path()).unwrap();
        assert_eq!(counter.value(), 0);
    }

    #[test]
    fn test_increment_then_flush_then_reload_persists() {
        let file = NamedTempFile::new().unwrap();

        let mut counter = CrcErrorCounter::load(file.path()).unwrap();
        counter.increment();
        counter.increment();
        counter.flush().unwrap();

        let reloaded = CrcErrorCounter::load(file.path()).unwrap();
        assert_eq!(reloaded.value(), 2);
    }
}
