use actor_migration_remote::RetrySettings;

use crate::error::MigrationError;

pub const DEFAULT_DOWNTIME_THRESHOLD: i64 = 1024;
pub const DEFAULT_ITEMS_PER_ENUMERATION: usize = 1024;
pub const DEFAULT_ITEMS_PER_CHUNK: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct MigrationSettings {
    /// Workers running the copy phase. Catchup and downtime always use one.
    pub copy_phase_parallelism: u32,
    /// Catchup repeats while the source is at least this many sequence numbers ahead
    pub downtime_threshold: i64,
    /// Records requested per enumeration call, each applied as one chunk
    pub items_per_enumeration: usize,
    /// Records per transport unit within an enumeration
    pub items_per_chunk: usize,
    pub source_service_address: String,
    pub retry: RetrySettings,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            copy_phase_parallelism: default_parallelism(),
            downtime_threshold: DEFAULT_DOWNTIME_THRESHOLD,
            items_per_enumeration: DEFAULT_ITEMS_PER_ENUMERATION,
            items_per_chunk: DEFAULT_ITEMS_PER_CHUNK,
            source_service_address: String::new(),
            retry: RetrySettings::default(),
        }
    }
}

impl MigrationSettings {
    pub fn validate(&self) -> Result<(), MigrationError> {
        if self.copy_phase_parallelism == 0 {
            return Err(invalid("copy phase parallelism must be at least 1"));
        }
        if self.downtime_threshold <= 0 {
            return Err(invalid("downtime threshold must be positive"));
        }
        if self.items_per_enumeration == 0 || self.items_per_chunk == 0 {
            return Err(invalid("enumeration and chunk sizes must be at least 1"));
        }
        if self.items_per_chunk > self.items_per_enumeration {
            return Err(invalid(&format!(
                "items per chunk ({}) exceeds items per enumeration ({})",
                self.items_per_chunk, self.items_per_enumeration
            )));
        }
        Ok(())
    }
}

pub fn default_parallelism() -> u32 {
    std::thread::available_parallelism()
        .map(|cpus| u32::try_from(cpus.get()).unwrap_or(u32::MAX))
        .unwrap_or(1)
}

fn invalid(reason: &str) -> MigrationError {
    MigrationError::InvalidSettings(reason.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = MigrationSettings::default();
        assert!(settings.copy_phase_parallelism >= 1);
        assert_eq!(settings.downtime_threshold, 1024);
        settings.validate().unwrap();
    }

    #[test]
    fn rejects_zero_sizes_and_oversized_chunks() {
        let zero_workers = MigrationSettings {
            copy_phase_parallelism: 0,
            ..Default::default()
        };
        assert!(zero_workers.validate().is_err());

        let zero_chunk = MigrationSettings {
            items_per_chunk: 0,
            ..Default::default()
        };
        assert!(zero_chunk.validate().is_err());

        let oversized_chunk = MigrationSettings {
            items_per_enumeration: 10,
            items_per_chunk: 11,
            ..Default::default()
        };
        assert!(matches!(
            oversized_chunk.validate(),
            Err(MigrationError::InvalidSettings(_))
        ));
    }
}
