//! Settings for the resolver and the progress schema.
//!
//! Loaded from a JSON file; every field is optional and falls back to its default.
//!
//! ```json
//! {
//!   "resolver": { "ttl_secs": 600, "max_entries": 50000, "coalesce": true, "join_timeout_ms": 5000 },
//!   "progress": {
//!     "fetch_started": "fetch_started",
//!     "fetch_completed": "fetch_completed",
//!     "consistency_started": "consistency_started",
//!     "consistency_completed": "consistency_completed"
//!   }
//! }
//! ```

use crate::domain::progress::ProgressSchema;
use crate::error::{Result, TenantError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub resolver: ResolverConfig,
    /// Stage to timestamp-column mapping of the progress table.
    pub progress: ProgressSchema,
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.resolver.validate()?;
        self.progress.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// How long a resolved (or not-found) account is trusted.
    pub ttl_secs: u64,
    /// Per-index entry bound. `None` keeps every entry until it is overwritten.
    pub max_entries: Option<usize>,
    /// Share one store call between concurrent misses for the same key.
    pub coalesce: bool,
    pub join_timeout_ms: u64,
}

impl ResolverConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ttl_secs == 0 {
            return Err(TenantError::Config("resolver.ttl_secs must be positive".into()));
        }
        if self.max_entries == Some(0) {
            return Err(TenantError::Config(
                "resolver.max_entries must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 10 * 60,
            max_entries: None,
            coalesce: true,
            join_timeout_ms: 5_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::progress::Stage;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.resolver.ttl(), Duration::from_secs(600));
        assert_eq!(settings.resolver.max_entries, None);
        assert_eq!(settings.progress, ProgressSchema::current());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let settings = Settings::from_json(r#"{"resolver": {"max_entries": 10}}"#).unwrap();
        assert_eq!(settings.resolver.max_entries, Some(10));
        assert_eq!(settings.resolver.ttl_secs, 600);
        assert!(settings.resolver.coalesce);
    }

    #[test]
    fn test_rejects_zero_ttl() {
        let err = Settings::from_json(r#"{"resolver": {"ttl_secs": 0}}"#).unwrap_err();
        assert!(matches!(err, TenantError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"progress": {{"fetch_started": "fs", "precompute_started": "ps"}}}}"#
        )
        .unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.progress.column(Stage::FetchStarted), Some("fs"));
        assert_eq!(settings.progress.column(Stage::PrecomputeStarted), Some("ps"));
        assert!(settings.progress.column(Stage::FetchCompleted).is_none());
    }
}
