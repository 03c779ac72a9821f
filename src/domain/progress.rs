use super::account::AccountId;
use crate::error::{Result, TenantError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// A named point in the onboarding pipeline.
///
/// Declaration order is the intended order, but transitions are not checked against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    AccountCreated,
    FetchStarted,
    FetchCompleted,
    ConsistencyStarted,
    ConsistencyCompleted,
    PrecomputeStarted,
    PrecomputeCompleted,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::AccountCreated,
        Stage::FetchStarted,
        Stage::FetchCompleted,
        Stage::ConsistencyStarted,
        Stage::ConsistencyCompleted,
        Stage::PrecomputeStarted,
        Stage::PrecomputeCompleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::AccountCreated => "account_created",
            Stage::FetchStarted => "fetch_started",
            Stage::FetchCompleted => "fetch_completed",
            Stage::ConsistencyStarted => "consistency_started",
            Stage::ConsistencyCompleted => "consistency_completed",
            Stage::PrecomputeStarted => "precompute_started",
            Stage::PrecomputeCompleted => "precompute_completed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = TenantError;

    fn from_str(s: &str) -> Result<Self> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| TenantError::InvalidKey(format!("unknown stage: {s}")))
    }
}

/// Per-account pipeline progress. At most one exists per account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub account_id: AccountId,
    pub stage_timestamps: BTreeMap<Stage, DateTime<Utc>>,
    pub current_status: Stage,
}

impl ProgressRecord {
    pub fn new(account_id: AccountId, current_status: Stage) -> Self {
        Self {
            account_id,
            stage_timestamps: BTreeMap::new(),
            current_status,
        }
    }

    pub fn entered_at(&self, stage: Stage) -> Option<DateTime<Utc>> {
        self.stage_timestamps.get(&stage).copied()
    }
}

/// Maps stages to the timestamp columns of the persisted progress row.
///
/// The column set belongs to the storage schema and has changed across revisions,
/// so it is carried as data. Stages without a column only move `current_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgressSchema {
    columns: BTreeMap<Stage, String>,
}

impl ProgressSchema {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = (Stage, S)>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(|(s, c)| (s, c.into())).collect(),
        }
    }

    /// The current schema revision: fetch and consistency stages only.
    pub fn current() -> Self {
        Self::new(
            [
                Stage::FetchStarted,
                Stage::FetchCompleted,
                Stage::ConsistencyStarted,
                Stage::ConsistencyCompleted,
            ]
            .map(|s| (s, s.as_str())),
        )
    }

    /// The earlier revision that also tracked precomputation.
    pub fn legacy() -> Self {
        Self::new(Stage::ALL[1..].iter().map(|s| (*s, s.as_str())))
    }

    pub fn column(&self, stage: Stage) -> Option<&str> {
        self.columns.get(&stage).map(String::as_str)
    }

    pub fn stage_for_column(&self, column: &str) -> Option<Stage> {
        self.columns
            .iter()
            .find_map(|(stage, c)| (c == column).then_some(*stage))
    }

    pub fn columns(&self) -> impl Iterator<Item = (Stage, &str)> {
        self.columns.iter().map(|(s, c)| (*s, c.as_str()))
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (stage, column) in self.columns() {
            if column.trim().is_empty() {
                return Err(TenantError::Config(format!(
                    "empty column name for stage {stage}"
                )));
            }
            if !seen.insert(column) {
                return Err(TenantError::Config(format!(
                    "column {column} is mapped more than once"
                )));
            }
        }
        Ok(())
    }
}

impl Default for ProgressSchema {
    fn default() -> Self {
        Self::current()
    }
}
