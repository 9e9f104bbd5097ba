//! Shared control state: operating mode and live settings.
//!
//! Everything that reads or writes the mode record or the settings map goes
//! through a [`StateService`] handed in at construction time, so independent
//! instances (and tests) never share hidden globals.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::storage::{Mode, ModeState, StorageError};

/// Attempts made by [`StateService::set_mode`] before giving up on a
/// contended mode record.
const SET_MODE_RETRIES: usize = 8;

/// Mode record and settings store.
pub trait StateService: Send + Sync {
    /// Current mode record. Creates the initial record if none exists.
    fn mode(&self) -> Result<ModeState, StorageError>;

    /// Replace the mode record only if its version still equals
    /// `expected_version`. `next.version` must be `expected_version + 1`.
    ///
    /// Returns `false` when another writer got there first.
    fn compare_and_set_mode(
        &self,
        expected_version: i64,
        next: &ModeState,
    ) -> Result<bool, StorageError>;

    /// Single setting value.
    fn setting(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Every stored setting.
    fn settings(&self) -> Result<BTreeMap<String, String>, StorageError>;

    /// Insert or overwrite a setting.
    fn put_setting(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Insert a setting only if the key is absent. Returns whether it was written.
    fn seed_setting(&self, key: &str, value: &str) -> Result<bool, StorageError>;

    /// Unconditionally switch to `mode`, retrying the compare-and-set until
    /// it lands. Switching to the current mode only refreshes the reason and
    /// clears any pending transition.
    fn set_mode(
        &self,
        mode: Mode,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<ModeState, StorageError> {
        for _ in 0..SET_MODE_RETRIES {
            let current = self.mode()?;
            let next = ModeState {
                mode,
                entered_at: if current.mode == mode {
                    current.entered_at
                } else {
                    now
                },
                reason: reason.to_string(),
                pending: None,
                pending_count: 0,
                version: current.version + 1,
            };
            if self.compare_and_set_mode(current.version, &next)? {
                return Ok(next);
            }
        }
        Err(StorageError::Internal(
            "mode record too contended to update".to_string(),
        ))
    }
}

/// In-process [`StateService`] for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryState {
    mode: Mutex<Option<ModeState>>,
    settings: Mutex<BTreeMap<String, String>>,
}

impl MemoryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate settings.
    pub fn with_settings<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let state = Self::new();
        {
            let mut settings = state
                .settings
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for (k, v) in pairs {
                settings.insert(k.into(), v.into());
            }
        }
        state
    }
}

impl StateService for MemoryState {
    fn mode(&self) -> Result<ModeState, StorageError> {
        let mut mode = self.mode.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(mode.get_or_insert_with(|| ModeState::initial(Utc::now())).clone())
    }

    fn compare_and_set_mode(
        &self,
        expected_version: i64,
        next: &ModeState,
    ) -> Result<bool, StorageError> {
        let mut mode = self.mode.lock().unwrap_or_else(PoisonError::into_inner);
        let current = mode.get_or_insert_with(|| ModeState::initial(Utc::now()));
        if current.version != expected_version {
            return Ok(false);
        }
        *current = ModeState {
            version: expected_version + 1,
            ..next.clone()
        };
        Ok(true)
    }

    fn setting(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn settings(&self) -> Result<BTreeMap<String, String>, StorageError> {
        Ok(self
            .settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn put_setting(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn seed_setting(&self, key: &str, value: &str) -> Result<bool, StorageError> {
        let mut settings = self.settings.lock().unwrap_or_else(PoisonError::into_inner);
        if settings.contains_key(key) {
            return Ok(false);
        }
        settings.insert(key.to_string(), value.to_string());
        Ok(true)
    }
}
