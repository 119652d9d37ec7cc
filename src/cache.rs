// ABOUTME: Process-wide read-through cache for the settings singleton
// ABOUTME: 60-second TTL with explicit invalidation after admin writes
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::database::{Database, DatabaseProvider};
use crate::errors::{AppError, AppResult};
use crate::models::Settings;

/// How long a cached settings snapshot stays valid
pub const SETTINGS_TTL: Duration = Duration::from_secs(60);

/// Read-through cache in front of the settings row.
///
/// Settings are read on nearly every request; the row changes only through
/// the admin surface, which calls [`SettingsCache::invalidate`] after
/// writing.
pub struct SettingsCache {
    db: Database,
    ttl: Duration,
    inner: RwLock<Option<(Settings, Instant)>>,
}

impl SettingsCache {
    /// Create a cache with the default TTL
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self::with_ttl(db, SETTINGS_TTL)
    }

    /// Create a cache with a custom TTL (tests use short ones)
    #[must_use]
    pub fn with_ttl(db: Database, ttl: Duration) -> Self {
        Self {
            db,
            ttl,
            inner: RwLock::new(None),
        }
    }

    /// Current settings, from cache when fresh.
    ///
    /// # Errors
    /// Returns an error if the store is unreadable or was never seeded.
    pub async fn get(&self) -> AppResult<Settings> {
        {
            let guard = self.inner.read().await;
            if let Some((settings, fetched_at)) = guard.as_ref() {
                if fetched_at.elapsed() < self.ttl {
                    return Ok(settings.clone());
                }
            }
        }

        let settings = self
            .db
            .get_settings()
            .await
            .map_err(AppError::from)?
            .ok_or_else(|| AppError::internal("settings row missing; database not seeded"))?;

        let mut guard = self.inner.write().await;
        *guard = Some((settings.clone(), Instant::now()));
        Ok(settings)
    }

    /// Persist new settings and refresh the cache in one step
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub async fn update(&self, settings: &Settings) -> AppResult<()> {
        self.db
            .save_settings(settings)
            .await
            .map_err(AppError::from)?;
        let mut guard = self.inner.write().await;
        *guard = Some((settings.clone(), Instant::now()));
        Ok(())
    }

    /// Drop the cached snapshot; the next read goes to the store
    pub async fn invalidate(&self) {
        let mut guard = self.inner.write().await;
        *guard = None;
    }
}
