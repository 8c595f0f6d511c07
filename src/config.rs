//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `CONVEYOR_DATABASE_URL`: PostgreSQL connection string (required)
//! - `CONVEYOR_FLOWS_FILE`: JSON file with flow configurations to install at startup (optional)
//! - `CONVEYOR_APP_NAME`: Name reported in worker heartbeats (default: conveyor-core)
//! - `CONVEYOR_MAX_QUEUE_SIZE`: Live-queue depth at which a class goes cold (default: 5000)
//! - `CONVEYOR_ADMISSION_REFRESH_INTERVAL_MS`: Queue depth snapshot interval (default: 2000)
//! - `CONVEYOR_COLD_DRAIN_INTERVAL_MS`: Cold-queue drain interval (default: 2000)
//! - `CONVEYOR_MAX_CONCURRENT_EVENTS`: Concurrent event handlers (default: num_cpus * 2)
//! - `CONVEYOR_DELETE_ON_COMPLETION`: Delete units reaching COMPLETE (default: false)
//! - `CONVEYOR_REQUEUE_THRESHOLD_SECS`: Age before a queued action is re-pushed (default: 300)
//! - `CONVEYOR_REQUEUE_INTERVAL_SECS`: Requeue sweep interval (default: 30)
//! - `CONVEYOR_AUTO_RESUME_INTERVAL_SECS`: Auto-resume sweep interval (default: 10)
//! - `CONVEYOR_SWEEP_BATCH_SIZE`: Max units per sweep pass (default: 100)
//! - `CONVEYOR_JOIN_ACQUIRE_TIMEOUT_MS`: Join lock acquisition budget (default: 5000)
//! - `CONVEYOR_JOIN_RETRY_SLEEP_MS`: Sleep between join lock attempts (default: 100)
//! - `CONVEYOR_JOIN_LOCK_MAX_SECS`: Join lock hold limit before force release (default: 30)
//! - `CONVEYOR_JOIN_REAP_INTERVAL_MS`: Join reaper interval (default: 5000)

use std::{
    env,
    sync::{OnceLock, RwLock},
    time::Duration,
};

use anyhow::{Context, Result};

use crate::admission::AdmissionConfig;
use crate::dispatcher::DispatcherConfig;
use crate::join::JoinConfig;
use crate::requeue::RequeueConfig;

/// Global configuration cache
static CONFIG: OnceLock<RwLock<Config>> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// JSON file with flow configurations to install at startup
    pub flows_file: Option<String>,

    /// Name reported in worker heartbeat records
    pub app_name: String,

    /// Live-queue depth at which an action class is cold-queued
    pub max_queue_size: u64,

    /// Queue depth snapshot interval (milliseconds)
    pub admission_refresh_interval_ms: u64,

    /// Cold-queue drain interval (milliseconds)
    pub cold_drain_interval_ms: u64,

    /// Maximum concurrently handled action events
    pub max_concurrent_events: usize,

    /// Delete units that reach COMPLETE instead of keeping them
    pub delete_on_completion: bool,

    /// Age in seconds before a queued action counts as lost
    pub requeue_threshold_secs: i64,

    /// Requeue sweep interval (seconds)
    pub requeue_interval_secs: u64,

    /// Auto-resume sweep interval (seconds)
    pub auto_resume_interval_secs: u64,

    /// Maximum units processed per sweep pass
    pub sweep_batch_size: usize,

    /// Join lock acquisition budget (milliseconds)
    pub join_acquire_timeout_ms: u64,

    /// Sleep between join lock attempts (milliseconds)
    pub join_retry_sleep_ms: u64,

    /// Join lock hold limit before the sweep force-releases it (seconds)
    pub join_lock_max_secs: i64,

    /// Join reaper interval (milliseconds)
    pub join_reap_interval_ms: u64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env::var("CONVEYOR_DATABASE_URL")
            .context("CONVEYOR_DATABASE_URL environment variable is required")?;

        let flows_file = env::var("CONVEYOR_FLOWS_FILE").ok();

        let app_name =
            env::var("CONVEYOR_APP_NAME").unwrap_or_else(|_| "conveyor-core".to_string());

        let max_queue_size = env::var("CONVEYOR_MAX_QUEUE_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);

        let admission_refresh_interval_ms = env::var("CONVEYOR_ADMISSION_REFRESH_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2000);

        let cold_drain_interval_ms = env::var("CONVEYOR_COLD_DRAIN_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2000);

        let max_concurrent_events = env::var("CONVEYOR_MAX_CONCURRENT_EVENTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| num_cpus::get().max(1) * 2);

        let delete_on_completion = env::var("CONVEYOR_DELETE_ON_COMPLETION")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let requeue_threshold_secs = env::var("CONVEYOR_REQUEUE_THRESHOLD_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300);

        let requeue_interval_secs = env::var("CONVEYOR_REQUEUE_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let auto_resume_interval_secs = env::var("CONVEYOR_AUTO_RESUME_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let sweep_batch_size = env::var("CONVEYOR_SWEEP_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(100);

        let join_acquire_timeout_ms = env::var("CONVEYOR_JOIN_ACQUIRE_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);

        let join_retry_sleep_ms = env::var("CONVEYOR_JOIN_RETRY_SLEEP_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(100);

        let join_lock_max_secs = env::var("CONVEYOR_JOIN_LOCK_MAX_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let join_reap_interval_ms = env::var("CONVEYOR_JOIN_REAP_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);

        Ok(Self {
            database_url,
            flows_file,
            app_name,
            max_queue_size,
            admission_refresh_interval_ms,
            cold_drain_interval_ms,
            max_concurrent_events,
            delete_on_completion,
            requeue_threshold_secs,
            requeue_interval_secs,
            auto_resume_interval_secs,
            sweep_batch_size,
            join_acquire_timeout_ms,
            join_retry_sleep_ms,
            join_lock_max_secs,
            join_reap_interval_ms,
        })
    }

    pub fn admission_config(&self) -> AdmissionConfig {
        AdmissionConfig {
            max_queue_size: self.max_queue_size,
            refresh_interval: Duration::from_millis(self.admission_refresh_interval_ms),
            drain_interval: Duration::from_millis(self.cold_drain_interval_ms),
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_concurrent: self.max_concurrent_events,
            delete_on_completion: self.delete_on_completion,
        }
    }

    pub fn requeue_config(&self) -> RequeueConfig {
        RequeueConfig {
            threshold: chrono::Duration::seconds(self.requeue_threshold_secs),
            sweep_interval: Duration::from_secs(self.requeue_interval_secs),
            auto_resume_interval: Duration::from_secs(self.auto_resume_interval_secs),
            batch_size: self.sweep_batch_size,
        }
    }

    pub fn join_config(&self) -> JoinConfig {
        JoinConfig {
            acquire_timeout: Duration::from_millis(self.join_acquire_timeout_ms),
            retry_sleep: Duration::from_millis(self.join_retry_sleep_ms),
            lock_max_duration: chrono::Duration::seconds(self.join_lock_max_secs),
            reap_interval: Duration::from_millis(self.join_reap_interval_ms),
        }
    }

    /// Create a test configuration with defaults
    #[cfg(test)]
    pub fn test_config(database_url: &str) -> Self {
        Self {
            database_url: database_url.to_string(),
            flows_file: None,
            app_name: "conveyor-test".to_string(),
            max_queue_size: 10,
            admission_refresh_interval_ms: 100,
            cold_drain_interval_ms: 100,
            max_concurrent_events: 4,
            delete_on_completion: false,
            requeue_threshold_secs: 300,
            requeue_interval_secs: 30,
            auto_resume_interval_secs: 10,
            sweep_batch_size: 100,
            join_acquire_timeout_ms: 500,
            join_retry_sleep_ms: 10,
            join_lock_max_secs: 30,
            join_reap_interval_ms: 100,
        }
    }
}

/// Get the global configuration, loading from environment if not yet
/// initialized.
///
/// # Panics
///
/// Panics if configuration loading fails (e.g., missing required
/// CONVEYOR_DATABASE_URL).
pub fn get_config() -> Config {
    CONFIG
        .get_or_init(|| {
            let config = Config::from_env().expect("failed to load configuration from environment");
            RwLock::new(config)
        })
        .read()
        .expect("config lock poisoned")
        .clone()
}

/// Like `get_config()` but returns a Result instead of panicking.
pub fn try_get_config() -> Result<Config> {
    match CONFIG.get() {
        Some(lock) => Ok(lock.read().expect("config lock poisoned").clone()),
        None => {
            let config = Config::from_env()?;
            let lock = CONFIG.get_or_init(|| RwLock::new(config.clone()));
            Ok(lock.read().expect("config lock poisoned").clone())
        }
    }
}

/// Get the database URL from environment
pub fn database_url() -> Result<String> {
    dotenvy::dotenv().ok();
    env::var("CONVEYOR_DATABASE_URL")
        .context("CONVEYOR_DATABASE_URL environment variable is required")
}
