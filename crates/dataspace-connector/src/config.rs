// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::str::FromStr;
use std::time::Duration;

use dataspace_core::{LeaseSettings, StateMachineConfig};
use uuid::Uuid;

/// Connector configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite URL of the shared stores; in-memory stores when unset
    pub database_url: Option<String>,
    /// Lease owner id of this connector instance
    pub runtime_id: String,
    /// Entities leased per processor and tick
    pub batch_size: usize,
    /// Base delay between state machine ticks
    pub iteration_wait: Duration,
    /// Lease duration
    pub lease_duration: Duration,
    /// Command queue bound per manager
    pub command_queue_capacity: usize,
    /// Commands drained per tick
    pub command_batch_size: usize,
    /// Attempts per state before a process is moved to its error state
    pub send_retry_limit: u32,
    /// Data-plane probe timeout
    pub health_check_timeout: Duration,
    /// Age after which AVAILABLE/UNAVAILABLE data planes are probed again
    pub dataplane_recheck_interval: Duration,
    /// How long shutdown waits for each state machine
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            runtime_id: Uuid::new_v4().to_string(),
            batch_size: 20,
            iteration_wait: Duration::from_millis(1000),
            lease_duration: Duration::from_millis(60_000),
            command_queue_capacity: 1000,
            command_batch_size: 5,
            send_retry_limit: 7,
            health_check_timeout: Duration::from_millis(2000),
            dataplane_recheck_interval: Duration::from_millis(30_000),
            shutdown_timeout: Duration::from_millis(10_000),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional:
    /// - `CONNECTOR_DATABASE_URL`: SQLite URL (default: in-memory stores)
    /// - `CONNECTOR_RUNTIME_ID`: lease owner id (default: random UUID)
    /// - `CONNECTOR_STATE_MACHINE_BATCH_SIZE` (default: 20)
    /// - `CONNECTOR_STATE_MACHINE_ITERATION_WAIT_MS` (default: 1000)
    /// - `CONNECTOR_LEASE_DURATION_MS` (default: 60000)
    /// - `CONNECTOR_COMMAND_QUEUE_CAPACITY` (default: 1000)
    /// - `CONNECTOR_COMMAND_BATCH_SIZE` (default: 5)
    /// - `CONNECTOR_SEND_RETRY_LIMIT` (default: 7)
    /// - `CONNECTOR_HEALTH_CHECK_TIMEOUT_MS` (default: 2000)
    /// - `CONNECTOR_DATAPLANE_RECHECK_MS` (default: 30000)
    /// - `CONNECTOR_SHUTDOWN_TIMEOUT_MS` (default: 10000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_url = std::env::var("CONNECTOR_DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let runtime_id = std::env::var("CONNECTOR_RUNTIME_ID")
            .ok()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or(defaults.runtime_id);

        let batch_size = positive("CONNECTOR_STATE_MACHINE_BATCH_SIZE", defaults.batch_size)?;
        let iteration_wait = millis(
            "CONNECTOR_STATE_MACHINE_ITERATION_WAIT_MS",
            defaults.iteration_wait,
        )?;
        let lease_duration = millis("CONNECTOR_LEASE_DURATION_MS", defaults.lease_duration)?;
        if lease_duration.is_zero() {
            return Err(ConfigError::Invalid(
                "CONNECTOR_LEASE_DURATION_MS",
                "must be greater than zero",
            ));
        }
        let command_queue_capacity = positive(
            "CONNECTOR_COMMAND_QUEUE_CAPACITY",
            defaults.command_queue_capacity,
        )?;
        let command_batch_size =
            positive("CONNECTOR_COMMAND_BATCH_SIZE", defaults.command_batch_size)?;
        let send_retry_limit = positive("CONNECTOR_SEND_RETRY_LIMIT", defaults.send_retry_limit)?;
        let health_check_timeout = millis(
            "CONNECTOR_HEALTH_CHECK_TIMEOUT_MS",
            defaults.health_check_timeout,
        )?;
        let dataplane_recheck_interval = millis(
            "CONNECTOR_DATAPLANE_RECHECK_MS",
            defaults.dataplane_recheck_interval,
        )?;
        let shutdown_timeout = millis("CONNECTOR_SHUTDOWN_TIMEOUT_MS", defaults.shutdown_timeout)?;

        Ok(Self {
            database_url,
            runtime_id,
            batch_size,
            iteration_wait,
            lease_duration,
            command_queue_capacity,
            command_batch_size,
            send_retry_limit,
            health_check_timeout,
            dataplane_recheck_interval,
            shutdown_timeout,
        })
    }

    /// Lease settings of this instance.
    pub fn lease_settings(&self) -> LeaseSettings {
        LeaseSettings::new(self.runtime_id.clone()).with_duration(self.lease_duration)
    }

    /// State machine options for the manager `name`.
    pub fn state_machine(&self, name: &str) -> StateMachineConfig {
        StateMachineConfig {
            name: name.to_string(),
            iteration_wait: self.iteration_wait,
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

fn parse<T: FromStr>(
    name: &'static str,
    default: T,
    reason: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(name, reason)),
        Err(_) => Ok(default),
    }
}

fn positive<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    let value = parse(name, default, "must be a positive integer")?;
    if value <= T::default() {
        return Err(ConfigError::Invalid(name, "must be a positive integer"));
    }
    Ok(value)
}

fn millis(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse(name, default, "must be a number of milliseconds").map(Duration::from_millis)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
