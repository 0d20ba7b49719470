// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The polling scheduler.
//!
//! A [`StateMachineManager`] owns a list of [`Processor`]s and runs them in
//! registration order once per tick on a dedicated tokio task. After each
//! tick it sleeps for the delay chosen by its [`WaitStrategy`]; a shutdown
//! signal interrupts the sleep, never an in-flight tick.
//!
//! ```text
//!   Created --start()--> Started --shutdown()--> Stopping --> Stopped
//!      \______________________shutdown()______________________/
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::processor::{Processor, panic_message};
use crate::wait::{FixedWaitStrategy, WaitStrategy};

/// Lifecycle of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerStatus {
    /// Built, loop not running yet.
    Created,
    /// Loop running.
    Started,
    /// Shutdown requested, waiting for the current tick.
    Stopping,
    /// Loop exited.
    Stopped,
}

/// Options for one state machine.
#[derive(Debug, Clone)]
pub struct StateMachineConfig {
    /// Name used in logs.
    pub name: String,
    /// Base delay between ticks.
    pub iteration_wait: Duration,
    /// How long `shutdown` waits for the current tick to finish.
    pub shutdown_timeout: Duration,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            name: "state-machine".to_string(),
            iteration_wait: Duration::from_millis(1000),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl StateMachineConfig {
    /// Default options under `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Counters of a manager since it was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerMetrics {
    /// Completed ticks.
    pub ticks: u64,
    /// Entities advanced across all ticks.
    pub processed: u64,
}

struct Engine {
    name: String,
    processors: Vec<Arc<dyn Processor>>,
    wait_strategy: Arc<dyn WaitStrategy>,
    shutdown: Notify,
    stopping: AtomicBool,
    status: watch::Sender<ManagerStatus>,
    ticks: AtomicU64,
    processed: AtomicU64,
}

impl Engine {
    async fn tick(&self) -> usize {
        let mut processed = 0;
        for processor in &self.processors {
            match AssertUnwindSafe(processor.process()).catch_unwind().await {
                Ok(count) => processed += count,
                Err(panic) => error!(
                    manager = %self.name,
                    processor = %processor.name(),
                    panic = %panic_message(panic.as_ref()),
                    "Processor panicked"
                ),
            }
        }

        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(processed as u64, Ordering::Relaxed);
        processed
    }

    /// Sleep for `millis` or until shutdown. Returns false on shutdown.
    async fn pause(&self, millis: u64) -> bool {
        tokio::select! {
            biased;

            _ = self.shutdown.notified() => false,
            _ = tokio::time::sleep(Duration::from_millis(millis)) => true,
        }
    }

    async fn run(self: Arc<Self>) {
        info!(
            manager = %self.name,
            processors = self.processors.len(),
            "State machine started"
        );

        let mut delay = self.wait_strategy.wait_for_millis();
        loop {
            if self.stopping.load(Ordering::Acquire) || !self.pause(delay).await {
                break;
            }
            if self.stopping.load(Ordering::Acquire) {
                break;
            }

            let processed = self.tick().await;
            delay = if processed > 0 {
                debug!(manager = %self.name, processed, "Tick processed entities");
                self.wait_strategy.success()
            } else {
                self.wait_strategy.retry_in_millis()
            };
        }

        self.status.send_replace(ManagerStatus::Stopped);
        info!(manager = %self.name, "State machine stopped");
    }
}

/// Runs registered processors in a loop until shut down.
pub struct StateMachineManager {
    config: StateMachineConfig,
    processors: Vec<Arc<dyn Processor>>,
    wait_strategy: Arc<dyn WaitStrategy>,
    engine: Mutex<Option<Arc<Engine>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    status: watch::Sender<ManagerStatus>,
}

impl StateMachineManager {
    /// Manager waiting a fixed `config.iteration_wait` between ticks.
    pub fn new(config: StateMachineConfig) -> Self {
        let wait = FixedWaitStrategy::from_duration(config.iteration_wait);
        Self::with_wait_strategy(config, Arc::new(wait))
    }

    /// Manager using a custom wait strategy.
    pub fn with_wait_strategy(
        config: StateMachineConfig,
        wait_strategy: Arc<dyn WaitStrategy>,
    ) -> Self {
        let (status, _) = watch::channel(ManagerStatus::Created);
        Self {
            config,
            processors: Vec::new(),
            wait_strategy,
            engine: Mutex::new(None),
            handle: Mutex::new(None),
            status,
        }
    }

    /// Options this manager was built with.
    pub fn config(&self) -> &StateMachineConfig {
        &self.config
    }

    /// Add a processor; processors run in registration order.
    ///
    /// Processors registered after `start` are not picked up.
    pub fn register(&mut self, processor: Arc<dyn Processor>) -> &mut Self {
        self.processors.push(processor);
        if self.status() == ManagerStatus::Created {
            // Rebuilt with the new processor list on the next tick or start.
            *self.engine.get_mut().unwrap_or_else(PoisonError::into_inner) = None;
        }
        self
    }

    /// Current lifecycle status.
    pub fn status(&self) -> ManagerStatus {
        *self.status.borrow()
    }

    /// Watch lifecycle changes.
    pub fn subscribe(&self) -> watch::Receiver<ManagerStatus> {
        self.status.subscribe()
    }

    /// Counters accumulated by the running loop.
    pub fn metrics(&self) -> ManagerMetrics {
        match &*self.engine.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(engine) => ManagerMetrics {
                ticks: engine.ticks.load(Ordering::Relaxed),
                processed: engine.processed.load(Ordering::Relaxed),
            },
            None => ManagerMetrics::default(),
        }
    }

    fn engine(&self) -> Arc<Engine> {
        self.engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(|| {
                Arc::new(Engine {
                    name: self.config.name.clone(),
                    processors: self.processors.clone(),
                    wait_strategy: self.wait_strategy.clone(),
                    shutdown: Notify::new(),
                    stopping: AtomicBool::new(false),
                    status: self.status.clone(),
                    ticks: AtomicU64::new(0),
                    processed: AtomicU64::new(0),
                })
            })
            .clone()
    }

    /// Run every processor once on the caller's task and return the number
    /// of entities advanced.
    pub async fn tick(&self) -> usize {
        self.engine().tick().await
    }

    /// Spawn the scheduling loop. Has no effect unless the manager is `Created`.
    pub fn start(&self) {
        let started = self.status.send_if_modified(|status| {
            if *status == ManagerStatus::Created {
                *status = ManagerStatus::Started;
                true
            } else {
                false
            }
        });
        if !started {
            warn!(
                manager = %self.config.name,
                status = ?self.status(),
                "State machine already started"
            );
            return;
        }

        let handle = tokio::spawn(self.engine().run());
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Stop the loop and wait, bounded by the configured timeout, for the
    /// current tick to finish. Idempotent.
    pub async fn shutdown(&self) {
        let mut previous = ManagerStatus::Stopped;
        self.status.send_if_modified(|status| {
            previous = *status;
            match *status {
                ManagerStatus::Created => {
                    *status = ManagerStatus::Stopped;
                    true
                }
                ManagerStatus::Started => {
                    *status = ManagerStatus::Stopping;
                    true
                }
                _ => false,
            }
        });
        if previous == ManagerStatus::Created {
            return;
        }

        let engine = self.engine();
        engine.stopping.store(true, Ordering::Release);
        engine.shutdown.notify_one();

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut handle) = handle else {
            return;
        };

        match tokio::time::timeout(self.config.shutdown_timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(manager = %self.config.name, error = %e, "State machine task failed")
            }
            Err(_) => {
                warn!(
                    manager = %self.config.name,
                    timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                    "State machine did not stop in time, aborting"
                );
                handle.abort();
                self.status.send_replace(ManagerStatus::Stopped);
            }
        }
    }
}
