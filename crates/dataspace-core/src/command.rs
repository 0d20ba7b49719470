// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Out-of-band entity mutations.
//!
//! External callers (API layer, callbacks from a data plane) cannot touch an
//! entity directly: the polling loop may hold its lease. Instead they
//! [`CommandQueue::enqueue`] a typed [`Command`]. A [`CommandProcessor`],
//! registered on the same state machine as the workflow processors, drains a
//! bounded batch per tick and dispatches each command to the
//! [`CommandHandler`] registered for its concrete type.
//!
//! Delivery is at-least-once: a failed retryable command goes back on the
//! queue until it has been attempted `max_attempts` times. Commands that
//! exhaust their attempts, are not retryable, or have no handler are logged
//! at error level and dropped.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, warn};

use crate::entity::StatefulEntity;
use crate::error::{EngineError, Result};
use crate::processor::{Processor, panic_message};
use crate::store::StateEntityStore;

/// Default number of handling attempts for a retryable command.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// A mutation request targeting one entity.
pub trait Command: Any + Send + Sync + fmt::Debug {
    /// Id of the entity the command applies to.
    fn entity_id(&self) -> &str;

    /// Whether a failed attempt should be retried.
    fn can_retry(&self) -> bool;
}

/// A command on the queue together with its delivery bookkeeping.
pub struct QueuedCommand {
    payload: Box<dyn Any + Send + Sync>,
    type_id: TypeId,
    type_name: &'static str,
    entity_id: String,
    can_retry: bool,
    attempts: u32,
    description: String,
}

impl QueuedCommand {
    fn new<C: Command>(command: C) -> Self {
        Self {
            type_id: TypeId::of::<C>(),
            type_name: short_type_name::<C>(),
            entity_id: command.entity_id().to_string(),
            can_retry: command.can_retry(),
            description: format!("{command:?}"),
            attempts: 0,
            payload: Box::new(command),
        }
    }

    /// Target entity id.
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Concrete command type name.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Dispatch key.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Failed attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the command may be retried.
    pub fn can_retry(&self) -> bool {
        self.can_retry
    }

    /// Borrow the command as its concrete type.
    pub fn downcast_ref<C: Command>(&self) -> Option<&C> {
        self.payload.downcast_ref::<C>()
    }
}

impl fmt::Debug for QueuedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedCommand")
            .field("command", &self.description)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Bounded FIFO of pending commands.
pub struct CommandQueue {
    sender: mpsc::Sender<QueuedCommand>,
    receiver: Mutex<mpsc::Receiver<QueuedCommand>>,
    capacity: usize,
}

impl CommandQueue {
    /// Queue holding at most `capacity` commands (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Mutex::new(receiver),
            capacity,
        }
    }

    /// Maximum number of queued commands.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.capacity - self.sender.capacity()
    }

    /// Whether no command is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a command. Fails immediately with `QueueFull` when at capacity.
    pub fn enqueue<C: Command>(&self, command: C) -> Result<()> {
        let queued = QueuedCommand::new(command);
        debug!(
            command_type = queued.type_name,
            entity_id = %queued.entity_id,
            "Enqueuing command"
        );
        self.push(queued)
    }

    fn push(&self, command: QueuedCommand) -> Result<()> {
        self.sender
            .try_send(command)
            .map_err(|_| EngineError::QueueFull {
                capacity: self.capacity,
            })
    }

    /// Remove up to `max` commands in FIFO order.
    pub async fn dequeue(&self, max: usize) -> Vec<QueuedCommand> {
        let mut receiver = self.receiver.lock().await;
        let mut batch = Vec::with_capacity(max.min(self.capacity));
        while batch.len() < max {
            match receiver.try_recv() {
                Ok(command) => batch.push(command),
                Err(_) => break,
            }
        }
        batch
    }
}

/// Applies commands of one concrete type.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// The command type handled.
    type Command: Command;

    /// Apply the command.
    async fn handle(&self, command: &Self::Command) -> Result<()>;
}

/// Type-erased [`CommandHandler`] as stored in the registry.
#[async_trait]
pub trait AnyCommandHandler: Send + Sync {
    /// Apply a queued command.
    async fn handle_queued(&self, command: &QueuedCommand) -> Result<()>;
}

#[async_trait]
impl<H: CommandHandler> AnyCommandHandler for H {
    async fn handle_queued(&self, command: &QueuedCommand) -> Result<()> {
        let typed = command
            .downcast_ref::<H::Command>()
            .ok_or_else(|| EngineError::HandlerNotFound {
                command_type: command.type_name.to_string(),
            })?;
        self.handle(typed).await
    }
}

/// One handler per command type, fixed at startup.
#[derive(Default)]
pub struct CommandHandlerRegistry {
    handlers: HashMap<TypeId, Arc<dyn AnyCommandHandler>>,
}

impl CommandHandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for its command type. A second handler for the
    /// same type is rejected with `DuplicateHandler`.
    pub fn register<H: CommandHandler>(&mut self, handler: H) -> Result<()> {
        let type_id = TypeId::of::<H::Command>();
        if self.handlers.contains_key(&type_id) {
            return Err(EngineError::DuplicateHandler {
                command_type: short_type_name::<H::Command>().to_string(),
            });
        }
        self.handlers.insert(type_id, Arc::new(handler));
        Ok(())
    }

    /// Handler for the command's type, or `HandlerNotFound`.
    pub fn get(&self, command: &QueuedCommand) -> Result<Arc<dyn AnyCommandHandler>> {
        self.handlers
            .get(&command.type_id)
            .cloned()
            .ok_or_else(|| EngineError::HandlerNotFound {
                command_type: command.type_name.to_string(),
            })
    }

    /// Whether a handler for `C` is registered.
    pub fn contains<C: Command>(&self) -> bool {
        self.handlers.contains_key(&TypeId::of::<C>())
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Drains the command queue once per tick.
pub struct CommandProcessor {
    queue: Arc<CommandQueue>,
    registry: Arc<CommandHandlerRegistry>,
    batch_size: usize,
    max_attempts: u32,
    applied: AtomicU64,
}

impl CommandProcessor {
    /// Processor draining up to `batch_size` commands per tick.
    pub fn new(
        queue: Arc<CommandQueue>,
        registry: Arc<CommandHandlerRegistry>,
        batch_size: usize,
    ) -> Self {
        Self {
            queue,
            registry,
            batch_size,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            applied: AtomicU64::new(0),
        }
    }

    /// Override how many times a retryable command is attempted.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Commands applied successfully since creation.
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    async fn execute(&self, command: &QueuedCommand) -> Result<()> {
        let handler = self.registry.get(command)?;
        match AssertUnwindSafe(handler.handle_queued(command))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(EngineError::transition(
                command.entity_id(),
                format!("command handler panicked: {}", panic_message(panic.as_ref())),
            )),
        }
    }

    fn on_failure(&self, mut command: QueuedCommand, err: EngineError) {
        if matches!(err, EngineError::HandlerNotFound { .. }) {
            error!(
                command_type = command.type_name,
                entity_id = %command.entity_id,
                "No handler registered for command, dropping"
            );
            return;
        }

        command.attempts += 1;
        if !command.can_retry || !err.is_retryable() || command.attempts >= self.max_attempts {
            error!(
                command = ?command,
                entity_id = %command.entity_id,
                attempts = command.attempts,
                error = %err,
                "Command failed and will not be retried"
            );
            return;
        }

        warn!(
            command_type = command.type_name,
            entity_id = %command.entity_id,
            attempts = command.attempts,
            error = %err,
            "Command failed, re-enqueuing"
        );
        let type_name = command.type_name;
        let entity_id = command.entity_id.clone();
        if let Err(e) = self.queue.push(command) {
            error!(
                command_type = type_name,
                entity_id = %entity_id,
                error = %e,
                "Failed to re-enqueue command, dropping"
            );
        }
    }
}

#[async_trait]
impl Processor for CommandProcessor {
    fn name(&self) -> &str {
        "commands"
    }

    async fn process(&self) -> usize {
        let batch = self.queue.dequeue(self.batch_size).await;
        let mut applied = 0;
        for command in batch {
            match self.execute(&command).await {
                Ok(()) => {
                    debug!(
                        command_type = command.type_name,
                        entity_id = %command.entity_id,
                        "Command applied"
                    );
                    applied += 1;
                }
                Err(e) => self.on_failure(command, e),
            }
        }
        self.applied.fetch_add(applied as u64, Ordering::Relaxed);
        applied
    }
}

/// Lease `id`, let `modify` change it and save it.
///
/// `modify` returns whether the entity should be saved. When it declines or
/// fails the lease is broken and nothing is written. Returns whether the
/// entity was saved.
pub async fn apply_to_entity<E, S, F>(store: &S, id: &str, modify: F) -> Result<bool>
where
    E: StatefulEntity,
    S: StateEntityStore<E> + ?Sized,
    F: FnOnce(&mut E) -> Result<bool> + Send,
{
    let mut entity = store.find_by_id_and_lease(id).await?;
    match modify(&mut entity) {
        Ok(true) => {
            store.save(&entity).await?;
            Ok(true)
        }
        Ok(false) => {
            store.break_lease(&entity).await?;
            Ok(false)
        }
        Err(e) => {
            if let Err(release) = store.break_lease(&entity).await {
                warn!(entity_id = %id, error = %release, "Failed to break lease");
            }
            Err(e)
        }
    }
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}
