// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Helpers shared by the workflow managers.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use dataspace_core::command::apply_to_entity;
use dataspace_core::processor::{TransitionFn, transition};
use dataspace_core::{Command, CommandHandler, EngineError, StateEntityStore, StatefulEntity};
use tracing::warn;

/// Bind a transition method of a shared context as a [`TransitionFn`].
pub(crate) fn bind<C, E, F, Fut>(context: &Arc<C>, step: F) -> TransitionFn<E>
where
    C: Send + Sync + 'static,
    E: StatefulEntity,
    F: Fn(Arc<C>, E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = dataspace_core::Result<bool>> + Send + 'static,
{
    let context = context.clone();
    transition(move |entity| step(context.clone(), entity))
}

/// Count a failed attempt, or move the entity to `failed` once `limit`
/// attempts in the current state are used up.
pub(crate) async fn retry_or_fail<E: StatefulEntity>(
    store: &dyn StateEntityStore<E>,
    mut entity: E,
    limit: u32,
    failed: E::State,
    message: impl Into<String>,
) -> dataspace_core::Result<bool> {
    let message = message.into();
    let attempts = entity.state_count() + 1;
    if attempts < limit {
        return Err(EngineError::transition(entity.id(), message));
    }

    warn!(
        entity_type = E::ENTITY_TYPE,
        entity_id = %entity.id(),
        attempts,
        error = %message,
        "Retry limit reached"
    );
    entity.fail_with(failed, message);
    store.save(&entity).await?;
    Ok(true)
}

/// A command that mutates one entity of type `E`.
pub(crate) trait EntityCommand<E: StatefulEntity>: Command {
    /// Change `entity`; returns whether it should be saved.
    fn apply(&self, entity: &mut E) -> bool;
}

/// Handler applying an [`EntityCommand`] under a lease.
pub(crate) struct EntityCommandHandler<E: StatefulEntity, C> {
    store: Arc<dyn StateEntityStore<E>>,
    _command: PhantomData<fn() -> C>,
}

impl<E: StatefulEntity, C> EntityCommandHandler<E, C> {
    pub(crate) fn new(store: Arc<dyn StateEntityStore<E>>) -> Self {
        Self {
            store,
            _command: PhantomData,
        }
    }
}

#[async_trait]
impl<E: StatefulEntity, C: EntityCommand<E>> CommandHandler for EntityCommandHandler<E, C> {
    type Command = C;

    async fn handle(&self, command: &C) -> dataspace_core::Result<()> {
        apply_to_entity(self.store.as_ref(), command.entity_id(), |entity: &mut E| {
            Ok(command.apply(entity))
        })
        .await
        .map(|_| ())
    }
}

/// Log a command that does not apply to the entity's current state.
pub(crate) fn decline<E: StatefulEntity>(command: &str, entity: &E) -> bool {
    warn!(
        command,
        entity_type = E::ENTITY_TYPE,
        entity_id = %entity.id(),
        state = entity.state_code(),
        "Command does not apply in current state, ignoring"
    );
    false
}
