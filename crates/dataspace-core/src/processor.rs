// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Processors: one fetch/transition/not-processed triple per workflow state.
//!
//! A [`StateProcessor`] leases a batch of entities matching its filter and
//! runs the transition function on each. The transition owns the happy path
//! (it saves the entity, which releases the lease). Everything else is
//! handled here:
//!
//! ```text
//!   transition -> Ok(true)   processed
//!   transition -> Ok(false)  on_not_processed (default: break lease)
//!   transition -> Err / panic  state_count + 1, error_detail set, save;
//!                              break lease if the save fails
//! ```

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{Instrument, debug, debug_span, error, field, warn};

use crate::entity::{StatefulEntity, TRACEPARENT};
use crate::error::Result;
use crate::query::Criterion;
use crate::store::StateEntityStore;

/// Per-entity transition: returns whether the entity was advanced.
pub type TransitionFn<E> = Arc<dyn Fn(E) -> BoxFuture<'static, Result<bool>> + Send + Sync>;

/// Callback for entities the transition declined to advance.
pub type NotProcessedFn<E> = Arc<dyn Fn(E) -> BoxFuture<'static, ()> + Send + Sync>;

/// Predicate selecting entities for a guard handler.
pub type GuardPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Builds the fetch filter at the start of every batch.
pub type FilterFn = Arc<dyn Fn() -> Vec<Criterion> + Send + Sync>;

/// Wrap an async closure as a [`TransitionFn`].
pub fn transition<E, F, Fut>(f: F) -> TransitionFn<E>
where
    E: StatefulEntity,
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    Arc::new(move |entity| f(entity).boxed())
}

/// Unit of work run once per state machine tick.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Run one batch and return how many entities were advanced.
    async fn process(&self) -> usize;
}

/// Processor driving entities of one state through a transition function.
pub struct StateProcessor<E: StatefulEntity> {
    name: String,
    store: Arc<dyn StateEntityStore<E>>,
    filter: FilterFn,
    batch_size: usize,
    transition: TransitionFn<E>,
    guard: Option<(GuardPredicate<E>, TransitionFn<E>)>,
    on_not_processed: Option<NotProcessedFn<E>>,
}

impl<E: StatefulEntity> StateProcessor<E> {
    /// Processor leasing up to `batch_size` entities matching `filter` per tick.
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn StateEntityStore<E>>,
        filter: Vec<Criterion>,
        batch_size: usize,
        transition: TransitionFn<E>,
    ) -> Self {
        Self::dynamic(
            name,
            store,
            Arc::new(move || filter.clone()),
            batch_size,
            transition,
        )
    }

    /// Processor whose filter is recomputed per batch (e.g. time-based criteria).
    pub fn dynamic(
        name: impl Into<String>,
        store: Arc<dyn StateEntityStore<E>>,
        filter: FilterFn,
        batch_size: usize,
        transition: TransitionFn<E>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            filter,
            batch_size,
            transition,
            guard: None,
            on_not_processed: None,
        }
    }

    /// Processor for every entity in state `state`.
    pub fn for_state(
        store: Arc<dyn StateEntityStore<E>>,
        state: E::State,
        batch_size: usize,
        transition: TransitionFn<E>,
    ) -> Self {
        use crate::entity::EntityState;
        Self::new(
            format!("{}:{:?}", E::ENTITY_TYPE, state),
            store,
            vec![Criterion::state_is(state.code())],
            batch_size,
            transition,
        )
    }

    /// Divert entities matching `predicate` to `handler` instead of the transition.
    pub fn with_guard(mut self, predicate: GuardPredicate<E>, handler: TransitionFn<E>) -> Self {
        self.guard = Some((predicate, handler));
        self
    }

    /// Replace the default not-processed callback (break lease).
    pub fn with_on_not_processed(mut self, callback: NotProcessedFn<E>) -> Self {
        self.on_not_processed = Some(callback);
        self
    }

    async fn process_one(&self, entity: E) -> bool {
        let handler = match &self.guard {
            Some((predicate, handler)) if predicate(&entity) => handler,
            _ => &self.transition,
        };

        let snapshot = entity.clone();
        let outcome = AssertUnwindSafe(handler(entity)).catch_unwind().await;

        match outcome {
            Ok(Ok(true)) => true,
            Ok(Ok(false)) => {
                self.not_processed(snapshot).await;
                false
            }
            Ok(Err(e)) => {
                warn!(
                    processor = %self.name,
                    entity_id = %snapshot.id(),
                    error_code = e.error_code(),
                    error = %e,
                    "Transition failed"
                );
                self.record_failure(snapshot, e.to_string()).await;
                false
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    processor = %self.name,
                    entity_id = %snapshot.id(),
                    panic = %message,
                    "Transition panicked"
                );
                self.record_failure(snapshot, format!("transition panicked: {message}"))
                    .await;
                false
            }
        }
    }

    async fn not_processed(&self, entity: E) {
        match &self.on_not_processed {
            Some(callback) => callback(entity).await,
            None => {
                if let Err(e) = self.store.break_lease(&entity).await {
                    debug!(entity_id = %entity.id(), error = %e, "Failed to break lease");
                }
            }
        }
    }

    async fn record_failure(&self, mut entity: E, detail: String) {
        // The transition may have saved before failing; the store then no
        // longer holds our lease and the persisted state must win.
        match self.store.lease(entity.id()).await {
            Ok(Some(lease)) if lease.is_held_by(self.store.lease_holder()) => {}
            Ok(_) => {
                warn!(entity_id = %entity.id(), "Lease lost before failure could be recorded");
                return;
            }
            Err(e) => {
                error!(entity_id = %entity.id(), error = %e, "Failed to read lease");
                return;
            }
        }

        entity.record_failed_attempt(detail);
        if let Err(e) = self.store.save(&entity).await {
            error!(entity_id = %entity.id(), error = %e, "Failed to record failed attempt");
            if let Err(e) = self.store.break_lease(&entity).await {
                error!(entity_id = %entity.id(), error = %e, "Failed to break lease");
            }
        }
    }
}

#[async_trait]
impl<E: StatefulEntity> Processor for StateProcessor<E> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self) -> usize {
        let filter = (self.filter)();
        let entities = match self.store.next_not_leased(self.batch_size, &filter).await {
            Ok(entities) => entities,
            Err(e) => {
                error!(processor = %self.name, error = %e, "Failed to fetch entities");
                return 0;
            }
        };

        let mut processed = 0;
        for entity in entities {
            let span = debug_span!(
                "transition",
                entity_type = E::ENTITY_TYPE,
                entity_id = %entity.id(),
                state = entity.state_code(),
                traceparent = field::Empty,
            );
            if let Some(parent) = entity.trace_context().get(TRACEPARENT) {
                span.record("traceparent", parent.as_str());
            }

            if self.process_one(entity).instrument(span).await {
                processed += 1;
            }
        }
        processed
    }
}

/// Human-readable message of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityState;
    use crate::entity::testing::{Job, JobState};
    use crate::error::EngineError;
    use crate::lease::LeaseSettings;
    use crate::store::InMemoryStateEntityStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store() -> Arc<InMemoryStateEntityStore<Job>> {
        Arc::new(InMemoryStateEntityStore::new(LeaseSettings::new("runtime-a")))
    }

    fn advance_to_running(store: Arc<InMemoryStateEntityStore<Job>>) -> TransitionFn<Job> {
        transition(move |mut job: Job| {
            let store = store.clone();
            async move {
                job.transition_to(JobState::Running);
                store.save(&job).await?;
                Ok(true)
            }
        })
    }

    #[tokio::test]
    async fn test_successful_transition_saves_and_releases() {
        let store = store();
        store.save(&Job::aged("j1", JobState::Queued, 0)).await.unwrap();

        let processor = StateProcessor::for_state(
            store.clone(),
            JobState::Queued,
            10,
            advance_to_running(store.clone()),
        );
        assert_eq!(processor.name(), "job:Queued");
        assert_eq!(processor.process().await, 1);

        let job = store.find_by_id("j1").await.unwrap().unwrap();
        assert_eq!(job.state(), Some(JobState::Running));
        assert!(store.lease("j1").await.unwrap().is_none());
        assert_eq!(processor.process().await, 0);
    }

    #[tokio::test]
    async fn test_failed_transition_counts_attempt_and_retries() {
        let store = store();
        store.save(&Job::aged("j1", JobState::Queued, 0)).await.unwrap();

        let processor = StateProcessor::for_state(
            store.clone(),
            JobState::Queued,
            10,
            transition(|job: Job| async move {
                Err(EngineError::transition(job.id(), "counter-party unreachable"))
            }),
        );

        assert_eq!(processor.process().await, 0);
        let job = store.find_by_id("j1").await.unwrap().unwrap();
        assert_eq!(job.state_count(), 1);
        assert!(job.error_detail().unwrap().contains("counter-party unreachable"));
        assert!(store.lease("j1").await.unwrap().is_none());

        processor.process().await;
        let job = store.find_by_id("j1").await.unwrap().unwrap();
        assert_eq!(job.state_count(), 2);
        assert_eq!(job.state(), Some(JobState::Queued));
    }

    #[tokio::test]
    async fn test_panicking_transition_is_isolated() {
        let store = store();
        store.save(&Job::aged("j1", JobState::Queued, 0)).await.unwrap();
        store.save(&Job::aged("j2", JobState::Queued, 1)).await.unwrap();

        let inner = store.clone();
        let processor = StateProcessor::for_state(
            store.clone(),
            JobState::Queued,
            10,
            transition(move |mut job: Job| {
                let store = inner.clone();
                async move {
                    if job.id() == "j1" {
                        panic!("bad payload");
                    }
                    job.transition_to(JobState::Done);
                    store.save(&job).await?;
                    Ok(true)
                }
            }),
        );

        assert_eq!(processor.process().await, 1);
        let j1 = store.find_by_id("j1").await.unwrap().unwrap();
        assert_eq!(j1.state_count(), 1);
        assert!(j1.error_detail().unwrap().contains("bad payload"));
        assert_eq!(
            store.find_by_id("j2").await.unwrap().unwrap().state(),
            Some(JobState::Done)
        );
    }

    #[tokio::test]
    async fn test_declined_transition_breaks_lease() {
        let store = store();
        store.save(&Job::aged("j1", JobState::Queued, 0)).await.unwrap();

        let processor = StateProcessor::for_state(
            store.clone(),
            JobState::Queued,
            10,
            transition(|_job: Job| async { Ok(false) }),
        );

        assert_eq!(processor.process().await, 0);
        assert!(store.lease("j1").await.unwrap().is_none());
        assert_eq!(store.find_by_id("j1").await.unwrap().unwrap().state_count(), 0);
    }

    #[tokio::test]
    async fn test_guard_diverts_pending_entities() {
        let store = store();
        let mut pending = Job::aged("pending", JobState::Queued, 0);
        pending.set_pending(true);
        store.save(&pending).await.unwrap();
        store.save(&Job::aged("ready", JobState::Queued, 1)).await.unwrap();

        let guarded = Arc::new(AtomicUsize::new(0));
        let seen = guarded.clone();
        let processor = StateProcessor::new(
            "queued",
            store.clone(),
            vec![Criterion::state_is(JobState::Queued.code())],
            10,
            advance_to_running(store.clone()),
        )
        .with_guard(
            Arc::new(|job: &Job| job.is_pending()),
            transition(move |_job: Job| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(false)
                }
            }),
        );

        assert_eq!(processor.process().await, 1);
        assert_eq!(guarded.load(Ordering::SeqCst), 1);
        let pending = store.find_by_id("pending").await.unwrap().unwrap();
        assert_eq!(pending.state(), Some(JobState::Queued));
        assert!(store.lease("pending").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_custom_not_processed_callback() {
        let store = store();
        store.save(&Job::aged("j1", JobState::Queued, 0)).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let processor = StateProcessor::for_state(
            store.clone(),
            JobState::Queued,
            10,
            transition(|_job: Job| async { Ok(false) }),
        )
        .with_on_not_processed(Arc::new(move |_job: Job| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        }));

        processor.process().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Lease kept: callback did not break it.
        assert!(store.lease("j1").await.unwrap().is_some());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
