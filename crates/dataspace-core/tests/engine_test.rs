// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests of the engine: state machine, processors, commands and
//! both leasing stores working together.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use dataspace_core::command::apply_to_entity;
use dataspace_core::processor::transition;
use dataspace_core::store::{InMemoryStateEntityStore, SqliteStateEntityStore};
use dataspace_core::{
    Command, CommandHandler, CommandHandlerRegistry, CommandProcessor, CommandQueue, EngineError,
    EntityMeta, EntityState, LeaseSettings, Processor, Result, StateEntityStore,
    StateMachineConfig, StateMachineManager, StateProcessor, StatefulEntity, migrations,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrderState {
    Received,
    Shipped,
    Cancelled,
}

impl EntityState for OrderState {
    fn code(self) -> i32 {
        match self {
            Self::Received => 100,
            Self::Shipped => 200,
            Self::Cancelled => 300,
        }
    }

    fn from_code(code: i32) -> Option<Self> {
        match code {
            100 => Some(Self::Received),
            200 => Some(Self::Shipped),
            300 => Some(Self::Cancelled),
            _ => None,
        }
    }

    fn is_terminal(self) -> bool {
        !matches!(self, Self::Received)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Order {
    #[serde(flatten)]
    meta: EntityMeta,
    customer: String,
}

impl StatefulEntity for Order {
    type State = OrderState;
    const ENTITY_TYPE: &'static str = "order";

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

fn order(id: &str, offset_ms: i64) -> Order {
    let base = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
    Order {
        meta: EntityMeta::new(id, OrderState::Received.code())
            .with_state_timestamp(base + chrono::Duration::milliseconds(offset_ms)),
        customer: "acme".to_string(),
    }
}

fn config(name: &str) -> StateMachineConfig {
    StateMachineConfig {
        name: name.to_string(),
        iteration_wait: Duration::from_millis(5),
        shutdown_timeout: Duration::from_secs(2),
    }
}

/// Processor shipping received orders and recording who shipped what.
fn shipping(
    store: Arc<dyn StateEntityStore<Order>>,
    shipped_by: Arc<Mutex<Vec<(String, String)>>>,
) -> StateProcessor<Order> {
    let inner = store.clone();
    StateProcessor::for_state(
        store,
        OrderState::Received,
        3,
        transition(move |mut order: Order| {
            let store = inner.clone();
            let shipped_by = shipped_by.clone();
            async move {
                tokio::task::yield_now().await;
                shipped_by
                    .lock()
                    .await
                    .push((order.id().to_string(), store.lease_holder().to_string()));
                order.transition_to(OrderState::Shipped);
                store.save(&order).await?;
                Ok(true)
            }
        }),
    )
}

async fn run_two_managers(
    a: Arc<dyn StateEntityStore<Order>>,
    b: Arc<dyn StateEntityStore<Order>>,
) {
    for i in 0..30 {
        a.save(&order(&format!("o{i:02}"), i)).await.unwrap();
    }

    let shipped = Arc::new(Mutex::new(Vec::new()));
    let mut first = StateMachineManager::new(config("a"));
    first.register(Arc::new(shipping(a.clone(), shipped.clone())));
    let mut second = StateMachineManager::new(config("b"));
    second.register(Arc::new(shipping(b.clone(), shipped.clone())));

    first.start();
    second.start();
    for _ in 0..200 {
        if shipped.lock().await.len() >= 30 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    first.shutdown().await;
    second.shutdown().await;

    let shipped = shipped.lock().await;
    let unique: HashSet<_> = shipped.iter().map(|(id, _)| id.clone()).collect();
    assert_eq!(shipped.len(), 30, "every order shipped exactly once");
    assert_eq!(unique.len(), 30);
    for i in 0..30 {
        let stored = a.find_by_id(&format!("o{i:02}")).await.unwrap().unwrap();
        assert_eq!(stored.state(), Some(OrderState::Shipped));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_runtimes_share_in_memory_store() {
    let a = InMemoryStateEntityStore::new(LeaseSettings::new("runtime-a"));
    let b = a.with_holder("runtime-b");
    run_two_managers(Arc::new(a), Arc::new(b)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_runtimes_share_sqlite_file() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("orders.db").display());
    let a = SqliteStateEntityStore::new(
        migrations::open_sqlite(&url).await.unwrap(),
        LeaseSettings::new("runtime-a"),
    );
    let b = SqliteStateEntityStore::new(
        migrations::open_sqlite(&url).await.unwrap(),
        LeaseSettings::new("runtime-b"),
    );
    run_two_managers(Arc::new(a), Arc::new(b)).await;
}

#[tokio::test]
async fn test_failed_transition_is_retried_next_tick() {
    let store = Arc::new(InMemoryStateEntityStore::new(LeaseSettings::new("runtime-a")));
    store.save(&order("e1", 0)).await.unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = attempts.clone();
    let mut manager = StateMachineManager::new(config("retry"));
    manager.register(Arc::new(StateProcessor::for_state(
        store.clone(),
        OrderState::Received,
        1,
        transition(move |order: Order| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::transition(order.id(), "carrier offline"))
            }
        }),
    )));

    assert_eq!(manager.tick().await, 0);
    let e1 = store.find_by_id("e1").await.unwrap().unwrap();
    assert_eq!(e1.state_count(), 1);
    assert!(store.lease("e1").await.unwrap().is_none());

    manager.tick().await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(store.find_by_id("e1").await.unwrap().unwrap().state_count(), 2);
}

#[derive(Debug)]
struct CancelOrder {
    order_id: String,
}

impl Command for CancelOrder {
    fn entity_id(&self) -> &str {
        &self.order_id
    }

    fn can_retry(&self) -> bool {
        true
    }
}

struct CancelOrderHandler {
    store: Arc<dyn StateEntityStore<Order>>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl CommandHandler for CancelOrderHandler {
    type Command = CancelOrder;

    async fn handle(&self, command: &CancelOrder) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        apply_to_entity(self.store.as_ref(), &command.order_id, |order: &mut Order| {
            order.transition_to(OrderState::Cancelled);
            Ok(true)
        })
        .await
        .map(|_| ())
    }
}

#[tokio::test]
async fn test_command_waits_for_lease_held_by_polling_loop() {
    let store = InMemoryStateEntityStore::new(LeaseSettings::new("runtime-a"));
    store.save(&order("o1", 0)).await.unwrap();
    let poller = store.with_holder("poller");
    let held = poller.next_not_leased(1, &[]).await.unwrap().remove(0);

    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = CommandHandlerRegistry::new();
    registry
        .register(CancelOrderHandler {
            store: Arc::new(store.clone()),
            calls: calls.clone(),
        })
        .unwrap();
    let queue = Arc::new(CommandQueue::new(10));
    let commands = CommandProcessor::new(queue.clone(), Arc::new(registry), 5);
    queue
        .enqueue(CancelOrder {
            order_id: "o1".to_string(),
        })
        .unwrap();

    assert_eq!(commands.process().await, 0);
    assert_eq!(queue.len(), 1, "leased entity: command re-enqueued");

    poller.break_lease(&held).await.unwrap();
    assert_eq!(commands.process().await, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(queue.is_empty());
    assert_eq!(
        store.find_by_id("o1").await.unwrap().unwrap().state(),
        Some(OrderState::Cancelled)
    );
}

#[tokio::test]
async fn test_commands_drained_by_running_manager() {
    let store = InMemoryStateEntityStore::new(LeaseSettings::new("runtime-a"));
    for i in 0..3 {
        store.save(&order(&format!("o{i}"), i)).await.unwrap();
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = CommandHandlerRegistry::new();
    registry
        .register(CancelOrderHandler {
            store: Arc::new(store.clone()),
            calls: calls.clone(),
        })
        .unwrap();
    let queue = Arc::new(CommandQueue::new(10));
    let commands = Arc::new(CommandProcessor::new(queue.clone(), Arc::new(registry), 2));

    let mut manager = StateMachineManager::new(config("commands"));
    manager.register(commands.clone());
    manager.start();
    for i in 0..3 {
        queue
            .enqueue(CancelOrder {
                order_id: format!("o{i}"),
            })
            .unwrap();
    }

    for _ in 0..100 {
        if commands.applied() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    manager.shutdown().await;

    assert_eq!(commands.applied(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(manager.metrics().processed >= 3);
}
