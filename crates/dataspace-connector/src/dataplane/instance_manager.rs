// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Data-plane health tracking.

use std::sync::Arc;
use std::time::Duration;

use dataspace_core::entity::now_millis;
use dataspace_core::processor::{FilterFn, StateProcessor};
use dataspace_core::query::SortOrder;
use dataspace_core::{
    Criterion, EntityState, ManagerStatus, Operator, QuerySpec, StateEntityStore,
    StateMachineManager, StatefulEntity,
};
use tracing::{debug, info, warn};

use super::{DataPlaneHealthCheck, DataPlaneInstance, DataPlaneInstanceState};
use crate::config::Config;
use crate::error::Result;
use crate::workflow::bind;

struct HealthSteps {
    store: Arc<dyn StateEntityStore<DataPlaneInstance>>,
    health_check: Arc<dyn DataPlaneHealthCheck>,
}

impl HealthSteps {
    async fn probe(
        self: Arc<Self>,
        mut instance: DataPlaneInstance,
    ) -> dataspace_core::Result<bool> {
        let outcome = self.health_check.check(&instance).await;
        let next = match &outcome {
            Ok(()) => DataPlaneInstanceState::Available,
            Err(_) => DataPlaneInstanceState::Unavailable,
        };

        if instance.state() == Some(next) {
            // Unchanged health is not a retry of the state.
            let now = now_millis();
            instance.meta.state_timestamp = now;
            instance.meta.updated_at = now;
        } else {
            info!(
                instance_id = %instance.id(),
                url = %instance.url,
                from = ?instance.state(),
                to = ?next,
                "Data plane health changed"
            );
            instance.transition_to(next);
        }

        match outcome {
            Ok(()) => instance.meta.error_detail = None,
            Err(e) => {
                warn!(instance_id = %instance.id(), error = %e, "Data plane probe failed");
                instance.meta.error_detail = Some(e.to_string());
            }
        }

        self.store.save(&instance).await?;
        debug!(instance_id = %instance.id(), state = ?next, "Data plane probed");
        Ok(true)
    }
}

/// Probes registered data planes and keeps their availability current.
pub struct DataPlaneInstanceManager {
    store: Arc<dyn StateEntityStore<DataPlaneInstance>>,
    state_machine: StateMachineManager,
}

impl DataPlaneInstanceManager {
    /// Build the manager; known instances are re-probed every
    /// `config.dataplane_recheck_interval`.
    pub fn new(
        config: &Config,
        store: Arc<dyn StateEntityStore<DataPlaneInstance>>,
        health_check: Arc<dyn DataPlaneHealthCheck>,
    ) -> Self {
        let steps = Arc::new(HealthSteps {
            store: store.clone(),
            health_check,
        });

        let recheck = config.dataplane_recheck_interval;
        let stale: FilterFn = Arc::new(move || stale_instances(recheck));

        let mut state_machine =
            StateMachineManager::new(config.state_machine("data-plane-instance"));
        state_machine
            .register(Arc::new(StateProcessor::for_state(
                store.clone(),
                DataPlaneInstanceState::Registered,
                config.batch_size,
                bind(&steps, HealthSteps::probe),
            )))
            .register(Arc::new(StateProcessor::dynamic(
                "data_plane_instance:recheck",
                store.clone(),
                stale,
                config.batch_size,
                bind(&steps, HealthSteps::probe),
            )));

        Self {
            store,
            state_machine,
        }
    }

    /// Register a new instance; it is probed on the next tick.
    pub async fn register(&self, instance: DataPlaneInstance) -> Result<()> {
        self.store.create(&instance).await?;
        info!(instance_id = %instance.id(), url = %instance.url, "Data plane registered");
        Ok(())
    }

    /// Remove an instance that is not being probed right now.
    pub async fn unregister(&self, id: &str) -> Result<()> {
        self.store.delete(id).await?;
        info!(instance_id = %id, "Data plane unregistered");
        Ok(())
    }

    /// Instance `id`, if registered.
    pub async fn find(&self, id: &str) -> Result<Option<DataPlaneInstance>> {
        Ok(self.store.find_by_id(id).await?)
    }

    /// Instances in `state`, oldest state change first.
    pub async fn instances_in(
        &self,
        state: DataPlaneInstanceState,
    ) -> Result<Vec<DataPlaneInstance>> {
        let spec = QuerySpec::new()
            .filter(Criterion::state_is(state.code()))
            .sort("stateTimestamp", SortOrder::Asc);
        Ok(self.store.query(&spec).await?)
    }

    /// Run every processor once.
    pub async fn tick(&self) -> usize {
        self.state_machine.tick().await
    }

    /// Start the polling loop.
    pub fn start(&self) {
        self.state_machine.start();
    }

    /// Stop the polling loop.
    pub async fn shutdown(&self) {
        self.state_machine.shutdown().await;
    }

    /// Lifecycle status of the polling loop.
    pub fn status(&self) -> ManagerStatus {
        self.state_machine.status()
    }
}

fn stale_instances(recheck: Duration) -> Vec<Criterion> {
    let recheck = i64::try_from(recheck.as_millis()).unwrap_or(i64::MAX);
    let threshold = now_millis().timestamp_millis().saturating_sub(recheck);
    vec![
        Criterion::state_in(&[
            DataPlaneInstanceState::Available.code(),
            DataPlaneInstanceState::Unavailable.code(),
        ]),
        Criterion::new("stateTimestamp", Operator::Lt, threshold),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use async_trait::async_trait;
    use dataspace_core::LeaseSettings;
    use dataspace_core::store::InMemoryStateEntityStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Reports instances whose URL contains `down` as unreachable while
    /// `outage` is set.
    #[derive(Default)]
    struct Scripted {
        outage: AtomicBool,
        probes: AtomicUsize,
    }

    #[async_trait]
    impl DataPlaneHealthCheck for Scripted {
        async fn check(&self, instance: &DataPlaneInstance) -> Result<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.outage.load(Ordering::SeqCst) && instance.url.contains("down") {
                return Err(Error::Unreachable {
                    url: instance.url.clone(),
                    message: "connection refused".to_string(),
                });
            }
            Ok(())
        }
    }

    fn manager(health: Arc<Scripted>) -> DataPlaneInstanceManager {
        let config = Config {
            dataplane_recheck_interval: Duration::from_millis(50),
            ..Config::default()
        };
        let store = Arc::new(InMemoryStateEntityStore::new(LeaseSettings::new("connector-a")));
        DataPlaneInstanceManager::new(&config, store, health)
    }

    #[tokio::test]
    async fn test_probe_and_recheck() {
        let health = Arc::new(Scripted::default());
        health.outage.store(true, Ordering::SeqCst);
        let manager = manager(health.clone());
        manager
            .register(DataPlaneInstance::new("dp-1", "http://up:8080"))
            .await
            .unwrap();
        manager
            .register(DataPlaneInstance::new("dp-2", "http://down:8080"))
            .await
            .unwrap();

        manager.tick().await;
        let up = manager.find("dp-1").await.unwrap().unwrap();
        let down = manager.find("dp-2").await.unwrap().unwrap();
        assert_eq!(up.state(), Some(DataPlaneInstanceState::Available));
        assert_eq!(down.state(), Some(DataPlaneInstanceState::Unavailable));
        assert!(down.error_detail().is_some_and(|e| e.contains("connection refused")));
        assert_eq!(health.probes.load(Ordering::SeqCst), 2);

        // Fresh results are not probed again.
        manager.tick().await;
        assert_eq!(health.probes.load(Ordering::SeqCst), 2);

        health.outage.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;
        manager.tick().await;

        let rechecked = manager.find("dp-1").await.unwrap().unwrap();
        assert_eq!(rechecked.state(), Some(DataPlaneInstanceState::Available));
        assert_eq!(rechecked.state_count(), 0);
        assert!(rechecked.state_timestamp() > up.state_timestamp());

        let recovered = manager.find("dp-2").await.unwrap().unwrap();
        assert_eq!(recovered.state(), Some(DataPlaneInstanceState::Available));
        assert_eq!(recovered.error_detail(), None);
        assert_eq!(
            manager
                .instances_in(DataPlaneInstanceState::Available)
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn test_recheck_threshold_saturates() {
        let criteria = stale_instances(Duration::MAX);
        let threshold = criteria[1].operand_right.as_i64().unwrap();
        assert!(threshold < 0);

        let criteria = stale_instances(Duration::from_secs(60));
        let threshold = criteria[1].operand_right.as_i64().unwrap();
        assert!(threshold > 0);
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates() {
        let manager = manager(Arc::new(Scripted::default()));
        let instance = DataPlaneInstance::new("dp-1", "http://up:8080");
        manager.register(instance.clone()).await.unwrap();
        let err = manager.register(instance).await.unwrap_err();
        assert_eq!(err.error_code(), "ALREADY_EXISTS");

        manager.unregister("dp-1").await.unwrap();
        assert!(manager.find("dp-1").await.unwrap().is_none());
    }
}
