// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Data-plane selection.

use std::collections::HashMap;
use std::sync::Arc;

use dataspace_core::query::SortOrder;
use dataspace_core::{Criterion, EntityState, Operator, QuerySpec, StateEntityStore};
use rand::seq::SliceRandom;
use tracing::debug;

use super::{DataPlaneInstance, DataPlaneInstanceState};
use crate::error::{Error, Result};

/// Name of the [`RandomStrategy`].
pub const RANDOM: &str = "random";

/// Name of the [`FirstStrategy`].
pub const FIRST: &str = "first";

const MAX_CANDIDATES: usize = 1000;

/// Picks one data plane out of the suitable candidates.
pub trait SelectionStrategy: Send + Sync {
    /// Registry key.
    fn name(&self) -> &str;

    /// Chosen instance, `None` when `candidates` is empty.
    fn apply<'a>(&self, candidates: &'a [DataPlaneInstance]) -> Option<&'a DataPlaneInstance>;
}

/// Uniformly random choice.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomStrategy;

impl SelectionStrategy for RandomStrategy {
    fn name(&self) -> &str {
        RANDOM
    }

    fn apply<'a>(&self, candidates: &'a [DataPlaneInstance]) -> Option<&'a DataPlaneInstance> {
        candidates.choose(&mut rand::thread_rng())
    }
}

/// First candidate in id order.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstStrategy;

impl SelectionStrategy for FirstStrategy {
    fn name(&self) -> &str {
        FIRST
    }

    fn apply<'a>(&self, candidates: &'a [DataPlaneInstance]) -> Option<&'a DataPlaneInstance> {
        candidates.first()
    }
}

/// Selection strategies by name.
pub struct SelectionStrategyRegistry {
    strategies: HashMap<String, Arc<dyn SelectionStrategy>>,
}

impl SelectionStrategyRegistry {
    /// Registry without any strategy.
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Add `strategy`; a second strategy with the same name is rejected.
    pub fn register(&mut self, strategy: Arc<dyn SelectionStrategy>) -> Result<()> {
        let name = strategy.name().to_string();
        if self.strategies.contains_key(&name) {
            return Err(Error::DuplicateStrategy(name));
        }
        self.strategies.insert(name, strategy);
        Ok(())
    }

    /// Strategy registered as `name`.
    pub fn get(&self, name: &str) -> Result<Arc<dyn SelectionStrategy>> {
        self.strategies
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownStrategy(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.strategies.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for SelectionStrategyRegistry {
    /// Registry holding `random` and `first`.
    fn default() -> Self {
        let mut strategies: HashMap<String, Arc<dyn SelectionStrategy>> = HashMap::new();
        strategies.insert(RANDOM.to_string(), Arc::new(RandomStrategy));
        strategies.insert(FIRST.to_string(), Arc::new(FirstStrategy));
        Self { strategies }
    }
}

/// Chooses an AVAILABLE data plane for a transfer.
pub struct DataPlaneSelectorManager {
    store: Arc<dyn StateEntityStore<DataPlaneInstance>>,
    strategies: SelectionStrategyRegistry,
}

impl DataPlaneSelectorManager {
    /// Selector over `store` with the default strategies.
    pub fn new(store: Arc<dyn StateEntityStore<DataPlaneInstance>>) -> Self {
        Self::with_strategies(store, SelectionStrategyRegistry::default())
    }

    /// Selector with a custom strategy registry.
    pub fn with_strategies(
        store: Arc<dyn StateEntityStore<DataPlaneInstance>>,
        strategies: SelectionStrategyRegistry,
    ) -> Self {
        Self { store, strategies }
    }

    /// Strategies known to this selector.
    pub fn strategies(&self) -> &SelectionStrategyRegistry {
        &self.strategies
    }

    /// Every AVAILABLE instance that can serve `source_type` with
    /// `transfer_type`, in id order.
    pub async fn candidates(
        &self,
        source_type: &str,
        transfer_type: &str,
    ) -> Result<Vec<DataPlaneInstance>> {
        let spec = QuerySpec::new()
            .filter(Criterion::state_is(DataPlaneInstanceState::Available.code()))
            .filter(Criterion::new("allowedSourceTypes", Operator::Contains, source_type))
            .filter(Criterion::new("allowedTransferTypes", Operator::Contains, transfer_type))
            .sort("id", SortOrder::Asc)
            .limit(MAX_CANDIDATES);
        Ok(self.store.query(&spec).await?)
    }

    /// Pick an instance with `strategy` (default `random`).
    pub async fn select(
        &self,
        source_type: &str,
        transfer_type: &str,
        strategy: Option<&str>,
    ) -> Result<DataPlaneInstance> {
        let strategy = self.strategies.get(strategy.unwrap_or(RANDOM))?;
        let candidates = self.candidates(source_type, transfer_type).await?;
        let selected = strategy
            .apply(&candidates)
            .cloned()
            .ok_or_else(|| Error::NoDataPlane {
                source_type: source_type.to_string(),
                transfer_type: transfer_type.to_string(),
            })?;
        debug!(
            instance_id = %selected.meta.id,
            strategy = strategy.name(),
            candidates = candidates.len(),
            "Data plane selected"
        );
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataspace_core::{LeaseSettings, StatefulEntity};
    use dataspace_core::store::InMemoryStateEntityStore;

    async fn selector() -> DataPlaneSelectorManager {
        let store = Arc::new(InMemoryStateEntityStore::new(LeaseSettings::new("connector-a")));
        for (id, state, transfer_type) in [
            ("dp-b", DataPlaneInstanceState::Available, "HttpData-PULL"),
            ("dp-a", DataPlaneInstanceState::Available, "HttpData-PULL"),
            ("dp-c", DataPlaneInstanceState::Unavailable, "HttpData-PULL"),
            ("dp-d", DataPlaneInstanceState::Available, "AmazonS3-PUSH"),
        ] {
            let mut instance = DataPlaneInstance::new(id, format!("http://{id}:8080"))
                .with_source_type("HttpData")
                .with_transfer_type(transfer_type);
            instance.transition_to(state);
            store.save(&instance).await.unwrap();
        }
        DataPlaneSelectorManager::new(store)
    }

    #[tokio::test]
    async fn test_first_strategy_is_deterministic() {
        let selector = selector().await;
        let selected = selector
            .select("HttpData", "HttpData-PULL", Some(FIRST))
            .await
            .unwrap();
        assert_eq!(selected.meta.id, "dp-a");
    }

    #[tokio::test]
    async fn test_random_strategy_only_picks_candidates() {
        let selector = selector().await;
        for _ in 0..20 {
            let selected = selector.select("HttpData", "HttpData-PULL", None).await.unwrap();
            assert!(["dp-a", "dp-b"].contains(&selected.meta.id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_no_candidate_and_unknown_strategy() {
        let selector = selector().await;
        let err = selector
            .select("AmazonS3", "HttpData-PULL", None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "NO_DATA_PLANE");

        let err = selector
            .select("HttpData", "HttpData-PULL", Some("round-robin"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "UNKNOWN_STRATEGY");
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = SelectionStrategyRegistry::default();
        assert_eq!(registry.names(), vec![FIRST, RANDOM]);
        let err = registry.register(Arc::new(FirstStrategy)).unwrap_err();
        assert_eq!(err.error_code(), "DUPLICATE_STRATEGY");

        let mut empty = SelectionStrategyRegistry::empty();
        empty.register(Arc::new(RandomStrategy)).unwrap();
        assert!(empty.get(FIRST).is_err());
    }
}
