// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory reference implementation of the leasing store.
//!
//! Entities and leases live behind one `tokio::sync::RwLock`, which queues
//! waiters in FIFO order so lease acquisition cannot be starved by readers.
//! Several store handles with different lease holders can share the same
//! backing data (see [`InMemoryStateEntityStore::with_holder`]), which models
//! multiple connector runtimes on one database.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::entity::StatefulEntity;
use crate::error::{EngineError, Result};
use crate::lease::{Lease, LeaseSettings};
use crate::query::{Criterion, QuerySpec, all_match};

use super::StateEntityStore;

struct Shared<E> {
    entities: HashMap<String, E>,
    leases: HashMap<String, Lease>,
}

impl<E> Shared<E> {
    /// Lease held by someone other than `holder` that is still valid.
    fn foreign_lease(&self, id: &str, holder: &str) -> Option<&Lease> {
        self.leases
            .get(id)
            .filter(|lease| !lease.is_held_by(holder) && !lease.is_expired())
    }

    fn valid_lease(&self, id: &str) -> Option<&Lease> {
        self.leases.get(id).filter(|lease| !lease.is_expired())
    }
}

/// Leasing store backed by process memory.
pub struct InMemoryStateEntityStore<E> {
    data: Arc<RwLock<Shared<E>>>,
    settings: LeaseSettings,
}

impl<E> Clone for InMemoryStateEntityStore<E> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<E: StatefulEntity> InMemoryStateEntityStore<E> {
    /// Create an empty store leasing as `settings.holder`.
    pub fn new(settings: LeaseSettings) -> Self {
        Self {
            data: Arc::new(RwLock::new(Shared {
                entities: HashMap::new(),
                leases: HashMap::new(),
            })),
            settings,
        }
    }

    /// Handle on the same backing data that leases as `holder`.
    pub fn with_holder(&self, holder: impl Into<String>) -> Self {
        Self {
            data: self.data.clone(),
            settings: LeaseSettings {
                holder: holder.into(),
                duration: self.settings.duration,
            },
        }
    }

    /// Number of stored entities.
    pub async fn len(&self) -> usize {
        self.data.read().await.entities.len()
    }

    /// Whether the store holds no entities.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn conflict(&self, id: &str, lease: &Lease) -> EngineError {
        EngineError::LeaseConflict {
            entity_id: id.to_string(),
            leased_by: lease.leased_by.clone(),
        }
    }
}

#[async_trait]
impl<E: StatefulEntity> StateEntityStore<E> for InMemoryStateEntityStore<E> {
    fn lease_holder(&self) -> &str {
        &self.settings.holder
    }

    async fn next_not_leased(&self, limit: usize, filter: &[Criterion]) -> Result<Vec<E>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut data = self.data.write().await;

        let mut candidates = Vec::new();
        for (id, entity) in &data.entities {
            if data.valid_lease(id).is_some() {
                continue;
            }
            let document = serde_json::to_value(entity)?;
            if all_match(filter, &document) {
                candidates.push((entity.state_timestamp(), id.clone()));
            }
        }
        candidates.sort();
        candidates.truncate(limit);

        let mut leased = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            data.leases.insert(id.clone(), self.settings.acquire());
            if let Some(entity) = data.entities.get(&id) {
                leased.push(entity.clone());
            }
        }

        if !leased.is_empty() {
            debug!(
                entity_type = E::ENTITY_TYPE,
                holder = %self.settings.holder,
                count = leased.len(),
                "Leased entities"
            );
        }

        Ok(leased)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<E>> {
        Ok(self.data.read().await.entities.get(id).cloned())
    }

    async fn find_by_id_and_lease(&self, id: &str) -> Result<E> {
        let mut data = self.data.write().await;
        let entity = data
            .entities
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound {
                entity_id: id.to_string(),
            })?;
        if let Some(lease) = data.foreign_lease(id, &self.settings.holder) {
            return Err(EngineError::AlreadyLeased {
                entity_id: id.to_string(),
                leased_by: lease.leased_by.clone(),
            });
        }
        data.leases.insert(id.to_string(), self.settings.acquire());
        Ok(entity)
    }

    async fn create(&self, entity: &E) -> Result<()> {
        let id = entity.id().to_string();
        let mut data = self.data.write().await;
        if data.entities.contains_key(&id) {
            return Err(EngineError::AlreadyExists { entity_id: id });
        }
        data.leases.remove(&id);
        data.entities.insert(id, entity.clone());
        Ok(())
    }

    async fn save(&self, entity: &E) -> Result<()> {
        let id = entity.id().to_string();
        let mut data = self.data.write().await;

        if data.entities.contains_key(&id) {
            match data.leases.get(&id) {
                Some(lease) if lease.is_valid_for(&self.settings.holder) => {}
                Some(lease) => return Err(self.conflict(&id, lease)),
                None => {
                    return Err(EngineError::LeaseConflict {
                        entity_id: id,
                        leased_by: String::new(),
                    });
                }
            }
        }

        data.entities.insert(id.clone(), entity.clone());
        data.leases.remove(&id);
        Ok(())
    }

    async fn renew_lease(&self, entity: &E) -> Result<()> {
        let mut data = self.data.write().await;
        let holder = self.settings.holder.clone();
        match data.leases.get_mut(entity.id()) {
            Some(lease) if lease.is_valid_for(&holder) => {
                lease.renew();
                Ok(())
            }
            Some(lease) => Err(EngineError::LeaseConflict {
                entity_id: entity.id().to_string(),
                leased_by: lease.leased_by.clone(),
            }),
            None => Err(EngineError::LeaseConflict {
                entity_id: entity.id().to_string(),
                leased_by: String::new(),
            }),
        }
    }

    async fn break_lease(&self, entity: &E) -> Result<()> {
        let id = entity.id();
        let mut data = self.data.write().await;
        if !data.entities.contains_key(id) {
            return Err(EngineError::NotFound {
                entity_id: id.to_string(),
            });
        }
        if let Some(lease) = data.foreign_lease(id, &self.settings.holder) {
            return Err(self.conflict(id, lease));
        }
        data.leases.remove(id);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut data = self.data.write().await;
        if !data.entities.contains_key(id) {
            return Err(EngineError::NotFound {
                entity_id: id.to_string(),
            });
        }
        if let Some(lease) = data.foreign_lease(id, &self.settings.holder) {
            return Err(EngineError::AlreadyLeased {
                entity_id: id.to_string(),
                leased_by: lease.leased_by.clone(),
            });
        }
        data.entities.remove(id);
        data.leases.remove(id);
        Ok(())
    }

    async fn query(&self, spec: &QuerySpec) -> Result<Vec<E>> {
        let data = self.data.read().await;

        let mut matching = Vec::new();
        for entity in data.entities.values() {
            let document = serde_json::to_value(entity)?;
            if spec.matches(&document) {
                matching.push((document, entity));
            }
        }
        // Stable natural order: oldest state change first.
        matching.sort_by(|(a_doc, a), (b_doc, b)| {
            spec.compare(a_doc, b_doc)
                .then_with(|| a.state_timestamp().cmp(&b.state_timestamp()))
                .then_with(|| a.id().cmp(b.id()))
        });

        Ok(matching
            .into_iter()
            .skip(spec.offset)
            .take(spec.limit)
            .map(|(_, entity)| entity.clone())
            .collect())
    }

    async fn lease(&self, id: &str) -> Result<Option<Lease>> {
        Ok(self.data.read().await.valid_lease(id).cloned())
    }
}
