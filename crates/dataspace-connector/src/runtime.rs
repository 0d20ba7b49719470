// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable connector runtime.
//!
//! [`ConnectorRuntime`] wires the stores and managers together and owns
//! their polling loops, so a connector can run inside an existing tokio
//! application as well as from the `dataspace-connector` binary.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dataspace_connector::config::Config;
//! use dataspace_connector::runtime::{ConnectorCollaborators, ConnectorRuntime};
//!
//! let collaborators = ConnectorCollaborators {
//!     dispatcher: Some(Arc::new(my_dispatcher)),
//!     ..Default::default()
//! };
//! let runtime = ConnectorRuntime::start(Config::from_env()?, collaborators).await?;
//! // ...
//! runtime.shutdown().await?;
//! ```

use std::sync::Arc;

use anyhow::Result;
use dataspace_core::provision::ProvisionManager;
use dataspace_core::store::{InMemoryStateEntityStore, SqliteStateEntityStore};
use dataspace_core::{ManagerStatus, StateEntityStore, migrations};
use tracing::{error, info};

use crate::config::Config;
use crate::dataplane::{
    DataPlaneHealthCheck, DataPlaneInstance, DataPlaneInstanceManager, DataPlaneSelectorManager,
};
use crate::dispatcher::{RemoteMessageDispatcher, StatusChecker};
use crate::negotiation::{ContractNegotiation, ContractNegotiationManager};
use crate::transfer::{TransferCollaborators, TransferProcess, TransferProcessManager};

/// External collaborators; managers whose collaborator is missing are not started.
#[derive(Clone, Default)]
pub struct ConnectorCollaborators {
    /// Protocol message sender, required by the transfer and negotiation managers.
    pub dispatcher: Option<Arc<dyn RemoteMessageDispatcher>>,
    /// Transfer completion check.
    pub status_checker: Option<Arc<dyn StatusChecker>>,
    /// Resource provisioners for transfers.
    pub provision: ProvisionManager,
    /// Data-plane probe, required by the data-plane instance manager.
    pub health_check: Option<Arc<dyn DataPlaneHealthCheck>>,
}

struct Stores {
    transfers: Arc<dyn StateEntityStore<TransferProcess>>,
    negotiations: Arc<dyn StateEntityStore<ContractNegotiation>>,
    data_planes: Arc<dyn StateEntityStore<DataPlaneInstance>>,
}

impl Stores {
    async fn open(config: &Config) -> Result<Self> {
        let settings = config.lease_settings();
        match &config.database_url {
            Some(url) => {
                let pool = migrations::open_sqlite(url).await?;
                Ok(Self {
                    transfers: Arc::new(SqliteStateEntityStore::new(
                        pool.clone(),
                        settings.clone(),
                    )),
                    negotiations: Arc::new(SqliteStateEntityStore::new(
                        pool.clone(),
                        settings.clone(),
                    )),
                    data_planes: Arc::new(SqliteStateEntityStore::new(pool, settings)),
                })
            }
            None => Ok(Self {
                transfers: Arc::new(InMemoryStateEntityStore::new(settings.clone())),
                negotiations: Arc::new(InMemoryStateEntityStore::new(settings.clone())),
                data_planes: Arc::new(InMemoryStateEntityStore::new(settings)),
            }),
        }
    }
}

/// Running connector: managers and their polling loops.
pub struct ConnectorRuntime {
    runtime_id: String,
    data_planes: Option<DataPlaneInstanceManager>,
    negotiations: Option<ContractNegotiationManager>,
    transfers: Option<TransferProcessManager>,
    selector: DataPlaneSelectorManager,
}

impl ConnectorRuntime {
    /// Open the stores, build every manager that has its collaborators and
    /// start their polling loops.
    pub async fn start(config: Config, collaborators: ConnectorCollaborators) -> Result<Self> {
        let stores = Stores::open(&config).await?;

        let data_planes = collaborators.health_check.map(|health_check| {
            DataPlaneInstanceManager::new(&config, stores.data_planes.clone(), health_check)
        });
        let selector = DataPlaneSelectorManager::new(stores.data_planes.clone());

        let (negotiations, transfers) = match collaborators.dispatcher {
            Some(dispatcher) => {
                let negotiations = ContractNegotiationManager::new(
                    &config,
                    stores.negotiations.clone(),
                    dispatcher.clone(),
                )?;
                let transfers = TransferProcessManager::new(
                    &config,
                    stores.transfers.clone(),
                    TransferCollaborators {
                        dispatcher,
                        status_checker: collaborators.status_checker,
                        provision: collaborators.provision,
                    },
                )?;
                (Some(negotiations), Some(transfers))
            }
            None => (None, None),
        };

        if let Some(manager) = &data_planes {
            manager.start();
        }
        if let Some(manager) = &negotiations {
            manager.start();
        }
        if let Some(manager) = &transfers {
            manager.start();
        }

        info!(
            runtime_id = %config.runtime_id,
            persistent = config.database_url.is_some(),
            data_planes = data_planes.is_some(),
            negotiations = negotiations.is_some(),
            transfers = transfers.is_some(),
            "ConnectorRuntime started"
        );

        Ok(Self {
            runtime_id: config.runtime_id,
            data_planes,
            negotiations,
            transfers,
            selector,
        })
    }

    /// Lease owner id of this runtime.
    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    /// Transfer manager, if a dispatcher was supplied.
    pub fn transfers(&self) -> Option<&TransferProcessManager> {
        self.transfers.as_ref()
    }

    /// Negotiation manager, if a dispatcher was supplied.
    pub fn negotiations(&self) -> Option<&ContractNegotiationManager> {
        self.negotiations.as_ref()
    }

    /// Data-plane instance manager, if a health check was supplied.
    pub fn data_planes(&self) -> Option<&DataPlaneInstanceManager> {
        self.data_planes.as_ref()
    }

    /// Data-plane selector.
    pub fn selector(&self) -> &DataPlaneSelectorManager {
        &self.selector
    }

    /// Whether every started manager is still running.
    pub fn is_running(&self) -> bool {
        self.statuses()
            .into_iter()
            .all(|(_, status)| status == ManagerStatus::Started)
    }

    fn statuses(&self) -> Vec<(&'static str, ManagerStatus)> {
        let mut statuses = Vec::new();
        if let Some(manager) = &self.transfers {
            statuses.push(("transfer-process", manager.status()));
        }
        if let Some(manager) = &self.negotiations {
            statuses.push(("contract-negotiation", manager.status()));
        }
        if let Some(manager) = &self.data_planes {
            statuses.push(("data-plane-instance", manager.status()));
        }
        statuses
    }

    /// Stop the managers in reverse start order.
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down ConnectorRuntime");

        if let Some(manager) = &self.transfers {
            manager.shutdown().await;
        }
        if let Some(manager) = &self.negotiations {
            manager.shutdown().await;
        }
        if let Some(manager) = &self.data_planes {
            manager.shutdown().await;
        }

        let running: Vec<_> = self
            .statuses()
            .into_iter()
            .filter(|(_, status)| *status != ManagerStatus::Stopped)
            .map(|(name, _)| name)
            .collect();
        if !running.is_empty() {
            error!(managers = ?running, "Managers did not stop");
            anyhow::bail!("managers did not stop: {}", running.join(", "));
        }

        info!(runtime_id = %self.runtime_id, "ConnectorRuntime shutdown complete");
        Ok(())
    }
}
