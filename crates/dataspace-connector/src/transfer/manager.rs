// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transfer process manager.

use std::sync::Arc;

use dataspace_core::processor::{StateProcessor, TransitionFn, transition};
use dataspace_core::provision::ProvisionManager;
use dataspace_core::{
    Command, CommandHandlerRegistry, CommandProcessor, CommandQueue, ManagerStatus,
    StateEntityStore, StateMachineManager, StatefulEntity,
};
use serde_json::json;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use super::{
    AddProvisionedResourceCommand, CancelTransferCommand, CompleteTransferCommand,
    DeprovisionTransferCommand, FailTransferCommand, StartTransferCommand, TransferProcess,
    TransferProcessState, TransferProcessType, TransferRequest,
};
use crate::config::Config;
use crate::dispatcher::{MessageKind, RemoteMessage, RemoteMessageDispatcher, StatusChecker};
use crate::error::{Error, Result};
use crate::workflow::{EntityCommandHandler, bind, retry_or_fail};

type StepResult = dataspace_core::Result<bool>;

/// External collaborators of the transfer workflow.
#[derive(Clone)]
pub struct TransferCollaborators {
    /// Sends protocol messages.
    pub dispatcher: Arc<dyn RemoteMessageDispatcher>,
    /// Decides when an in-progress transfer is done; transfers wait for a
    /// completion command when unset.
    pub status_checker: Option<Arc<dyn StatusChecker>>,
    /// Resource provisioning.
    pub provision: ProvisionManager,
}

impl TransferCollaborators {
    /// Collaborators with no status checker and no provisioners.
    pub fn new(dispatcher: Arc<dyn RemoteMessageDispatcher>) -> Self {
        Self {
            dispatcher,
            status_checker: None,
            provision: ProvisionManager::new(),
        }
    }
}

struct TransferSteps {
    store: Arc<dyn StateEntityStore<TransferProcess>>,
    dispatcher: Arc<dyn RemoteMessageDispatcher>,
    status_checker: Option<Arc<dyn StatusChecker>>,
    provision: ProvisionManager,
    retry_limit: u32,
}

impl TransferSteps {
    async fn save_in(
        &self,
        mut process: TransferProcess,
        state: TransferProcessState,
    ) -> StepResult {
        process.transition_to(state);
        self.store.save(&process).await?;
        debug!(process_id = %process.id(), state = ?state, "Transfer process advanced");
        Ok(true)
    }

    async fn fail(&self, process: TransferProcess, message: impl Into<String>) -> StepResult {
        retry_or_fail(
            self.store.as_ref(),
            process,
            self.retry_limit,
            TransferProcessState::Error,
            message,
        )
        .await
    }

    async fn send(
        &self,
        process: TransferProcess,
        kind: MessageKind,
        next: TransferProcessState,
    ) -> StepResult {
        let message = RemoteMessage {
            kind,
            process_id: process.id().to_string(),
            counter_party_address: process.counter_party_address.clone(),
            protocol: process.protocol.clone(),
            payload: json!({
                "contractId": process.contract_id,
                "assetId": process.asset_id,
                "transferType": process.transfer_type,
                "dataDestination": process.data_destination,
            }),
        };
        match self.dispatcher.dispatch(message).await {
            Ok(()) => self.save_in(process, next).await,
            Err(e) => self.fail(process, e.to_string()).await,
        }
    }

    async fn on_initial(self: Arc<Self>, process: TransferProcess) -> StepResult {
        self.save_in(process, TransferProcessState::Provisioning).await
    }

    async fn on_provisioning(self: Arc<Self>, mut process: TransferProcess) -> StepResult {
        let results = self
            .provision
            .provision(process.unprovisioned_definitions())
            .await;

        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(resource) => process.add_provisioned(resource),
                Err(failure) => failures.push(failure.to_string()),
            }
        }
        if !failures.is_empty() {
            return self.fail(process, failures.join("; ")).await;
        }

        if process.is_provisioned() {
            process.set_pending(false);
            return self.save_in(process, TransferProcessState::Provisioned).await;
        }

        info!(process_id = %process.id(), "Waiting for asynchronous provisioning");
        process.set_pending(true);
        self.store.save(&process).await?;
        Ok(true)
    }

    async fn on_provisioned(self: Arc<Self>, process: TransferProcess) -> StepResult {
        match process.process_type {
            TransferProcessType::Consumer => {
                self.save_in(process, TransferProcessState::Requesting).await
            }
            TransferProcessType::Provider => {
                self.send(process, MessageKind::TransferStart, TransferProcessState::InProgress)
                    .await
            }
        }
    }

    async fn on_requesting(self: Arc<Self>, process: TransferProcess) -> StepResult {
        self.send(process, MessageKind::TransferRequest, TransferProcessState::Requested)
            .await
    }

    async fn on_in_progress(self: Arc<Self>, process: TransferProcess) -> StepResult {
        let Some(checker) = &self.status_checker else {
            return Ok(false);
        };
        match checker.is_complete(process.id(), &process.transfer_type).await {
            Ok(true) => self.save_in(process, TransferProcessState::Completed).await,
            Ok(false) => Ok(false),
            Err(e) => self.fail(process, e.to_string()).await,
        }
    }

    async fn on_completed(self: Arc<Self>, process: TransferProcess) -> StepResult {
        let next = if process.has_provisioned_resources() {
            TransferProcessState::Deprovisioning
        } else {
            TransferProcessState::Ended
        };
        self.send(process, MessageKind::TransferCompletion, next).await
    }

    async fn on_deprovisioning(self: Arc<Self>, mut process: TransferProcess) -> StepResult {
        let results = self
            .provision
            .deprovision(process.resources_to_deprovision())
            .await;

        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(resource) => process.add_deprovisioned(resource),
                Err(failure) => failures.push(failure.to_string()),
            }
        }
        if !failures.is_empty() {
            return self.fail(process, failures.join("; ")).await;
        }
        self.save_in(process, TransferProcessState::Deprovisioned).await
    }

    async fn on_deprovisioned(self: Arc<Self>, process: TransferProcess) -> StepResult {
        info!(process_id = %process.id(), "Transfer process ended");
        self.save_in(process, TransferProcessState::Ended).await
    }
}

/// Drives transfer processes from `INITIAL` to `ENDED`.
pub struct TransferProcessManager {
    store: Arc<dyn StateEntityStore<TransferProcess>>,
    queue: Arc<CommandQueue>,
    commands: Arc<CommandProcessor>,
    state_machine: StateMachineManager,
}

impl TransferProcessManager {
    /// Build the manager and register its processors and command handlers.
    pub fn new(
        config: &Config,
        store: Arc<dyn StateEntityStore<TransferProcess>>,
        collaborators: TransferCollaborators,
    ) -> Result<Self> {
        let mut registry = CommandHandlerRegistry::new();
        registry.register(EntityCommandHandler::<_, CancelTransferCommand>::new(store.clone()))?;
        registry.register(EntityCommandHandler::<_, CompleteTransferCommand>::new(store.clone()))?;
        registry.register(EntityCommandHandler::<_, FailTransferCommand>::new(store.clone()))?;
        registry.register(EntityCommandHandler::<_, DeprovisionTransferCommand>::new(
            store.clone(),
        ))?;
        registry.register(EntityCommandHandler::<_, AddProvisionedResourceCommand>::new(
            store.clone(),
        ))?;
        registry.register(EntityCommandHandler::<_, StartTransferCommand>::new(store.clone()))?;

        let queue = Arc::new(CommandQueue::new(config.command_queue_capacity));
        let commands = Arc::new(CommandProcessor::new(
            queue.clone(),
            Arc::new(registry),
            config.command_batch_size,
        ));

        let steps = Arc::new(TransferSteps {
            store: store.clone(),
            dispatcher: collaborators.dispatcher,
            status_checker: collaborators.status_checker,
            provision: collaborators.provision,
            retry_limit: config.send_retry_limit,
        });

        let batch_size = config.batch_size;
        let processor = |state: TransferProcessState, step: TransitionFn<TransferProcess>| {
            StateProcessor::for_state(store.clone(), state, batch_size, step)
        };
        let skip_pending: TransitionFn<TransferProcess> = transition(|_| async { Ok(false) });

        let mut state_machine = StateMachineManager::new(config.state_machine("transfer-process"));
        state_machine
            .register(commands.clone())
            .register(Arc::new(processor(
                TransferProcessState::Initial,
                bind(&steps, TransferSteps::on_initial),
            )))
            .register(Arc::new(
                processor(
                    TransferProcessState::Provisioning,
                    bind(&steps, TransferSteps::on_provisioning),
                )
                .with_guard(Arc::new(|p: &TransferProcess| p.is_pending()), skip_pending),
            ))
            .register(Arc::new(processor(
                TransferProcessState::Provisioned,
                bind(&steps, TransferSteps::on_provisioned),
            )))
            .register(Arc::new(processor(
                TransferProcessState::Requesting,
                bind(&steps, TransferSteps::on_requesting),
            )))
            .register(Arc::new(processor(
                TransferProcessState::InProgress,
                bind(&steps, TransferSteps::on_in_progress),
            )))
            .register(Arc::new(processor(
                TransferProcessState::Completed,
                bind(&steps, TransferSteps::on_completed),
            )))
            .register(Arc::new(processor(
                TransferProcessState::Deprovisioning,
                bind(&steps, TransferSteps::on_deprovisioning),
            )))
            .register(Arc::new(processor(
                TransferProcessState::Deprovisioned,
                bind(&steps, TransferSteps::on_deprovisioned),
            )));

        Ok(Self {
            store,
            queue,
            commands,
            state_machine,
        })
    }

    /// Create a consumer process for `request` and return its id.
    pub async fn initiate_consumer_request(&self, request: TransferRequest) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.create(id, TransferProcessType::Consumer, request).await
    }

    /// Create a provider process for a request received from the consumer
    /// with process id `id`.
    pub async fn initiate_provider_process(
        &self,
        id: impl Into<String>,
        request: TransferRequest,
    ) -> Result<String> {
        self.create(id.into(), TransferProcessType::Provider, request)
            .await
    }

    async fn create(
        &self,
        id: String,
        process_type: TransferProcessType,
        request: TransferRequest,
    ) -> Result<String> {
        Url::parse(&request.counter_party_address).map_err(|e| {
            Error::InvalidRequest(format!(
                "invalid counter-party address '{}': {e}",
                request.counter_party_address
            ))
        })?;
        let process = TransferProcess::new(id.clone(), process_type, request);
        self.store.create(&process).await?;
        info!(
            process_id = %id,
            process_type = process_type.as_str(),
            asset_id = %process.asset_id,
            "Transfer process initiated"
        );
        Ok(id)
    }

    /// Queue a command for one of this manager's processes.
    pub fn enqueue<C: Command>(&self, command: C) -> Result<()> {
        Ok(self.queue.enqueue(command)?)
    }

    /// Current state of process `id`.
    pub async fn find(&self, id: &str) -> Result<Option<TransferProcess>> {
        Ok(self.store.find_by_id(id).await?)
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<dyn StateEntityStore<TransferProcess>> {
        &self.store
    }

    /// Commands applied since start.
    pub fn commands_applied(&self) -> u64 {
        self.commands.applied()
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
