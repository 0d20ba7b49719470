// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Contract negotiation manager.

use std::sync::Arc;

use dataspace_core::entity::now_millis;
use dataspace_core::processor::{StateProcessor, TransitionFn};
use dataspace_core::{
    Command, CommandHandlerRegistry, CommandProcessor, CommandQueue, Criterion, EntityState,
    ManagerStatus, StateEntityStore, StateMachineManager, StatefulEntity,
};
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use super::{
    ContractAgreedCommand, ContractAgreement, ContractNegotiation, ContractNegotiationState,
    ContractOffer, NegotiationType, TerminateNegotiationCommand,
};
use crate::config::Config;
use crate::dispatcher::{MessageKind, RemoteMessage, RemoteMessageDispatcher};
use crate::error::Result;
use crate::workflow::{EntityCommandHandler, bind, retry_or_fail};

type StepResult = dataspace_core::Result<bool>;

struct NegotiationSteps {
    store: Arc<dyn StateEntityStore<ContractNegotiation>>,
    dispatcher: Arc<dyn RemoteMessageDispatcher>,
    retry_limit: u32,
}

impl NegotiationSteps {
    async fn save_in(
        &self,
        mut negotiation: ContractNegotiation,
        state: ContractNegotiationState,
    ) -> StepResult {
        negotiation.transition_to(state);
        self.store.save(&negotiation).await?;
        info!(
            negotiation_id = %negotiation.id(),
            negotiation_type = negotiation.negotiation_type.as_str(),
            state = ?state,
            "Negotiation advanced"
        );
        Ok(true)
    }

    async fn send(
        &self,
        negotiation: ContractNegotiation,
        kind: MessageKind,
        payload: Value,
        next: ContractNegotiationState,
    ) -> StepResult {
        let message = RemoteMessage {
            kind,
            process_id: negotiation.id().to_string(),
            counter_party_address: negotiation.counter_party_address.clone(),
            protocol: negotiation.protocol.clone(),
            payload,
        };
        match self.dispatcher.dispatch(message).await {
            Ok(()) => self.save_in(negotiation, next).await,
            Err(e) => {
                retry_or_fail(
                    self.store.as_ref(),
                    negotiation,
                    self.retry_limit,
                    ContractNegotiationState::Terminated,
                    e.to_string(),
                )
                .await
            }
        }
    }

    async fn on_initial(self: Arc<Self>, negotiation: ContractNegotiation) -> StepResult {
        self.save_in(negotiation, ContractNegotiationState::Requesting)
            .await
    }

    async fn on_requesting(self: Arc<Self>, negotiation: ContractNegotiation) -> StepResult {
        let payload = json!({
            "offer": negotiation.offer,
            "counterPartyId": negotiation.counter_party_id,
        });
        self.send(
            negotiation,
            MessageKind::ContractRequest,
            payload,
            ContractNegotiationState::Requested,
        )
        .await
    }

    async fn on_requested(self: Arc<Self>, negotiation: ContractNegotiation) -> StepResult {
        self.save_in(negotiation, ContractNegotiationState::Agreeing)
            .await
    }

    async fn on_agreeing(self: Arc<Self>, mut negotiation: ContractNegotiation) -> StepResult {
        let agreement = ContractAgreement {
            id: Uuid::new_v4().to_string(),
            asset_id: negotiation.offer.asset_id.clone(),
            signing_date: now_millis(),
            policy: negotiation.offer.policy.clone(),
        };
        let payload = json!({ "agreement": agreement });
        negotiation.agreement = Some(agreement);
        self.send(
            negotiation,
            MessageKind::ContractAgreement,
            payload,
            ContractNegotiationState::Agreed,
        )
        .await
    }

    async fn on_agreed(self: Arc<Self>, negotiation: ContractNegotiation) -> StepResult {
        let kind = match negotiation.negotiation_type {
            NegotiationType::Consumer => MessageKind::ContractVerification,
            NegotiationType::Provider => MessageKind::ContractFinalization,
        };
        let payload = json!({
            "agreementId": negotiation.agreement.as_ref().map(|a| a.id.clone()),
        });
        self.send(negotiation, kind, payload, ContractNegotiationState::Finalized)
            .await
    }

    async fn on_terminating(self: Arc<Self>, negotiation: ContractNegotiation) -> StepResult {
        let payload = json!({ "reason": negotiation.termination_reason });
        self.send(
            negotiation,
            MessageKind::ContractTermination,
            payload,
            ContractNegotiationState::Terminated,
        )
        .await
    }
}

/// Drives contract negotiations on both the consumer and the provider side.
pub struct ContractNegotiationManager {
    store: Arc<dyn StateEntityStore<ContractNegotiation>>,
    queue: Arc<CommandQueue>,
    state_machine: StateMachineManager,
}

impl ContractNegotiationManager {
    /// Build the manager and register its processors and command handlers.
    pub fn new(
        config: &Config,
        store: Arc<dyn StateEntityStore<ContractNegotiation>>,
        dispatcher: Arc<dyn RemoteMessageDispatcher>,
    ) -> Result<Self> {
        let mut registry = CommandHandlerRegistry::new();
        registry.register(EntityCommandHandler::<_, TerminateNegotiationCommand>::new(
            store.clone(),
        ))?;
        registry.register(EntityCommandHandler::<_, ContractAgreedCommand>::new(
            store.clone(),
        ))?;

        let queue = Arc::new(CommandQueue::new(config.command_queue_capacity));
        let commands = CommandProcessor::new(
            queue.clone(),
            Arc::new(registry),
            config.command_batch_size,
        );

        let steps = Arc::new(NegotiationSteps {
            store: store.clone(),
            dispatcher,
            retry_limit: config.send_retry_limit,
        });

        let batch_size = config.batch_size;
        let processor = |state: ContractNegotiationState,
                         side: Option<NegotiationType>,
                         step: TransitionFn<ContractNegotiation>| {
            let mut filter = vec![Criterion::state_is(state.code())];
            let mut name = format!("{}:{:?}", ContractNegotiation::ENTITY_TYPE, state);
            if let Some(side) = side {
                filter.push(Criterion::eq("type", side.as_str()));
                name.push_str(&format!(":{}", side.as_str()));
            }
            Arc::new(StateProcessor::new(name, store.clone(), filter, batch_size, step))
        };

        let mut state_machine =
            StateMachineManager::new(config.state_machine("contract-negotiation"));
        state_machine
            .register(Arc::new(commands))
            .register(processor(
                ContractNegotiationState::Initial,
                Some(NegotiationType::Consumer),
                bind(&steps, NegotiationSteps::on_initial),
            ))
            .register(processor(
                ContractNegotiationState::Requesting,
                Some(NegotiationType::Consumer),
                bind(&steps, NegotiationSteps::on_requesting),
            ))
            .register(processor(
                ContractNegotiationState::Requested,
                Some(NegotiationType::Provider),
                bind(&steps, NegotiationSteps::on_requested),
            ))
            .register(processor(
                ContractNegotiationState::Agreeing,
                Some(NegotiationType::Provider),
                bind(&steps, NegotiationSteps::on_agreeing),
            ))
            .register(processor(
                ContractNegotiationState::Agreed,
                None,
                bind(&steps, NegotiationSteps::on_agreed),
            ))
            .register(processor(
                ContractNegotiationState::Terminating,
                None,
                bind(&steps, NegotiationSteps::on_terminating),
            ));

        Ok(Self {
            store,
            queue,
            state_machine,
        })
    }

    /// Start a consumer negotiation for `offer` and return its id.
    pub async fn initiate(
        &self,
        counter_party_id: impl Into<String>,
        counter_party_address: impl Into<String>,
        protocol: impl Into<String>,
        offer: ContractOffer,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let negotiation = ContractNegotiation::consumer(
            id.clone(),
            counter_party_id,
            counter_party_address,
            protocol,
            offer,
        );
        self.store.create(&negotiation).await?;
        info!(negotiation_id = %id, "Consumer negotiation initiated");
        Ok(id)
    }

    /// Record a contract request received from consumer negotiation `id`.
    pub async fn receive_request(
        &self,
        id: impl Into<String>,
        counter_party_id: impl Into<String>,
        counter_party_address: impl Into<String>,
        protocol: impl Into<String>,
        offer: ContractOffer,
    ) -> Result<String> {
        let id = id.into();
        let negotiation = ContractNegotiation::provider(
            id.clone(),
            counter_party_id,
            counter_party_address,
            protocol,
            offer,
        );
        self.store.create(&negotiation).await?;
        info!(negotiation_id = %id, "Provider negotiation created");
        Ok(id)
    }

    /// Queue a command for one of this manager's negotiations.
    pub fn enqueue<C: Command>(&self, command: C) -> Result<()> {
        Ok(self.queue.enqueue(command)?)
    }

    /// Current state of negotiation `id`.
    pub async fn find(&self, id: &str) -> Result<Option<ContractNegotiation>> {
        Ok(self.store.find_by_id(id).await?)
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

#[cfg(test)]
mod tests {
    use super::super::testing::offer;
    use super::*;
    use crate::dispatcher::RecordingDispatcher;
    use dataspace_core::LeaseSettings;
    use dataspace_core::store::InMemoryStateEntityStore;

    fn manager(dispatcher: &RecordingDispatcher) -> ContractNegotiationManager {
        let config = Config {
            send_retry_limit: 3,
            ..Config::default()
        };
        let store = Arc::new(InMemoryStateEntityStore::new(LeaseSettings::new("connector-a")));
        ContractNegotiationManager::new(&config, store, Arc::new(dispatcher.clone())).unwrap()
    }

    async fn after_tick(manager: &ContractNegotiationManager, id: &str) -> ContractNegotiation {
        manager.tick().await;
        manager.find(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_provider_agrees_and_finalizes() {
        let dispatcher = RecordingDispatcher::new();
        let manager = manager(&dispatcher);
        let id = manager
            .receive_request("n-1", "consumer", "http://consumer/dsp", "dsp", offer())
            .await
            .unwrap();

        let negotiation = after_tick(&manager, &id).await;
        assert_eq!(negotiation.state(), Some(ContractNegotiationState::Finalized));
        assert_eq!(
            negotiation.agreement.as_ref().map(|a| a.asset_id.as_str()),
            Some("asset-1")
        );
        assert_eq!(dispatcher.sent_for(&id, MessageKind::ContractAgreement).await, 1);
        assert_eq!(dispatcher.sent_for(&id, MessageKind::ContractFinalization).await, 1);

        let duplicate = manager
            .receive_request("n-1", "consumer", "http://consumer/dsp", "dsp", offer())
            .await;
        assert!(duplicate.is_err());
    }

    #[tokio::test]
    async fn test_consumer_waits_for_agreement() {
        let dispatcher = RecordingDispatcher::new();
        let manager = manager(&dispatcher);
        let id = manager
            .initiate("provider", "http://provider/dsp", "dsp", offer())
            .await
            .unwrap();

        let negotiation = after_tick(&manager, &id).await;
        assert_eq!(negotiation.state(), Some(ContractNegotiationState::Requested));
        assert_eq!(dispatcher.sent_for(&id, MessageKind::ContractRequest).await, 1);

        // Provider-side processors must not pick up consumer negotiations.
        let negotiation = after_tick(&manager, &id).await;
        assert_eq!(negotiation.state(), Some(ContractNegotiationState::Requested));

        manager
            .enqueue(ContractAgreedCommand {
                negotiation_id: id.clone(),
                agreement: ContractAgreement {
                    id: "agreement-1".to_string(),
                    asset_id: "asset-1".to_string(),
                    signing_date: now_millis(),
                    policy: Value::Null,
                },
            })
            .unwrap();
        let negotiation = after_tick(&manager, &id).await;
        assert_eq!(negotiation.state(), Some(ContractNegotiationState::Finalized));
        assert_eq!(dispatcher.sent_for(&id, MessageKind::ContractVerification).await, 1);
    }

    #[tokio::test]
    async fn test_termination_is_sent_and_bounded_by_retries() {
        let dispatcher = RecordingDispatcher::new();
        let manager = manager(&dispatcher);
        let id = manager
            .initiate("provider", "http://provider/dsp", "dsp", offer())
            .await
            .unwrap();
        after_tick(&manager, &id).await;

        dispatcher.fail_address("http://provider/dsp").await;
        manager
            .enqueue(TerminateNegotiationCommand {
                negotiation_id: id.clone(),
                reason: "offer withdrawn".to_string(),
            })
            .unwrap();

        let negotiation = after_tick(&manager, &id).await;
        assert_eq!(negotiation.state(), Some(ContractNegotiationState::Terminating));
        assert_eq!(negotiation.state_count(), 1);

        after_tick(&manager, &id).await;
        let negotiation = after_tick(&manager, &id).await;
        assert_eq!(negotiation.state(), Some(ContractNegotiationState::Terminated));
        assert_eq!(dispatcher.sent_for(&id, MessageKind::ContractTermination).await, 0);
    }
}
