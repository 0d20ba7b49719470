// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fan-out provisioning of the sub-resources of one workflow entity.
//!
//! Every resource is routed by its `resource_type` to the first registered
//! [`Provisioner`] (or [`Deprovisioner`]) supporting it and runs on its own
//! tokio task. Results come back in input order, one per resource; a failing
//! or panicking resource never affects its siblings.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};

use crate::error::Result;

/// A sub-resource to provision or deprovision for a parent entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinition {
    /// Resource identifier.
    pub id: String,
    /// Routing key matched against `supported_type()`.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Correlation id of the parent entity.
    pub flow_id: String,
    /// Provisioner-specific settings.
    #[serde(default)]
    pub properties: Value,
}

impl ResourceDefinition {
    /// Definition without properties.
    pub fn new(
        id: impl Into<String>,
        resource_type: impl Into<String>,
        flow_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            flow_id: flow_id.into(),
            properties: Value::Null,
        }
    }

    /// Attach provisioner settings.
    pub fn with_properties(mut self, properties: Value) -> Self {
        self.properties = properties;
        self
    }
}

/// Outcome of a successful provision call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedResource {
    /// Id of the provisioned resource definition.
    pub resource_id: String,
    /// Provisioner output (addresses, credentials references).
    #[serde(default)]
    pub properties: Value,
    /// Provisioning continues asynchronously and completes via a command.
    #[serde(default)]
    pub in_process: bool,
}

impl ProvisionedResource {
    /// Completed provisioning of `resource_id`.
    pub fn completed(resource_id: impl Into<String>, properties: Value) -> Self {
        Self {
            resource_id: resource_id.into(),
            properties,
            in_process: false,
        }
    }

    /// Provisioning of `resource_id` that completes later.
    pub fn in_process(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            properties: Value::Null,
            in_process: true,
        }
    }
}

/// Outcome of a successful deprovision call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeprovisionedResource {
    /// Id of the deprovisioned resource definition.
    pub resource_id: String,
    /// Deprovisioning continues asynchronously.
    #[serde(default)]
    pub in_process: bool,
}

impl DeprovisionedResource {
    /// Completed deprovisioning of `resource_id`.
    pub fn completed(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            in_process: false,
        }
    }
}

/// Failure of a single resource within a fan-out.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Resource '{resource_id}' of flow '{flow_id}' failed: {message}")]
pub struct ResourceFailure {
    /// Failing resource.
    pub resource_id: String,
    /// Parent correlation id.
    pub flow_id: String,
    /// Cause.
    pub message: String,
}

/// Per-resource result of a fan-out.
pub type ResourceResult<T> = std::result::Result<T, ResourceFailure>;

/// Provisions resources of one type.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Resource type handled.
    fn supported_type(&self) -> &str;

    /// Provision `resource`.
    async fn provision(&self, resource: &ResourceDefinition) -> Result<ProvisionedResource>;
}

/// Releases resources of one type.
#[async_trait]
pub trait Deprovisioner: Send + Sync {
    /// Resource type handled.
    fn supported_type(&self) -> &str;

    /// Deprovision `resource`.
    async fn deprovision(&self, resource: &ResourceDefinition) -> Result<DeprovisionedResource>;
}

/// Routes resources to provisioners and runs them concurrently.
#[derive(Default, Clone)]
pub struct ProvisionManager {
    provisioners: Vec<Arc<dyn Provisioner>>,
    deprovisioners: Vec<Arc<dyn Deprovisioner>>,
}

impl ProvisionManager {
    /// Manager without provisioners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provisioner. Earlier registrations win for the same type.
    pub fn register_provisioner(&mut self, provisioner: Arc<dyn Provisioner>) -> &mut Self {
        self.provisioners.push(provisioner);
        self
    }

    /// Add a deprovisioner. Earlier registrations win for the same type.
    pub fn register_deprovisioner(&mut self, deprovisioner: Arc<dyn Deprovisioner>) -> &mut Self {
        self.deprovisioners.push(deprovisioner);
        self
    }

    /// Provision every resource concurrently. Results are in input order.
    pub async fn provision(
        &self,
        resources: Vec<ResourceDefinition>,
    ) -> Vec<ResourceResult<ProvisionedResource>> {
        fan_out(
            "provisioner",
            resources,
            |resource_type| {
                self.provisioners
                    .iter()
                    .find(|p| p.supported_type() == resource_type)
                    .cloned()
            },
            |provisioner: Arc<dyn Provisioner>, resource: ResourceDefinition| async move {
                provisioner.provision(&resource).await
            },
        )
        .await
    }

    /// Deprovision every resource concurrently. Results are in input order.
    pub async fn deprovision(
        &self,
        resources: Vec<ResourceDefinition>,
    ) -> Vec<ResourceResult<DeprovisionedResource>> {
        fan_out(
            "deprovisioner",
            resources,
            |resource_type| {
                self.deprovisioners
                    .iter()
                    .find(|d| d.supported_type() == resource_type)
                    .cloned()
            },
            |deprovisioner: Arc<dyn Deprovisioner>, resource: ResourceDefinition| async move {
                deprovisioner.deprovision(&resource).await
            },
        )
        .await
    }
}

async fn fan_out<P, T, R, F, Fut>(
    kind: &'static str,
    resources: Vec<ResourceDefinition>,
    resolve: R,
    call: F,
) -> Vec<ResourceResult<T>>
where
    P: ?Sized + Send + Sync + 'static,
    T: Send + 'static,
    R: Fn(&str) -> Option<Arc<P>>,
    F: Fn(Arc<P>, ResourceDefinition) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let pending: Vec<_> = resources
        .into_iter()
        .map(|resource| {
            let handle = resolve(&resource.resource_type)
                .map(|handler| tokio::spawn(call(handler, resource.clone())));
            (resource, handle)
        })
        .collect();

    let mut results = Vec::with_capacity(pending.len());
    for (resource, handle) in pending {
        let outcome = match handle {
            None => Err(format!(
                "No {kind} available for type {}",
                resource.resource_type
            )),
            Some(handle) => match handle.await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(e.to_string()),
                Err(e) if e.is_panic() => Err(format!("{kind} panicked")),
                Err(e) => Err(e.to_string()),
            },
        };

        results.push(outcome.map_err(|message| {
            error!(
                resource_id = %resource.id,
                flow_id = %resource.flow_id,
                resource_type = %resource.resource_type,
                error = %message,
                "Resource {kind} failed"
            );
            ResourceFailure {
                resource_id: resource.id.clone(),
                flow_id: resource.flow_id.clone(),
                message,
            }
        }));
    }

    debug!(
        kind,
        total = results.len(),
        failed = results.iter().filter(|r| r.is_err()).count(),
        "Fan-out completed"
    );
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Provisions `bucket` resources; `boom` ids fail, `panic` ids panic.
    struct Buckets {
        completed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Provisioner for Buckets {
        fn supported_type(&self) -> &str {
            "bucket"
        }

        async fn provision(&self, resource: &ResourceDefinition) -> Result<ProvisionedResource> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            match resource.id.as_str() {
                "boom" => Err(EngineError::transition(&resource.flow_id, "quota exceeded")),
                "panic" => panic!("driver crashed"),
                _ => {
                    self.completed.fetch_add(1, Ordering::SeqCst);
                    Ok(ProvisionedResource::completed(
                        &resource.id,
                        serde_json::json!({ "bucket": format!("b-{}", resource.id) }),
                    ))
                }
            }
        }
    }

    #[async_trait]
    impl Deprovisioner for Buckets {
        fn supported_type(&self) -> &str {
            "bucket"
        }

        async fn deprovision(
            &self,
            resource: &ResourceDefinition,
        ) -> Result<DeprovisionedResource> {
            Ok(DeprovisionedResource::completed(&resource.id))
        }
    }

    fn manager() -> (ProvisionManager, Arc<AtomicUsize>) {
        let completed = Arc::new(AtomicUsize::new(0));
        let buckets = Arc::new(Buckets {
            completed: completed.clone(),
        });
        let mut manager = ProvisionManager::new();
        manager
            .register_provisioner(buckets.clone())
            .register_deprovisioner(buckets);
        (manager, completed)
    }

    fn bucket(id: &str) -> ResourceDefinition {
        ResourceDefinition::new(id, "bucket", "tp-1")
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let (manager, completed) = manager();
        let results = manager
            .provision(vec![bucket("r1"), bucket("boom"), bucket("r3")])
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().resource_id, "r1");
        assert_eq!(
            results[0].as_ref().unwrap().properties["bucket"],
            "b-r1"
        );
        let failure = results[1].as_ref().unwrap_err();
        assert_eq!(failure.resource_id, "boom");
        assert_eq!(failure.flow_id, "tp-1");
        assert!(failure.message.contains("quota exceeded"));
        assert_eq!(results[2].as_ref().unwrap().resource_id, "r3");
        assert_eq!(completed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let (manager, _) = manager();
        let results = manager.provision(vec![bucket("panic"), bucket("r2")]).await;
        assert_eq!(
            results[0].as_ref().unwrap_err().message,
            "provisioner panicked"
        );
        assert!(results[1].is_ok());
    }

    #[tokio::test]
    async fn test_unknown_type_fails_only_that_resource() {
        let (manager, _) = manager();
        let results = manager
            .provision(vec![
                bucket("r1"),
                ResourceDefinition::new("q1", "queue", "tp-1"),
            ])
            .await;
        assert!(results[0].is_ok());
        assert_eq!(
            results[1].as_ref().unwrap_err().message,
            "No provisioner available for type queue"
        );

        let results = manager
            .deprovision(vec![ResourceDefinition::new("q1", "queue", "tp-1")])
            .await;
        assert_eq!(
            results[0].as_ref().unwrap_err().message,
            "No deprovisioner available for type queue"
        );
    }

    #[tokio::test]
    async fn test_resources_run_concurrently() {
        let (manager, _) = manager();
        let resources: Vec<_> = (0..10).map(|i| bucket(&format!("r{i}"))).collect();

        let started = std::time::Instant::now();
        let results = manager.provision(resources).await;
        assert!(results.iter().all(|r| r.is_ok()));
        // Ten sequential calls would take at least 200ms.
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_deprovision() {
        let (manager, _) = manager();
        let results = manager.deprovision(vec![bucket("r1")]).await;
        assert_eq!(
            results[0].as_ref().unwrap(),
            &DeprovisionedResource::completed("r1")
        );
    }

    #[test]
    fn test_definition_serializes_type_field() {
        let value = serde_json::to_value(bucket("r1")).unwrap();
        assert_eq!(value["type"], "bucket");
        assert_eq!(value["flowId"], "tp-1");
    }
}
