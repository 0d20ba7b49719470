// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Data-plane health probes.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use url::Url;

use super::DataPlaneInstance;
use crate::error::{Error, Result};

/// Decides whether a data plane is reachable.
#[async_trait]
pub trait DataPlaneHealthCheck: Send + Sync {
    /// `Ok` when `instance` answered; the error describes why it did not.
    async fn check(&self, instance: &DataPlaneInstance) -> Result<()>;
}

/// Probe that opens a TCP connection to the instance URL.
#[derive(Debug, Clone)]
pub struct TcpHealthCheck {
    timeout: Duration,
}

impl TcpHealthCheck {
    /// Probe giving up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl DataPlaneHealthCheck for TcpHealthCheck {
    async fn check(&self, instance: &DataPlaneInstance) -> Result<()> {
        let unreachable = |message: String| Error::Unreachable {
            url: instance.url.clone(),
            message,
        };

        let url = Url::parse(&instance.url).map_err(|e| unreachable(e.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| unreachable("URL has no host".to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| unreachable("URL has no port".to_string()))?;

        match tokio::time::timeout(self.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(unreachable(e.to_string())),
            Err(_) => Err(unreachable(format!(
                "no answer within {}ms",
                self.timeout.as_millis()
            ))),
        }
    }
}
