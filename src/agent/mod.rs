//! Internal agent: executes REQUESTs arriving over the relay.
//!
//! The agent never listens on a port. It dials the relay as `type=B` and
//! keeps redialing after every failure until stopped.

pub mod executor;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::lifecycle::Lifecycle;
use crate::sessions::SessionTable;
use crate::tunnel::{ClientRole, LinkOptions, RelayEndpoint, RelayLink, StartupPolicy};

pub use executor::Executor;

/// Entry point for the agent side.
pub struct Agent;

impl Agent {
    /// Validate configuration and start the reconnecting relay link.
    ///
    /// Only invalid configuration fails here; relay outages are retried in
    /// the background.
    pub async fn start(config: &Config) -> Result<AgentHandle> {
        let executor = Executor::new(&config.agent)?;
        let endpoint = RelayEndpoint::new(&config.relay.url, ClientRole::Agent, &config.relay.token)?;

        if executor.router().filter().is_empty() {
            info!("Agent: allow-list empty, any host may be requested");
        } else {
            info!("Agent: allowing hosts matching {}", executor.router().filter());
        }

        let lifecycle = Lifecycle::new();
        let link = RelayLink::new(
            endpoint,
            LinkOptions::from_config(&config.relay),
            SessionTable::new(),
            Some(Arc::new(executor)),
            lifecycle.clone(),
        );
        link.start(StartupPolicy::RetryForever {
            backoff: config.relay.reconnect_delay(),
        })
        .await?;

        Ok(AgentHandle {
            link,
            lifecycle,
            grace: config.lifecycle.shutdown_grace(),
        })
    }
}

/// Running agent.
pub struct AgentHandle {
    link: RelayLink,
    lifecycle: Lifecycle,
    grace: Duration,
}

impl AgentHandle {
    pub fn link(&self) -> &RelayLink {
        &self.link
    }

    /// Stop reconnecting, close the link and wait for in-flight requests up
    /// to the shutdown grace.
    pub async fn stop(self) -> bool {
        info!("Agent: stopping");
        self.lifecycle.cancel();
        self.link.close().await;
        self.lifecycle.wait(self.grace).await
    }
}
