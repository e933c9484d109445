//! Connection registry: decides whether a connector gets the process-wide
//! broker client or a fresh one of its own.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;
use tracing::{error, info, warn};

use crate::broker::{BrokerClient, BrokerFactory};
use crate::config::Config;
use crate::error::ConnectError;

static GLOBAL: Lazy<ConnectionRegistry> = Lazy::new(ConnectionRegistry::new);

#[derive(Default)]
struct SharedSlot {
    client: Option<Result<Arc<dyn BrokerClient>, ConnectError>>,
    config: Option<Config>,
}

/// Holds at most one shared broker client, created on first demand.
///
/// The first shared-mode configuration wins: later callers get the existing
/// client whatever configuration they pass. A failed construction is kept and
/// returned to every caller until `reset`.
#[derive(Default)]
pub struct ConnectionRegistry {
    shared: Mutex<SharedSlot>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry used by `new_client`.
    pub fn global() -> &'static ConnectionRegistry {
        &GLOBAL
    }

    pub fn resolve(
        &self,
        config: &Config,
        factory: &dyn BrokerFactory,
    ) -> Result<Arc<dyn BrokerClient>, ConnectError> {
        if !config.use_global_client {
            info!(
                client_id = %config.client_id,
                "creating dedicated broker client"
            );
            return factory.connect(config);
        }

        // Held across construction so concurrent first callers build exactly one client
        let mut slot = self.lock();

        if let Some(existing) = &slot.client {
            if let Some(first) = &slot.config {
                if first.bootstrap_servers != config.bootstrap_servers
                    || first.client_id != config.client_id
                {
                    warn!(
                        shared_client_id = %first.client_id,
                        shared_bootstrap_servers = %first.bootstrap_servers_list(),
                        requested_client_id = %config.client_id,
                        requested_bootstrap_servers = %config.bootstrap_servers_list(),
                        "shared broker client already exists, ignoring differing configuration"
                    );
                }
            }
            return existing.clone();
        }

        let result = factory.connect(config);
        match &result {
            Ok(_) => info!(
                client_id = %config.client_id,
                bootstrap_servers = %config.bootstrap_servers_list(),
                "created shared broker client"
            ),
            Err(e) => error!(
                error = %e,
                "failed to create shared broker client, failing until reset"
            ),
        }

        slot.client = Some(result.clone());
        slot.config = Some(config.clone());
        result
    }

    /// Forgets the shared client so the next shared-mode call builds a new one.
    ///
    /// Meant for test isolation. Connectors already holding the old client keep
    /// using it; resetting while they are active is the caller's problem.
    pub fn reset(&self) {
        let mut slot = self.lock();
        *slot = SharedSlot::default();
        info!("shared broker client slot reset");
    }

    /// The configuration the shared client was created with, if any.
    pub fn shared_config(&self) -> Option<Config> {
        self.lock().config.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SharedSlot> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resets the process-wide registry. Test and debug use only.
pub fn reset_connection() {
    ConnectionRegistry::global().reset();
}
