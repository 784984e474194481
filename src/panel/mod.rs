// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Panel: users, nodes, packages and servers, and everything that drives
//! the nodes on their behalf

pub mod addons;
pub mod api;
pub mod client;
pub mod databases;
pub mod nodes;
pub mod permissions;
pub mod ports;
pub mod scheduler;
pub mod store;
pub mod transfer;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::auth::{issue_user_token, sha256_hex};
use crate::config::PanelConfig;
use crate::error::Result;
use client::NodeClient;
use databases::{DatabaseManager, SqlExecutor};
use nodes::NodeRegistry;
use scheduler::Scheduler;
use store::{new_id, PanelStore, User, UserLimits};
use transfer::TransferCoordinator;

/// Shared panel state handed to every handler
pub struct PanelState {
    pub config: PanelConfig,
    pub store: Arc<PanelStore>,
    pub nodes: Arc<NodeRegistry>,
    pub client: Arc<NodeClient>,
    pub transfers: Arc<TransferCoordinator>,
    pub scheduler: Arc<Scheduler>,
    pub databases: Arc<DatabaseManager>,
}

impl PanelState {
    pub fn new(config: PanelConfig, store: Arc<PanelStore>, sql: Arc<dyn SqlExecutor>) -> Result<Self> {
        let insecure = config.accept_invalid_node_certs;
        let client = Arc::new(NodeClient::new(store.clone(), insecure)?);
        Ok(Self {
            nodes: Arc::new(NodeRegistry::new(store.clone(), insecure)?),
            transfers: Arc::new(TransferCoordinator::new(client.clone())),
            scheduler: Arc::new(Scheduler::new(client.clone())),
            databases: Arc::new(DatabaseManager::new(store.clone(), sql)),
            client,
            store,
            config,
        })
    }

    /// Node refresher, schedule timers and transfer GC
    pub fn spawn_background(&self) {
        let interval = Duration::from_secs(self.config.node_refresh_interval_secs);
        self.nodes.spawn_refresher(interval);
        self.scheduler.start_all();
        self.transfers.spawn_gc();
        info!("Panel background tasks started (node refresh every {:?})", interval);
    }
}

/// Create `username`, or issue a fresh token if it exists. The plaintext
/// token is returned once.
pub fn upsert_user(store: &PanelStore, username: &str, admin: bool) -> Result<(User, String)> {
    let token = issue_user_token();
    let hash = sha256_hex(&token);
    let user = store.write(|d| {
        if let Some(existing) = d.users.values_mut().find(|u| u.username.eq_ignore_ascii_case(username)) {
            existing.token_hash = hash.clone();
            existing.is_admin |= admin;
            return Ok(existing.clone());
        }
        let user = User {
            id: new_id(),
            username: username.to_string(),
            token_hash: hash.clone(),
            is_admin: admin,
            limits: UserLimits::default(),
        };
        d.users.insert(user.id.clone(), user.clone());
        Ok(user)
    })?;
    Ok((user, token))
}
