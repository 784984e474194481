// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Node-to-node server transfer
//!
//! Stages only move forward: pending, stopping, archiving, uploading,
//! cleanup, importing, complete. Any failure lands in `failed` with the
//! error text and leaves the server row pointing at the source node.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{error, info, warn};

use super::client::NodeClient;
use super::ports::{allocate_ports, used_ports};
use super::store::{new_id, PanelStore, ServerPort};
use crate::error::{AxisError, Result};
use crate::protocol::ServerStatus;

const STOP_SETTLE: Duration = Duration::from_secs(2);
const GC_PERIOD: Duration = Duration::from_secs(60);
const GC_AFTER_SECS: i64 = 5 * 60;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransferStage {
    Pending,
    Stopping,
    Archiving,
    Uploading,
    Cleanup,
    Importing,
    Complete,
    Failed,
}

impl TransferStage {
    pub fn progress(&self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Stopping => Some(5),
            Self::Archiving => Some(15),
            Self::Uploading => Some(40),
            Self::Cleanup => Some(85),
            Self::Importing => Some(95),
            Self::Complete => Some(100),
            Self::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferStatus {
    pub id: String,
    pub server_id: String,
    pub source_node: String,
    pub target_node: String,
    pub stage: TransferStage,
    pub progress: u8,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Move the server row to `target` with freshly allocated ports, in one write
pub fn reassign(store: &PanelStore, server_id: &str, target: &str) -> Result<Vec<ServerPort>> {
    store.write(|d| {
        let server = d.servers.get(server_id).ok_or_else(|| AxisError::not_found("Server not found"))?;
        let wanted = d.packages.get(&server.package_id)
            .map(|p| p.ports.len())
            .unwrap_or(0)
            .max(server.ports.len());
        let used = used_ports(d, target, Some(server_id));
        let ports = allocate_ports(&used, wanted)?;
        if let Some(s) = d.servers.get_mut(server_id) {
            s.node_id = target.to_string();
            s.ports = ports.clone();
        }
        Ok(ports)
    })
}

pub struct TransferCoordinator {
    client: Arc<NodeClient>,
    transfers: RwLock<HashMap<String, TransferStatus>>,
    stop_settle: Duration,
}

impl TransferCoordinator {
    pub fn new(client: Arc<NodeClient>) -> Self {
        Self { client, transfers: RwLock::new(HashMap::new()), stop_settle: STOP_SETTLE }
    }

    fn store(&self) -> &PanelStore {
        self.client.store()
    }

    pub fn get(&self, id: &str) -> Result<TransferStatus> {
        self.transfers.read().unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| AxisError::not_found("Transfer not found"))
    }

    pub fn start(self: &Arc<Self>, server_id: &str, target_node: &str) -> Result<TransferStatus> {
        let server = self.store().server(server_id)?;
        self.store().node(target_node)?;
        if server.node_id == target_node {
            return Err(AxisError::invalid("Server is already on that node"));
        }

        let status = {
            let mut transfers = self.transfers.write().unwrap_or_else(|e| e.into_inner());
            if transfers.values().any(|t| t.server_id == server_id && !t.stage.is_terminal()) {
                return Err(AxisError::conflict("A transfer for this server is already running"));
            }
            let status = TransferStatus {
                id: new_id(),
                server_id: server_id.to_string(),
                source_node: server.node_id.clone(),
                target_node: target_node.to_string(),
                stage: TransferStage::Pending,
                progress: 0,
                error: None,
                started_at: Utc::now(),
                completed_at: None,
            };
            transfers.insert(status.id.clone(), status.clone());
            status
        };

        info!("Transfer {} of {} from {} to {} queued", status.id, server_id, status.source_node, target_node);
        let coordinator = self.clone();
        let id = status.id.clone();
        tokio::spawn(async move { coordinator.run(&id).await });
        Ok(status)
    }

    fn set_stage(&self, id: &str, stage: TransferStage) {
        let mut transfers = self.transfers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(t) = transfers.get_mut(id) {
            t.stage = stage;
            if let Some(p) = stage.progress() {
                t.progress = p;
            }
            if stage.is_terminal() {
                t.completed_at = Some(Utc::now());
            }
            info!("Transfer {} of {}: {:?} ({}%)", id, t.server_id, stage, t.progress);
        }
    }

    async fn run(&self, id: &str) {
        let Ok(status) = self.get(id) else { return };
        match self.execute(&status).await {
            Ok(()) => self.set_stage(id, TransferStage::Complete),
            Err(e) => {
                error!("Transfer {} of {} failed: {}", id, status.server_id, e);
                if let Ok(source) = self.store().node(&status.source_node) {
                    if let Err(e) = self.client.delete_archive(&source, &status.server_id).await {
                        warn!("Could not remove transfer archive on {}: {}", source.name, e);
                    }
                }
                {
                    let mut transfers = self.transfers.write().unwrap_or_else(|e| e.into_inner());
                    if let Some(t) = transfers.get_mut(id) {
                        t.error = Some(e.to_string());
                    }
                }
                self.set_stage(id, TransferStage::Failed);
            }
        }
    }

    async fn execute(&self, t: &TransferStatus) -> Result<()> {
        let source = self.store().node(&t.source_node)?;
        let target = self.store().node(&t.target_node)?;
        let sid = t.server_id.as_str();

        self.set_stage(&t.id, TransferStage::Stopping);
        match self.client.status(sid).await {
            Ok((ServerStatus::Running, _)) => {
                self.client.stop(sid).await?;
                self.store().update_server(sid, |s| s.status = ServerStatus::Stopped)?;
                tokio::time::sleep(self.stop_settle).await;
            }
            Ok(_) | Err(AxisError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        self.set_stage(&t.id, TransferStage::Archiving);
        self.client.create_archive(&source, sid).await?;

        self.set_stage(&t.id, TransferStage::Uploading);
        self.client.import_from(&target, &source, sid).await?;

        self.set_stage(&t.id, TransferStage::Cleanup);
        self.client.delete_archive(&source, sid).await?;
        self.client.delete_from(&source, sid).await?;

        self.set_stage(&t.id, TransferStage::Importing);
        let ports = reassign(self.store(), sid, &target.id)?;
        info!("Server {} now on {} with ports {:?}", sid, target.name, ports.iter().map(|p| p.port).collect::<Vec<_>>());
        Ok(())
    }

    /// Forget terminal transfers older than five minutes
    pub fn gc(&self, now: DateTime<Utc>) {
        let mut transfers = self.transfers.write().unwrap_or_else(|e| e.into_inner());
        transfers.retain(|_, t| match t.completed_at {
            Some(done) if t.stage.is_terminal() => (now - done).num_seconds() < GC_AFTER_SECS,
            _ => true,
        });
    }

    pub fn spawn_gc(self: &Arc<Self>) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(GC_PERIOD);
            loop {
                tick.tick().await;
                coordinator.gc(Utc::now());
            }
        });
    }
}
