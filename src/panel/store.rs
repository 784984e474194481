// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Panel state: every entity in one JSON file, rewritten after each mutation.
//!
//! Referential rules live here so that every caller gets them: a package in
//! use cannot be deleted, a node with servers cannot be deleted, a sub-user is
//! never the owner, and `(server, user)` and `(name, version)` are unique.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

use super::addons::AddonSource;
use crate::error::{AxisError, Result};
use crate::monitoring::SystemInfo;
use crate::protocol::{ConfigFilePatch, PortProtocol, ServerStatus};

// ─── Entities ───

/// Per-user overrides of the panel's default quotas
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserLimits {
    pub ram: Option<u64>,
    pub cpu: Option<u64>,
    pub disk: Option<u64>,
    pub servers: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub token_hash: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub limits: UserLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub fqdn: String,
    pub port: u16,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    pub token_id: String,
    pub token_hash: String,
    /// `token_id.token`, sent as Bearer on panel to node calls
    pub daemon_token: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub display_ip: Option<String>,
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub system_info: Option<SystemInfo>,
    #[serde(default)]
    pub auth_error: bool,
    /// Stored value is ignored; recomputed from `last_heartbeat` on read
    #[serde(default)]
    pub is_online: bool,
}

fn default_scheme() -> String {
    "https".to_string()
}

impl Node {
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.fqdn, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortSpec {
    /// Container port; also the default host port
    pub port: u16,
    #[serde(default)]
    pub protocol: PortProtocol,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariableSpec {
    pub name: String,
    #[serde(default)]
    pub default: String,
    #[serde(default)]
    pub user_editable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub id: String,
    pub name: String,
    pub version: String,
    pub docker_image: String,
    #[serde(default)]
    pub install_image: Option<String>,
    #[serde(default)]
    pub install_script: Option<String>,
    pub startup: String,
    #[serde(default = "crate::protocol::default_stop_signal")]
    pub stop_signal: String,
    #[serde(default)]
    pub stop_command: Option<String>,
    #[serde(default = "crate::protocol::default_stop_timeout")]
    pub stop_timeout: u64,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    #[serde(default)]
    pub variables: Vec<VariableSpec>,
    #[serde(default)]
    pub config_files: Vec<ConfigFilePatch>,
    #[serde(default)]
    pub addon_sources: Vec<AddonSource>,
    #[serde(default)]
    pub startup_editable: bool,
    #[serde(default)]
    pub image_editable: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ServerPort {
    pub port: u16,
    #[serde(default)]
    pub primary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub owner_id: String,
    pub node_id: String,
    pub package_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// MiB
    pub memory: u64,
    /// Hundredths of a core
    pub cpu: u64,
    /// MiB
    pub disk: u64,
    /// Empty means the package's
    #[serde(default)]
    pub startup: String,
    #[serde(default)]
    pub docker_image: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<ServerPort>,
    pub status: ServerStatus,
    #[serde(default)]
    pub is_suspended: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubUser {
    pub id: String,
    pub server_id: String,
    pub user_id: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskAction {
    Command,
    Power,
    Delay,
    Backup,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub action: TaskAction,
    #[serde(default)]
    pub payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub server_id: String,
    pub name: String,
    pub cron: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub only_when_online: bool,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseHost {
    pub id: String,
    pub name: String,
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub password: String,
    /// 0 means unlimited
    #[serde(default)]
    pub max_databases: u32,
}

fn default_mysql_port() -> u16 {
    3306
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDatabase {
    pub id: String,
    pub server_id: String,
    pub host_id: String,
    /// Name the user asked for, before prefixing
    pub name: String,
    pub db_name: String,
    pub username: String,
    pub password: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelData {
    pub users: BTreeMap<String, User>,
    pub nodes: BTreeMap<String, Node>,
    pub packages: BTreeMap<String, Package>,
    pub servers: BTreeMap<String, Server>,
    pub subusers: BTreeMap<String, SubUser>,
    pub schedules: BTreeMap<String, Schedule>,
    pub database_hosts: BTreeMap<String, DatabaseHost>,
    pub databases: BTreeMap<String, ServerDatabase>,
}

impl PanelData {
    pub fn subuser(&self, server_id: &str, user_id: &str) -> Option<&SubUser> {
        self.subusers.values().find(|s| s.server_id == server_id && s.user_id == user_id)
    }

    pub fn servers_on_node(&self, node_id: &str) -> impl Iterator<Item = &Server> {
        self.servers.values().filter(move |s| s.node_id == node_id)
    }

    pub fn user_by_token_hash(&self, hash: &str) -> Option<&User> {
        self.users.values().find(|u| !u.token_hash.is_empty() && u.token_hash == hash)
    }
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ─── Store ───

pub struct PanelStore {
    path: Option<PathBuf>,
    data: RwLock<PanelData>,
}

impl PanelStore {
    /// Load from `path`; a missing file is an empty panel
    pub fn load(path: &Path) -> Result<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| AxisError::internal(format!("Corrupt panel state {}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PanelData::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path: Some(path.to_path_buf()), data: RwLock::new(data) })
    }

    /// Not persisted anywhere
    pub fn in_memory() -> Self {
        Self { path: None, data: RwLock::new(PanelData::default()) }
    }

    pub fn read<T>(&self, f: impl FnOnce(&PanelData) -> T) -> T {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        f(&data)
    }

    /// Mutate and persist. Nothing is written when `f` fails.
    pub fn write<T>(&self, f: impl FnOnce(&mut PanelData) -> Result<T>) -> Result<T> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let mut draft = data.clone();
        let out = f(&mut draft)?;
        self.persist(&draft)?;
        *data = draft;
        Ok(out)
    }

    fn persist(&self, data: &PanelData) -> Result<()> {
        let Some(path) = &self.path else { return Ok(()) };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(data)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        debug!("Panel state saved to {}", path.display());
        Ok(())
    }

    // ─── Lookups ───

    pub fn user(&self, id: &str) -> Result<User> {
        self.read(|d| d.users.get(id).cloned()).ok_or_else(|| AxisError::not_found("User not found"))
    }

    pub fn node(&self, id: &str) -> Result<Node> {
        self.read(|d| d.nodes.get(id).cloned()).ok_or_else(|| AxisError::not_found("Node not found"))
    }

    pub fn package(&self, id: &str) -> Result<Package> {
        self.read(|d| d.packages.get(id).cloned()).ok_or_else(|| AxisError::not_found("Package not found"))
    }

    pub fn server(&self, id: &str) -> Result<Server> {
        self.read(|d| d.servers.get(id).cloned()).ok_or_else(|| AxisError::not_found("Server not found"))
    }

    pub fn schedule(&self, id: &str) -> Result<Schedule> {
        self.read(|d| d.schedules.get(id).cloned()).ok_or_else(|| AxisError::not_found("Schedule not found"))
    }

    // ─── Guarded mutations ───

    pub fn add_user(&self, user: User) -> Result<User> {
        self.write(|d| {
            if d.users.values().any(|u| u.username.eq_ignore_ascii_case(&user.username)) {
                return Err(AxisError::conflict("Username is taken"));
            }
            d.users.insert(user.id.clone(), user.clone());
            Ok(user)
        })
    }

    pub fn add_node(&self, node: Node) -> Result<Node> {
        self.write(|d| {
            if d.nodes.values().any(|n| n.name == node.name) {
                return Err(AxisError::conflict("Node name is taken"));
            }
            d.nodes.insert(node.id.clone(), node.clone());
            Ok(node)
        })
    }

    pub fn delete_node(&self, id: &str) -> Result<()> {
        self.write(|d| {
            if !d.nodes.contains_key(id) {
                return Err(AxisError::not_found("Node not found"));
            }
            let count = d.servers_on_node(id).count();
            if count > 0 {
                return Err(AxisError::conflict(format!("Node still has {} server(s)", count)));
            }
            d.nodes.remove(id);
            Ok(())
        })
    }

    pub fn add_package(&self, pkg: Package) -> Result<Package> {
        self.write(|d| {
            if d.packages.values().any(|p| p.name == pkg.name && p.version == pkg.version) {
                return Err(AxisError::conflict("A package with this name and version exists"));
            }
            d.packages.insert(pkg.id.clone(), pkg.clone());
            Ok(pkg)
        })
    }

    pub fn delete_package(&self, id: &str) -> Result<()> {
        self.write(|d| {
            if !d.packages.contains_key(id) {
                return Err(AxisError::not_found("Package not found"));
            }
            if d.servers.values().any(|s| s.package_id == id) {
                return Err(AxisError::conflict("Package is used by a server"));
            }
            d.packages.remove(id);
            Ok(())
        })
    }

    pub fn add_subuser(&self, sub: SubUser) -> Result<SubUser> {
        self.write(|d| {
            let server = d.servers.get(&sub.server_id).ok_or_else(|| AxisError::not_found("Server not found"))?;
            if server.owner_id == sub.user_id {
                return Err(AxisError::invalid("The owner cannot be a sub-user"));
            }
            if !d.users.contains_key(&sub.user_id) {
                return Err(AxisError::not_found("User not found"));
            }
            if d.subuser(&sub.server_id, &sub.user_id).is_some() {
                return Err(AxisError::conflict("User is already a sub-user of this server"));
            }
            d.subusers.insert(sub.id.clone(), sub.clone());
            Ok(sub)
        })
    }

    pub fn update_server(&self, id: &str, f: impl FnOnce(&mut Server)) -> Result<Server> {
        self.write(|d| {
            let server = d.servers.get_mut(id).ok_or_else(|| AxisError::not_found("Server not found"))?;
            f(server);
            Ok(server.clone())
        })
    }

    /// Drop the server row with its sub-users, schedules and database rows
    pub fn delete_server(&self, id: &str) -> Result<()> {
        self.write(|d| {
            if d.servers.remove(id).is_none() {
                return Err(AxisError::not_found("Server not found"));
            }
            d.subusers.retain(|_, s| s.server_id != id);
            d.schedules.retain(|_, s| s.server_id != id);
            d.databases.retain(|_, s| s.server_id != id);
            Ok(())
        })
    }

    /// Best-effort write used by background tasks that cannot surface errors
    pub fn write_logged(&self, what: &str, f: impl FnOnce(&mut PanelData) -> Result<()>) {
        if let Err(e) = self.write(f) {
            warn!("Failed to save {}: {}", what, e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn user(id: &str, admin: bool) -> User {
        User { id: id.into(), username: id.into(), token_hash: String::new(), is_admin: admin, limits: UserLimits::default() }
    }

    pub(crate) fn node(id: &str) -> Node {
        Node {
            id: id.into(),
            name: id.into(),
            fqdn: format!("{}.example.com", id),
            port: 8443,
            scheme: "https".into(),
            token_id: "abcd1234ef567890".into(),
            token_hash: crate::auth::sha256_hex("secret"),
            daemon_token: "abcd1234ef567890.secret".into(),
            icon: None,
            display_ip: None,
            last_heartbeat: None,
            system_info: None,
            auth_error: false,
            is_online: false,
        }
    }

    pub(crate) fn package(id: &str) -> Package {
        Package {
            id: id.into(),
            name: "Minecraft".into(),
            version: "1.21".into(),
            docker_image: "ghcr.io/games/java:21".into(),
            install_image: None,
            install_script: Some("curl -o server.jar $URL".into()),
            startup: "java -Xmx{{SERVER_MEMORY}}M -jar server.jar --port {{SERVER_PORT}}".into(),
            stop_signal: "SIGTERM".into(),
            stop_command: Some("stop".into()),
            stop_timeout: 30,
            ports: vec![PortSpec { port: 25565, protocol: PortProtocol::Tcp }, PortSpec { port: 25575, protocol: PortProtocol::Tcp }],
            variables: vec![
                VariableSpec { name: "VERSION".into(), default: "latest".into(), user_editable: true },
                VariableSpec { name: "EULA".into(), default: "true".into(), user_editable: false },
            ],
            config_files: vec![],
            addon_sources: vec![],
            startup_editable: false,
            image_editable: false,
        }
    }

    pub(crate) fn server(id: &str, owner: &str, node: &str, pkg: &str) -> Server {
        Server {
            id: id.into(),
            owner_id: owner.into(),
            node_id: node.into(),
            package_id: pkg.into(),
            name: id.into(),
            description: String::new(),
            memory: 2048,
            cpu: 200,
            disk: 10240,
            startup: String::new(),
            docker_image: String::new(),
            variables: BTreeMap::new(),
            ports: vec![ServerPort { port: 25566, primary: true }],
            status: ServerStatus::Stopped,
            is_suspended: false,
            created_at: Utc::now(),
        }
    }

    /// Store with users alice (owner) and bob, node n1, package p1, server s1
    pub(crate) fn seeded() -> PanelStore {
        let store = PanelStore::in_memory();
        store.write(|d| {
            d.users.insert("alice".into(), user("alice", false));
            d.users.insert("bob".into(), user("bob", false));
            d.users.insert("root".into(), user("root", true));
            d.nodes.insert("n1".into(), node("n1"));
            d.packages.insert("p1".into(), package("p1"));
            d.servers.insert("s1".into(), server("s1", "alice", "n1", "p1"));
            Ok(())
        }).unwrap();
        store
    }

    #[test]
    fn referential_rules() {
        let store = seeded();
        assert!(matches!(store.delete_node("n1"), Err(AxisError::Conflict(_))));
        assert!(matches!(store.delete_package("p1"), Err(AxisError::Conflict(_))));

        let mut dup = package("p2");
        dup.version = "1.21".into();
        assert!(matches!(store.add_package(dup), Err(AxisError::Conflict(_))));

        let owner = SubUser { id: new_id(), server_id: "s1".into(), user_id: "alice".into(), permissions: vec![] };
        assert!(matches!(store.add_subuser(owner), Err(AxisError::InvalidInput(_))));
        let bob = SubUser { id: new_id(), server_id: "s1".into(), user_id: "bob".into(), permissions: vec![] };
        store.add_subuser(bob.clone()).unwrap();
        let again = SubUser { id: new_id(), ..bob };
        assert!(matches!(store.add_subuser(again), Err(AxisError::Conflict(_))));

        store.delete_server("s1").unwrap();
        assert_eq!(store.read(|d| d.subusers.len()), 0);
        store.delete_node("n1").unwrap();
        store.delete_package("p1").unwrap();
    }

    #[test]
    fn failed_mutation_leaves_state_untouched() {
        let store = seeded();
        let res: Result<()> = store.write(|d| {
            d.servers.clear();
            Err(AxisError::invalid("nope"))
        });
        assert!(res.is_err());
        assert!(store.server("s1").is_ok());
    }

    #[test]
    fn persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state/panel.json");
        let store = PanelStore::load(&path).unwrap();
        store.add_user(user("alice", false)).unwrap();
        assert!(matches!(store.add_user(user("ALICE", false)), Err(AxisError::Conflict(_))));

        let reloaded = PanelStore::load(&path).unwrap();
        assert_eq!(reloaded.user("alice").unwrap().username, "alice");
        assert!(!path.with_extension("json.tmp").exists());
    }
}
