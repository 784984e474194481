// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Per-server MySQL databases on admin-registered hosts
//!
//! Names are derived from the server id and the requested name, and only
//! ever contain `[a-z0-9_]`, so they are safe to splice into statements.

use async_trait::async_trait;
use chrono::Utc;
use mysql_async::prelude::*;
use mysql_async::{Opts, OptsBuilder, Pool};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::store::{new_id, DatabaseHost, PanelStore, ServerDatabase};
use crate::auth::random_hex;
use crate::error::{AxisError, Result};

const DB_NAME_MAX: usize = 64;
const USER_NAME_MAX: usize = 32;

pub fn sanitize(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' { c } else { '_' })
        .collect()
}

fn server_prefix(server_id: &str) -> String {
    server_id.chars().filter(|c| c.is_ascii_hexdigit()).take(8).collect::<String>().to_lowercase()
}

/// `(db_name, username)` for a server's logical database
pub fn derive_names(server_id: &str, logical: &str) -> (String, String) {
    let prefix = server_prefix(server_id);
    let clean = sanitize(logical);
    let mut db = format!("s{}_{}", prefix, clean);
    let mut user = format!("u{}_{}", prefix, clean);
    db.truncate(DB_NAME_MAX);
    user.truncate(USER_NAME_MAX);
    (db, user)
}

pub fn new_password() -> String {
    random_hex(12)
}

fn create_statements(db: &str, user: &str, password: &str) -> Vec<String> {
    vec![
        format!("CREATE DATABASE IF NOT EXISTS `{}`", db),
        format!("CREATE USER IF NOT EXISTS '{}'@'%' IDENTIFIED BY '{}'", user, password),
        format!("GRANT ALL PRIVILEGES ON `{}`.* TO '{}'@'%'", db, user),
        "FLUSH PRIVILEGES".to_string(),
    ]
}

/// Undo the first `done` create statements, newest first
fn rollback_statements(db: &str, user: &str, done: usize) -> Vec<String> {
    let mut out = Vec::new();
    if done >= 2 {
        out.push(format!("DROP USER IF EXISTS '{}'@'%'", user));
    }
    if done >= 1 {
        out.push(format!("DROP DATABASE IF EXISTS `{}`", db));
    }
    out
}

/// Runs admin statements against a database host
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Execute in order. On failure, report how many statements succeeded.
    async fn execute(&self, host: &DatabaseHost, statements: &[String]) -> std::result::Result<(), (usize, AxisError)>;
}

pub struct MysqlExecutor;

fn host_opts(host: &DatabaseHost) -> Opts {
    OptsBuilder::default()
        .ip_or_hostname(&host.host)
        .tcp_port(host.port)
        .user(Some(&host.username))
        .pass(Some(&host.password))
        .into()
}

#[async_trait]
impl SqlExecutor for MysqlExecutor {
    async fn execute(&self, host: &DatabaseHost, statements: &[String]) -> std::result::Result<(), (usize, AxisError)> {
        let pool = Pool::new(host_opts(host));
        let mut conn = pool.get_conn().await.map_err(|e| (0, AxisError::from(e)))?;
        let mut outcome = Ok(());
        for (i, sql) in statements.iter().enumerate() {
            if let Err(e) = conn.query_drop(sql.as_str()).await {
                outcome = Err((i, AxisError::from(e)));
                break;
            }
        }
        drop(conn);
        pool.disconnect().await.ok();
        outcome
    }
}

/// Host as shown to admins
#[derive(Debug, Clone, Serialize)]
pub struct HostView {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub max_databases: u32,
    pub databases: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewHost {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub max_databases: u32,
}

fn default_port() -> u16 {
    3306
}

pub struct DatabaseManager {
    store: Arc<PanelStore>,
    sql: Arc<dyn SqlExecutor>,
}

impl DatabaseManager {
    pub fn new(store: Arc<PanelStore>, sql: Arc<dyn SqlExecutor>) -> Self {
        Self { store, sql }
    }

    // ─── Hosts ───

    pub fn list_hosts(&self) -> Vec<HostView> {
        self.store.read(|d| {
            d.database_hosts.values().map(|h| HostView {
                id: h.id.clone(),
                name: h.name.clone(),
                host: h.host.clone(),
                port: h.port,
                username: h.username.clone(),
                max_databases: h.max_databases,
                databases: d.databases.values().filter(|db| db.host_id == h.id).count(),
            }).collect()
        })
    }

    pub fn add_host(&self, req: NewHost) -> Result<DatabaseHost> {
        if req.name.trim().is_empty() || req.host.trim().is_empty() || req.username.trim().is_empty() {
            return Err(AxisError::invalid("name, host and username are required"));
        }
        let host = DatabaseHost {
            id: new_id(),
            name: req.name.trim().to_string(),
            host: req.host.trim().to_string(),
            port: req.port,
            username: req.username,
            password: req.password,
            max_databases: req.max_databases,
        };
        self.store.write(|d| {
            if d.database_hosts.values().any(|h| h.name == host.name) {
                return Err(AxisError::conflict("A database host with this name exists"));
            }
            d.database_hosts.insert(host.id.clone(), host.clone());
            Ok(())
        })?;
        info!("Database host {} ({}:{}) added", host.name, host.host, host.port);
        Ok(host)
    }

    pub fn delete_host(&self, id: &str) -> Result<()> {
        self.store.write(|d| {
            if !d.database_hosts.contains_key(id) {
                return Err(AxisError::not_found("Database host not found"));
            }
            let count = d.databases.values().filter(|db| db.host_id == id).count();
            if count > 0 {
                return Err(AxisError::conflict(format!("Host still has {} database(s)", count)));
            }
            d.database_hosts.remove(id);
            Ok(())
        })
    }

    // ─── Server databases ───

    pub fn list(&self, server_id: &str) -> Vec<ServerDatabase> {
        self.store.read(|d| d.databases.values().filter(|db| db.server_id == server_id).cloned().collect())
    }

    pub fn database(&self, server_id: &str, db_id: &str) -> Result<ServerDatabase> {
        self.get(server_id, db_id).map(|(db, _)| db)
    }

    fn get(&self, server_id: &str, db_id: &str) -> Result<(ServerDatabase, DatabaseHost)> {
        self.store.read(|d| {
            let db = d.databases.get(db_id)
                .filter(|db| db.server_id == server_id)
                .ok_or_else(|| AxisError::not_found("Database not found"))?;
            let host = d.database_hosts.get(&db.host_id)
                .ok_or_else(|| AxisError::not_found("Database host not found"))?;
            Ok((db.clone(), host.clone()))
        })
    }

    pub async fn create(&self, server_id: &str, host_id: &str, name: &str) -> Result<ServerDatabase> {
        if name.trim().is_empty() {
            return Err(AxisError::invalid("Database name is required"));
        }
        self.store.server(server_id)?;
        let (db_name, username) = derive_names(server_id, name.trim());
        let host = self.store.read(|d| {
            let host = d.database_hosts.get(host_id).ok_or_else(|| AxisError::not_found("Database host not found"))?;
            let used = d.databases.values().filter(|db| db.host_id == host_id).count();
            if host.max_databases > 0 && used >= host.max_databases as usize {
                return Err(AxisError::conflict(format!("Database host {} is full ({} of {})", host.name, used, host.max_databases)));
            }
            if d.databases.values().any(|db| db.host_id == host_id && db.db_name == db_name) {
                return Err(AxisError::conflict(format!("Database {} already exists", db_name)));
            }
            Ok(host.clone())
        })?;

        let password = new_password();
        if let Err((done, e)) = self.sql.execute(&host, &create_statements(&db_name, &username, &password)).await {
            warn!("Creating {} on {} failed after {} step(s): {}", db_name, host.name, done, e);
            let undo = rollback_statements(&db_name, &username, done);
            if !undo.is_empty() {
                if let Err((_, re)) = self.sql.execute(&host, &undo).await {
                    warn!("Rollback of {} on {} failed: {}", db_name, host.name, re);
                }
            }
            return Err(e);
        }

        let db = ServerDatabase {
            id: new_id(),
            server_id: server_id.to_string(),
            host_id: host_id.to_string(),
            name: name.trim().to_string(),
            db_name,
            username,
            password,
            created_at: Utc::now(),
        };
        self.store.write(|d| {
            d.databases.insert(db.id.clone(), db.clone());
            Ok(())
        })?;
        info!("Database {} created on {} for {}", db.db_name, host.name, server_id);
        Ok(db)
    }

    pub async fn delete(&self, server_id: &str, db_id: &str) -> Result<()> {
        let (db, host) = self.get(server_id, db_id)?;
        let drops = rollback_statements(&db.db_name, &db.username, 2);
        self.sql.execute(&host, &drops).await.map_err(|(_, e)| e)?;
        self.store.write(|d| {
            d.databases.remove(db_id);
            Ok(())
        })?;
        info!("Database {} dropped from {}", db.db_name, host.name);
        Ok(())
    }

    /// Drop every database a server owns; used when the server is deleted
    pub async fn delete_all(&self, server_id: &str) {
        for db in self.list(server_id) {
            if let Err(e) = self.delete(server_id, &db.id).await {
                warn!("Could not drop database {} of {}: {}", db.db_name, server_id, e);
            }
        }
    }

    pub async fn rotate_password(&self, server_id: &str, db_id: &str) -> Result<ServerDatabase> {
        let (db, host) = self.get(server_id, db_id)?;
        let password = new_password();
        let alter = vec![
            format!("ALTER USER '{}'@'%' IDENTIFIED BY '{}'", db.username, password),
            "FLUSH PRIVILEGES".to_string(),
        ];
        self.sql.execute(&host, &alter).await.map_err(|(_, e)| e)?;
        let updated = self.store.write(|d| {
            let row = d.databases.get_mut(db_id).ok_or_else(|| AxisError::not_found("Database not found"))?;
            row.password = password;
            Ok(row.clone())
        })?;
        info!("Password rotated for {} on {}", db.username, host.name);
        Ok(updated)
    }
}
