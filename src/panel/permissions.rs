// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Per-server authorization and per-user resource quotas

use super::store::{PanelData, User};
use crate::config::DefaultLimits;
use crate::error::{AxisError, Result};

pub const CONSOLE_READ: &str = "console.read";
pub const CONSOLE_WRITE: &str = "console.write";
pub const POWER_START: &str = "power.start";
pub const POWER_STOP: &str = "power.stop";
pub const POWER_RESTART: &str = "power.restart";
pub const POWER_KILL: &str = "power.kill";
pub const REINSTALL: &str = "reinstall";
pub const FILE_LIST: &str = "file.list";
pub const FILE_READ: &str = "file.read";
pub const FILE_WRITE: &str = "file.write";
pub const FILE_CREATE: &str = "file.create";
pub const FILE_DELETE: &str = "file.delete";
pub const FILE_UPLOAD: &str = "file.upload";
pub const FILE_DOWNLOAD: &str = "file.download";
pub const FILE_MOVE: &str = "file.move";
pub const FILE_COPY: &str = "file.copy";
pub const FILE_COMPRESS: &str = "file.compress";
pub const FILE_DECOMPRESS: &str = "file.decompress";
pub const BACKUP_LIST: &str = "backup.list";
pub const BACKUP_CREATE: &str = "backup.create";
pub const BACKUP_DELETE: &str = "backup.delete";
pub const BACKUP_DOWNLOAD: &str = "backup.download";
pub const BACKUP_RESTORE: &str = "backup.restore";
pub const DATABASE_VIEW: &str = "database.view";
pub const DATABASE_CREATE: &str = "database.create";
pub const DATABASE_UPDATE: &str = "database.update";
pub const DATABASE_DELETE: &str = "database.delete";
pub const SCHEDULE_LIST: &str = "schedule.list";
pub const SCHEDULE_CREATE: &str = "schedule.create";
pub const SCHEDULE_UPDATE: &str = "schedule.update";
pub const SCHEDULE_DELETE: &str = "schedule.delete";
pub const SCHEDULE_RUN: &str = "schedule.run";
pub const SETTINGS_RENAME: &str = "settings.rename";
pub const SETTINGS_RESOURCES: &str = "settings.resources";
pub const STARTUP_UPDATE: &str = "startup.update";
pub const ALLOCATION_READ: &str = "allocation.read";
pub const ALLOCATION_UPDATE: &str = "allocation.update";
pub const ACTIVITY_VIEW: &str = "activity.view";

/// Everything a sub-user can be granted. `allocation.*` style grants are
/// also accepted and cover the whole namespace.
pub const ALL_PERMISSIONS: &[&str] = &[
    CONSOLE_READ, CONSOLE_WRITE,
    POWER_START, POWER_STOP, POWER_RESTART, POWER_KILL, REINSTALL,
    FILE_LIST, FILE_READ, FILE_WRITE, FILE_CREATE, FILE_DELETE,
    FILE_UPLOAD, FILE_DOWNLOAD, FILE_MOVE, FILE_COPY,
    FILE_COMPRESS, FILE_DECOMPRESS,
    BACKUP_LIST, BACKUP_CREATE, BACKUP_DELETE, BACKUP_DOWNLOAD, BACKUP_RESTORE,
    DATABASE_VIEW, DATABASE_CREATE, DATABASE_UPDATE, DATABASE_DELETE,
    SCHEDULE_LIST, SCHEDULE_CREATE, SCHEDULE_UPDATE, SCHEDULE_DELETE, SCHEDULE_RUN,
    SETTINGS_RENAME, SETTINGS_RESOURCES, STARTUP_UPDATE,
    ALLOCATION_READ, ALLOCATION_UPDATE, ACTIVITY_VIEW,
];

fn grants(granted: &str, perm: &str) -> bool {
    match granted.strip_suffix(".*") {
        Some(ns) => perm.strip_prefix(ns).is_some_and(|rest| rest.starts_with('.')),
        None => granted == perm,
    }
}

/// Admin, owner, or a sub-user holding `perm`
pub fn has_server_permission(data: &PanelData, user: &User, server_id: &str, perm: &str) -> bool {
    if user.is_admin {
        return true;
    }
    let Some(server) = data.servers.get(server_id) else { return false };
    if server.owner_id == user.id {
        return true;
    }
    data.subuser(server_id, &user.id)
        .map(|s| s.permissions.iter().any(|g| grants(g, perm)))
        .unwrap_or(false)
}

/// Whether the server shows up for this user at all
pub fn can_see_server(data: &PanelData, user: &User, server_id: &str) -> bool {
    if user.is_admin {
        return data.servers.contains_key(server_id);
    }
    match data.servers.get(server_id) {
        Some(s) if s.owner_id == user.id => true,
        Some(_) => data.subuser(server_id, &user.id).is_some(),
        None => false,
    }
}

/// Reject unknown permission tokens before storing them on a sub-user
pub fn validate_permissions(perms: &[String]) -> Result<()> {
    for p in perms {
        let known = match p.strip_suffix(".*") {
            Some(ns) => ALL_PERMISSIONS.iter().any(|k| k.starts_with(ns) && k[ns.len()..].starts_with('.')),
            None => ALL_PERMISSIONS.contains(&p.as_str()),
        };
        if !known {
            return Err(AxisError::invalid(format!("Unknown permission: {}", p)));
        }
    }
    Ok(())
}

#[derive(Debug, Default, PartialEq)]
pub struct Usage {
    pub ram: u64,
    pub cpu: u64,
    pub disk: u64,
    pub servers: u64,
}

pub fn usage(data: &PanelData, user_id: &str) -> Usage {
    data.servers.values().filter(|s| s.owner_id == user_id).fold(Usage::default(), |mut u, s| {
        u.ram += s.memory;
        u.cpu += s.cpu;
        u.disk += s.disk;
        u.servers += 1;
        u
    })
}

/// Would one more server of this size push the user over any cap?
pub fn check_quota(data: &PanelData, user: &User, defaults: &DefaultLimits, memory: u64, cpu: u64, disk: u64) -> Result<()> {
    if user.is_admin {
        return Ok(());
    }
    let current = usage(data, &user.id);
    let limits = &user.limits;
    let checks = [
        ("memory", limits.ram.or(defaults.ram), current.ram + memory),
        ("cpu", limits.cpu.or(defaults.cpu), current.cpu + cpu),
        ("disk", limits.disk.or(defaults.disk), current.disk + disk),
        ("server count", limits.servers.or(defaults.servers), current.servers + 1),
    ];
    for (what, cap, wanted) in checks {
        if let Some(cap) = cap {
            if wanted > cap {
                return Err(AxisError::forbidden(format!("Quota exceeded: {} ({} of {})", what, wanted, cap)));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panel::store::tests::seeded;
    use crate::panel::store::{new_id, SubUser};

    #[test]
    fn owner_admin_and_subuser() {
        let store = seeded();
        store.add_subuser(SubUser {
            id: new_id(),
            server_id: "s1".into(),
            user_id: "bob".into(),
            permissions: vec![CONSOLE_READ.into(), "file.*".into()],
        }).unwrap();

        store.read(|d| {
            let alice = &d.users["alice"];
            let bob = &d.users["bob"];
            let root = &d.users["root"];
            assert!(has_server_permission(d, alice, "s1", POWER_KILL));
            assert!(has_server_permission(d, root, "s1", POWER_KILL));
            assert!(has_server_permission(d, bob, "s1", CONSOLE_READ));
            assert!(has_server_permission(d, bob, "s1", FILE_DELETE));
            assert!(!has_server_permission(d, bob, "s1", CONSOLE_WRITE));
            assert!(!has_server_permission(d, bob, "missing", CONSOLE_READ));
            assert!(can_see_server(d, bob, "s1"));
        });
    }

    #[test]
    fn wildcard_needs_a_dot_boundary() {
        assert!(grants("file.*", "file.read"));
        assert!(!grants("file.*", "filesystem.read"));
        assert!(!grants("file.*", "file"));
    }

    #[test]
    fn permission_tokens_are_checked() {
        assert!(validate_permissions(&["console.read".into(), "allocation.*".into()]).is_ok());
        assert!(validate_permissions(&["console.sudo".into()]).is_err());
        assert!(validate_permissions(&["nope.*".into()]).is_err());
    }

    #[test]
    fn quotas() {
        let store = seeded();
        store.read(|d| {
            let alice = d.users["alice"].clone();
            let defaults = DefaultLimits { ram: Some(4096), cpu: None, disk: None, servers: Some(2) };
            // s1 already uses 2048 MiB
            assert!(check_quota(d, &alice, &defaults, 2048, 100, 1000).is_ok());
            assert!(matches!(check_quota(d, &alice, &defaults, 2049, 100, 1000), Err(AxisError::Forbidden(_))));

            let mut raised = alice.clone();
            raised.limits.ram = Some(8192);
            assert!(check_quota(d, &raised, &defaults, 4096, 100, 1000).is_ok());

            let root = d.users["root"].clone();
            assert!(check_quota(d, &root, &defaults, 1 << 20, 0, 0).is_ok());
        });
    }
}
