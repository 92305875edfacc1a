//! Caller authorization.
//!
//! Permissions are derived from a user's group membership, looked up through a
//! [`UserDirectory`] and cached per uid for a configurable time.

use std::collections::HashMap;
use std::ffi::CString;
use std::time::{Duration, Instant};

use nix::unistd::{getgrouplist, Uid, User};

use crate::config::PermissionConfig;
use crate::error::{JobdError, Result};

/// Bitmask of command permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions(u8);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);
    pub const READ: Permissions = Permissions(0x01);
    pub const WRITE: Permissions = Permissions(0x02);
    pub const QUEUE: Permissions = Permissions(0x04);
    pub const SETUID: Permissions = Permissions(0x08);
    pub const ALL: Permissions = Permissions(0x0f);

    pub const fn union(self, other: Permissions) -> Permissions {
        Permissions(self.0 | other.0)
    }

    pub fn contains(self, required: Permissions) -> bool {
        self.0 & required.0 == required.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl std::ops::BitOr for Permissions {
    type Output = Permissions;

    fn bitor(self, rhs: Permissions) -> Permissions {
        self.union(rhs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAccount {
    pub uid: u32,
    pub name: String,
    /// Primary and supplementary group ids.
    pub groups: Vec<u32>,
}

/// Source of system accounts.
pub trait UserDirectory: Send {
    fn lookup(&self, uid: u32) -> Option<UserAccount>;
}

/// Accounts resolved through the system user database, so NSS sources such
/// as LDAP or sssd apply.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemUsers;

impl UserDirectory for SystemUsers {
    fn lookup(&self, uid: u32) -> Option<UserAccount> {
        let user = match User::from_uid(Uid::from_raw(uid)) {
            Ok(Some(user)) => user,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(uid, error = %e, "User lookup failed");
                return None;
            }
        };

        let mut groups = vec![user.gid.as_raw()];
        let supplementary = CString::new(user.name.as_str())
            .map_err(|e| e.to_string())
            .and_then(|name| getgrouplist(&name, user.gid).map_err(|e| e.to_string()));
        match supplementary {
            Ok(gids) => {
                for gid in gids.into_iter().map(|g| g.as_raw()) {
                    if !groups.contains(&gid) {
                        groups.push(gid);
                    }
                }
            }
            Err(e) => tracing::warn!(uid, user = %user.name, error = %e, "Group lookup failed"),
        }

        Some(UserAccount {
            uid,
            name: user.name,
            groups,
        })
    }
}

/// Fixed in-memory accounts.
#[derive(Debug, Clone, Default)]
pub struct StaticUsers {
    users: HashMap<u32, UserAccount>,
}

impl StaticUsers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, uid: u32, name: impl Into<String>, groups: Vec<u32>) -> Self {
        self.users.insert(
            uid,
            UserAccount {
                uid,
                name: name.into(),
                groups,
            },
        );
        self
    }
}

impl UserDirectory for StaticUsers {
    fn lookup(&self, uid: u32) -> Option<UserAccount> {
        self.users.get(&uid).cloned()
    }
}

#[derive(Debug)]
struct CachedPermissions {
    permissions: Permissions,
    loaded_at: Instant,
}

/// Per-uid permission sets, loaded lazily and reloaded once stale.
#[derive(Debug)]
pub struct PermissionCache {
    config: PermissionConfig,
    ttl: Duration,
    entries: HashMap<u32, CachedPermissions>,
}

impl PermissionCache {
    pub fn new(config: PermissionConfig) -> Self {
        let ttl = Duration::from_secs(config.cache_ttl_secs);
        Self {
            config,
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn permissions(&mut self, uid: u32, users: &dyn UserDirectory) -> Permissions {
        if uid == 0 {
            return Permissions::ALL;
        }

        if let Some(cached) = self.entries.get(&uid) {
            if cached.loaded_at.elapsed() < self.ttl {
                return cached.permissions;
            }
        }

        let permissions = match users.lookup(uid) {
            Some(account) => self.resolve(&account.groups),
            None => Permissions::NONE,
        };
        tracing::debug!(uid, permissions = permissions.bits(), "Loaded permissions");

        self.entries.insert(
            uid,
            CachedPermissions {
                permissions,
                loaded_at: Instant::now(),
            },
        );
        permissions
    }

    /// Fail with `PermissionDenied` unless `uid` holds every bit of `required`.
    pub fn authorize(
        &mut self,
        uid: u32,
        required: Permissions,
        users: &dyn UserDirectory,
    ) -> Result<Permissions> {
        let held = self.permissions(uid, users);
        if held.contains(required) {
            Ok(held)
        } else {
            tracing::info!(uid, required = required.bits(), held = held.bits(), "Permission denied");
            Err(JobdError::PermissionDenied)
        }
    }

    fn resolve(&self, groups: &[u32]) -> Permissions {
        let member = |allowed: &[u32]| groups.iter().any(|g| allowed.contains(g));

        let mut permissions = Permissions::NONE;
        if member(&self.config.read_groups) {
            permissions = permissions | Permissions::READ;
        }
        if member(&self.config.write_groups) {
            permissions = permissions | Permissions::WRITE;
        }
        if member(&self.config.queue_groups) {
            permissions = permissions | Permissions::QUEUE;
        }
        if member(&self.config.setuid_groups) {
            permissions = permissions | Permissions::SETUID;
        }
        permissions
    }
}
