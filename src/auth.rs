//! Authentication and table-level permissions
//!
//! Permissions are independent bit flags; granting READ and WRITE never
//! implies DELETE.

use std::collections::HashMap;
use std::sync::RwLock;

use bitflags::bitflags;

use crate::error::{Error, Result};

bitflags! {
    /// Table-level permission set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permission: u32 {
        const READ   = 1 << 0;
        const WRITE  = 1 << 1;
        const DELETE = 1 << 2;
        const DDL    = 1 << 3;
        const GRANT  = 1 << 4;
    }
}

/// User credentials known to the gateway. An empty map accepts any user
/// with an empty password, matching the out-of-the-box experience.
#[derive(Default)]
pub struct Authenticator {
    users: HashMap<String, String>,
}

impl Authenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user: &str, password: &str) -> Self {
        self.users.insert(user.to_string(), password.to_string());
        self
    }

    /// Password to verify the scrambled auth response against.
    pub fn password_for(&self, user: &str) -> Option<&str> {
        if self.users.is_empty() {
            // Open mode: any user, empty password.
            return Some("");
        }
        self.users.get(user).map(String::as_str)
    }
}

/// Per-user, per-table ACL. When no grants exist at all the gateway runs
/// open; the first grant turns enforcement on.
#[derive(Default)]
pub struct AccessControl {
    grants: RwLock<HashMap<String, HashMap<String, Permission>>>,
}

impl AccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, user: &str, table: &str, permission: Permission) {
        let mut grants = self.grants.write().unwrap();
        let entry = grants
            .entry(user.to_string())
            .or_default()
            .entry(table.to_string())
            .or_insert(Permission::empty());
        *entry |= permission;
    }

    pub fn revoke(&self, user: &str, table: &str, permission: Permission) {
        let mut grants = self.grants.write().unwrap();
        if let Some(tables) = grants.get_mut(user) {
            if let Some(entry) = tables.get_mut(table) {
                *entry &= !permission;
                if entry.is_empty() {
                    tables.remove(table);
                }
            }
        }
    }

    pub fn has_permission(&self, user: &str, permission: Permission, table: &str) -> bool {
        let grants = self.grants.read().unwrap();
        if grants.is_empty() {
            return true;
        }
        grants
            .get(user)
            .and_then(|tables| tables.get(table))
            .is_some_and(|granted| granted.contains(permission))
    }

    pub fn enforcing(&self) -> bool {
        !self.grants.read().unwrap().is_empty()
    }

    pub fn check(&self, user: &str, permission: Permission, table: &str) -> Result<()> {
        if self.has_permission(user, permission, table) {
            Ok(())
        } else {
            Err(Error::ReadOnly(format!(
                "user '{user}' lacks {permission:?} on '{table}'"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_are_independent_bits() {
        assert_eq!(Permission::READ.bits(), 1);
        assert_eq!(Permission::WRITE.bits(), 2);
        assert_eq!(Permission::DELETE.bits(), 4);
        assert_eq!(Permission::DDL.bits(), 8);
        assert_eq!(Permission::GRANT.bits(), 16);
    }

    #[test]
    fn test_read_write_does_not_imply_delete() {
        let acl = AccessControl::new();
        acl.grant("alice", "users", Permission::READ | Permission::WRITE);
        assert!(acl.has_permission("alice", Permission::READ, "users"));
        assert!(acl.has_permission("alice", Permission::WRITE, "users"));
        assert!(!acl.has_permission("alice", Permission::DELETE, "users"));
    }

    #[test]
    fn test_revoke_clears_single_bit() {
        let acl = AccessControl::new();
        acl.grant("alice", "users", Permission::READ | Permission::WRITE);
        acl.revoke("alice", "users", Permission::WRITE);
        assert!(acl.has_permission("alice", Permission::READ, "users"));
        assert!(!acl.has_permission("alice", Permission::WRITE, "users"));
    }

    #[test]
    fn test_open_mode_until_first_grant() {
        let acl = AccessControl::new();
        assert!(acl.has_permission("anyone", Permission::DELETE, "users"));
        acl.grant("alice", "users", Permission::READ);
        assert!(!acl.has_permission("bob", Permission::READ, "users"));
    }

    #[test]
    fn test_authenticator_open_mode() {
        let auth = Authenticator::new();
        assert_eq!(auth.password_for("root"), Some(""));
        let auth = Authenticator::new().with_user("root", "secret");
        assert_eq!(auth.password_for("root"), Some("secret"));
        assert_eq!(auth.password_for("mallory"), None);
    }
}
