//! Guest and ownership rules.
//!
//! Authentication happens elsewhere; the engine receives identity strings and
//! asks an [`AuthProvider`] whether one of them is an administrator.

use std::collections::HashSet;

use crate::core::Allocation;

/// Role lookup supplied by the identity layer.
pub trait AuthProvider: Send + Sync {
    /// True if `identity` holds the admin role.
    fn is_admin(&self, identity: &str) -> bool;
}

/// Fixed set of administrators, typically loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticRoles {
    admins: HashSet<String>,
}

impl StaticRoles {
    /// Create a provider that treats `admins` as administrators.
    pub fn new<I, S>(admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            admins: admins.into_iter().map(Into::into).collect(),
        }
    }
}

impl AuthProvider for StaticRoles {
    fn is_admin(&self, identity: &str) -> bool {
        self.admins.contains(identity)
    }
}

/// Rule (a): creator, owner or admin may destroy the allocation.
pub fn may_release(alloc: &Allocation, caller: &str, auth: &dyn AuthProvider) -> bool {
    alloc.is_creator_or_owner(caller) || auth.is_admin(caller)
}

/// Rule (b): creator, owner or admin may add or remove any guest.
pub fn may_manage_guests(alloc: &Allocation, caller: &str, auth: &dyn AuthProvider) -> bool {
    alloc.is_creator_or_owner(caller) || auth.is_admin(caller)
}

/// Rule (c): a guest may remove only itself; managers may remove anyone.
pub fn may_remove_guest(
    alloc: &Allocation,
    caller: &str,
    guest: &str,
    auth: &dyn AuthProvider,
) -> bool {
    caller == guest || may_manage_guests(alloc, caller, auth)
}

/// Keepalive is reserved to creator, owner and admin; guests do not keep an
/// allocation alive.
pub fn may_keepalive(alloc: &Allocation, caller: &str, auth: &dyn AuthProvider) -> bool {
    alloc.is_creator_or_owner(caller) || auth.is_admin(caller)
}

/// Anyone with a stake in the allocation may read it.
pub fn may_query(alloc: &Allocation, caller: &str, auth: &dyn AuthProvider) -> bool {
    alloc.is_creator_or_owner(caller) || alloc.is_guest(caller) || auth.is_admin(caller)
}
