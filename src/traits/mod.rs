//! Trait definitions for mockable dependencies.
//!
//! This module defines traits for:
//! - [`GrantEngine`]: The engine-side principal and grant adapter
//! - [`AddressLookup`]: Public IP resolution for session reporting
//!
//! # Mocking
//!
//! Both traits are annotated with `#[cfg_attr(test, mockall::automock)]`
//! which generates mock implementations automatically for testing.
//!
//! The user policy table stays the source of truth; a [`GrantEngine`] only
//! holds derived state that can be rebuilt with
//! [`TeamStore::reconcile_grants`](crate::storage::TeamStore::reconcile_grants).

use async_trait::async_trait;

use crate::error::StoreError;
use crate::storage::GrantObject;

/// Engine-side login identities and the grants they hold.
///
/// Grants, revokes and drops are idempotent: granting twice or dropping a
/// missing principal succeeds. Creating an existing principal fails.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GrantEngine: Send + Sync {
    /// Create a login principal.
    ///
    /// Fails if the principal already exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the principal cannot be stored.
    async fn create_principal(&self, name: &str, passwd: &str) -> Result<(), StoreError>;

    /// Drop a principal together with every grant it holds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the engine rejects the change.
    async fn drop_principal(&self, name: &str) -> Result<(), StoreError>;

    /// Replace a principal's password.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the engine rejects the change.
    async fn set_password(&self, name: &str, passwd: &str) -> Result<(), StoreError>;

    /// Check a login against the stored principal.
    ///
    /// Returns `false` for unknown principals.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the engine cannot be queried.
    async fn verify_password(&self, name: &str, passwd: &str) -> Result<bool, StoreError>;

    /// Grant an object to a principal.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the engine rejects the grant.
    async fn grant(&self, grantee: &str, object: &GrantObject) -> Result<(), StoreError>;

    /// Revoke an object from a principal.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the engine rejects the revoke.
    async fn revoke(&self, grantee: &str, object: &GrantObject) -> Result<(), StoreError>;

    /// Revoke an object from every principal, returning how many grants went.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the engine rejects the revoke.
    async fn revoke_object(&self, object: &GrantObject) -> Result<u64, StoreError>;

    /// Every object currently granted to a principal, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the engine cannot be queried.
    async fn grants_for(&self, grantee: &str) -> Result<Vec<GrantObject>, StoreError>;

    /// Whether a principal holds a grant on an object.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the engine cannot be queried.
    async fn has_grant(&self, grantee: &str, object: &GrantObject) -> Result<bool, StoreError>;
}

/// Public address resolution.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AddressLookup: Send + Sync {
    /// Resolve the caller's public IP address.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AddressLookup`] if the lookup cannot complete.
    async fn public_ip(&self) -> Result<String, StoreError>;
}
