//! Cloudflare Email Routing: API client, route abstraction and account sync

pub mod client;
pub mod sync;
pub mod types;

pub use client::EmailRouter;
pub use sync::{plan_sync, sync_accounts, CloudAccount, SyncPlan, SyncReport};
pub use types::{EmailRoute, Matcher, RouteListing};

use async_trait::async_trait;

use crate::error::{CloudMailError, Result};

/// Source of truth for forwarding rules.
///
/// [`EmailRouter`] talks to Cloudflare; tests plug in fakes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RouteProvider: Send + Sync {
    /// Create a forwarding rule for `email`, returning the rule id
    async fn create_route(&self, email: &str) -> Result<String>;

    async fn remove_route(&self, route_id: &str, domain: &str) -> Result<()>;

    /// Rules of every configured domain
    async fn list_routes(&self) -> Result<RouteListing>;

    /// Replace a rule with the given `enabled` flag
    async fn update_route(&self, route: &EmailRoute, enabled: bool) -> Result<()>;

    /// Configured mail domains
    async fn virtual_domains(&self) -> Vec<String>;

    async fn find_route(&self, email: &str) -> Result<Option<EmailRoute>> {
        let email = email.trim().to_lowercase();
        let listing = self.list_routes().await?;
        Ok(listing
            .routes
            .into_iter()
            .find(|route| route.recipient().as_deref() == Some(email.as_str())))
    }

    /// Enable or disable the rule of `email`. Returns whether anything changed.
    async fn set_route_enabled(&self, email: &str, enabled: bool) -> Result<bool> {
        let route = self
            .find_route(email)
            .await?
            .ok_or_else(|| CloudMailError::NotFound(format!("route for {}", email)))?;

        if route.enabled == enabled {
            return Ok(false);
        }
        self.update_route(&route, enabled).await?;
        Ok(true)
    }
}
