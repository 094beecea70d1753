//! Reconcile local accounts with Cloudflare's forwarding rules
//!
//! Cloudflare is authoritative for which addresses exist and whether they are enabled.
//! A sync run adds accounts for unknown routes, removes accounts without a route, mirrors the
//! `enabled` flag into the account status, and backfills missing passwords. Each item is
//! handled on its own so one failure never aborts the run.

use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use tracing::{error, info};

use super::types::EmailRoute;
use super::RouteProvider;
use crate::error::Result;
use crate::generator::random_password;
use crate::store::{
    Account, AccountStatus, AccountUpdate, ActivityKind, Database, NewAccount,
};

/// Address extracted from a forwarding rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudAccount {
    pub email: String,
    pub username: String,
    pub domain: String,
    pub enabled: bool,
    pub route_id: String,
}

impl CloudAccount {
    /// Extract the routed address, keeping only configured domains
    pub fn from_route(route: &EmailRoute, domains: &HashSet<String>) -> Option<Self> {
        let email = route.recipient()?;
        let (username, domain) = email.split_once('@')?;
        if !domains.contains(domain) {
            return None;
        }
        Some(Self {
            username: username.to_string(),
            domain: domain.to_string(),
            email: email.clone(),
            enabled: route.enabled,
            route_id: route.id.clone(),
        })
    }
}

/// Disjoint work sets of one sync run
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    pub to_add: Vec<CloudAccount>,
    pub to_remove: Vec<Account>,
    /// Accounts whose status differs from their route, with the status to apply
    pub to_update: Vec<(Account, AccountStatus)>,
}

/// Partition routes `R` and local accounts `L` into `R \ L`, `L \ R` and the status
/// mismatches within `R ∩ L`.
///
/// Accounts on a domain listed in `skipped_domains` are never removed, since their routes
/// could not be listed.
pub fn plan_sync(
    cloud: &[CloudAccount],
    local: &[Account],
    skipped_domains: &HashSet<String>,
) -> SyncPlan {
    let cloud_by_email: HashMap<&str, &CloudAccount> =
        cloud.iter().map(|c| (c.email.as_str(), c)).collect();
    let local_emails: HashSet<String> = local.iter().map(|a| a.email.to_lowercase()).collect();

    let mut plan = SyncPlan::default();
    let mut queued = HashSet::new();

    for account in cloud {
        if !local_emails.contains(&account.email) && queued.insert(account.email.as_str()) {
            plan.to_add.push(account.clone());
        }
    }

    for account in local {
        let email = account.email.to_lowercase();
        match cloud_by_email.get(email.as_str()) {
            None if skipped_domains.contains(&account.domain) => {}
            None => plan.to_remove.push(account.clone()),
            Some(route) => {
                let wanted = AccountStatus::from_enabled(route.enabled);
                if account.status != wanted {
                    plan.to_update.push((account.clone(), wanted));
                }
            }
        }
    }

    plan
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub success: bool,
    pub added: usize,
    pub removed: usize,
    /// Distinct accounts touched by the password or status pass
    pub updated: usize,
    pub updated_password: usize,
    pub updated_status: usize,
    pub failures: Vec<String>,
    pub message: String,
}

/// Run one reconciliation against `routes`.
///
/// Only a failure to list routes at all is returned as an error; item failures are
/// collected in the report.
pub async fn sync_accounts(db: &Database, routes: &dyn RouteProvider) -> Result<SyncReport> {
    info!("Starting Cloudflare account sync");

    let domains: HashSet<String> = routes.virtual_domains().await.into_iter().collect();
    let listing = routes.list_routes().await?;
    let skipped: HashSet<String> = listing.failed_domains.iter().cloned().collect();

    let cloud: Vec<CloudAccount> = listing
        .routes
        .iter()
        .filter_map(|route| CloudAccount::from_route(route, &domains))
        .collect();
    let local = db.all_accounts().await?;

    let plan = plan_sync(&cloud, &local, &skipped);
    info!(
        "Sync plan: {} to add, {} to remove, {} to update",
        plan.to_add.len(),
        plan.to_remove.len(),
        plan.to_update.len()
    );

    let mut report = SyncReport::default();
    let mut touched = HashSet::new();

    for account in &plan.to_add {
        let new_account = NewAccount {
            email: account.email.clone(),
            username: account.username.clone(),
            domain: account.domain.clone(),
            password: None,
            status: AccountStatus::from_enabled(account.enabled),
            notes: Some("synced from Cloudflare".to_string()),
        };
        match db.create_account(new_account).await {
            Ok(_) => report.added += 1,
            Err(e) => {
                error!("Sync failed to add {}: {}", account.email, e);
                report.failures.push(format!("add {}: {}", account.email, e));
            }
        }
    }

    for account in &plan.to_remove {
        match db.delete_account(account.id).await {
            Ok(_) => report.removed += 1,
            Err(e) => {
                error!("Sync failed to remove {}: {}", account.email, e);
                report.failures.push(format!("remove {}: {}", account.email, e));
            }
        }
    }

    for (account, status) in &plan.to_update {
        match db.set_account_status(account.id, *status).await {
            Ok(_) => {
                report.updated_status += 1;
                touched.insert(account.id);
            }
            Err(e) => {
                error!("Sync failed to update {}: {}", account.email, e);
                report.failures.push(format!("update {}: {}", account.email, e));
            }
        }
    }

    // Password backfill covers accounts created before passwords were generated
    for account in db.all_accounts().await? {
        if account.password.as_deref().is_some_and(|p| !p.is_empty()) {
            continue;
        }
        let update = AccountUpdate {
            password: Some(random_password(12)),
            ..Default::default()
        };
        match db.update_account(account.id, update).await {
            Ok(_) => {
                report.updated_password += 1;
                touched.insert(account.id);
            }
            Err(e) => {
                error!("Sync failed to set password for {}: {}", account.email, e);
                report
                    .failures
                    .push(format!("password {}: {}", account.email, e));
            }
        }
    }

    report.updated = touched.len();
    report.success = true;
    report.message = format!(
        "Sync finished: {} added, {} removed, {} updated",
        report.added, report.removed, report.updated
    );
    if !skipped.is_empty() {
        report.message.push_str(&format!(
            " (listing failed for {})",
            listing.failed_domains.join(", ")
        ));
    }

    db.record_activity(
        ActivityKind::AccountSync,
        report.message.clone(),
        None,
        Some(json!({
            "added": report.added,
            "removed": report.removed,
            "updated": report.updated,
            "updatedPassword": report.updated_password,
            "updatedStatus": report.updated_status,
            "failures": report.failures.len(),
        })),
    )
    .await;

    info!("{}", report.message);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudflare::types::Matcher;
    use crate::cloudflare::{MockRouteProvider, RouteListing};

    fn route(id: &str, email: &str, enabled: bool) -> EmailRoute {
        EmailRoute {
            id: id.to_string(),
            name: None,
            enabled,
            matchers: vec![Matcher::literal_to(email)],
            actions: vec![],
            priority: None,
            domain: email.split('@').nth(1).unwrap_or_default().to_string(),
        }
    }

    fn account(id: i64, email: &str, status: AccountStatus) -> Account {
        let (username, domain) = email.split_once('@').unwrap();
        Account {
            id,
            email: email.to_string(),
            username: username.to_string(),
            domain: domain.to_string(),
            password: Some("secret".to_string()),
            created_at: 0,
            last_accessed: None,
            status,
            notes: None,
        }
    }

    fn cloud(email: &str, enabled: bool) -> CloudAccount {
        let domains: HashSet<String> = ["example.com".to_string()].into();
        CloudAccount::from_route(&route("r", email, enabled), &domains).unwrap()
    }

    #[test]
    fn test_from_route_filters_domains() {
        let domains: HashSet<String> = ["example.com".to_string()].into();
        assert!(CloudAccount::from_route(&route("1", "a@example.com", true), &domains).is_some());
        assert!(CloudAccount::from_route(&route("2", "a@other.com", true), &domains).is_none());
    }

    #[test]
    fn test_plan_partitions_sets() {
        let cloud = vec![
            cloud("new@example.com", true),
            cloud("same@example.com", true),
            cloud("flip@example.com", false),
        ];
        let local = vec![
            account(1, "same@example.com", AccountStatus::Active),
            account(2, "flip@example.com", AccountStatus::Active),
            account(3, "gone@example.com", AccountStatus::Active),
        ];

        let plan = plan_sync(&cloud, &local, &HashSet::new());

        let added: Vec<&str> = plan.to_add.iter().map(|c| c.email.as_str()).collect();
        let removed: Vec<&str> = plan.to_remove.iter().map(|a| a.email.as_str()).collect();
        assert_eq!(added, vec!["new@example.com"]);
        assert_eq!(removed, vec!["gone@example.com"]);
        assert_eq!(plan.to_update.len(), 1);
        assert_eq!(plan.to_update[0].0.email, "flip@example.com");
        assert_eq!(plan.to_update[0].1, AccountStatus::Inactive);
    }

    #[test]
    fn test_plan_sets_are_disjoint() {
        let cloud: Vec<CloudAccount> = (0..6)
            .map(|i| cloud(&format!("u{}@example.com", i), i % 2 == 0))
            .collect();
        let local: Vec<Account> = (3..9)
            .map(|i| account(i, &format!("u{}@example.com", i), AccountStatus::Active))
            .collect();

        let plan = plan_sync(&cloud, &local, &HashSet::new());

        let cloud_set: HashSet<&str> = cloud.iter().map(|c| c.email.as_str()).collect();
        let local_set: HashSet<&str> = local.iter().map(|a| a.email.as_str()).collect();
        let add: HashSet<&str> = plan.to_add.iter().map(|c| c.email.as_str()).collect();
        let remove: HashSet<&str> = plan.to_remove.iter().map(|a| a.email.as_str()).collect();

        assert_eq!(add, cloud_set.difference(&local_set).copied().collect());
        assert_eq!(remove, local_set.difference(&cloud_set).copied().collect());
        assert!(add.is_disjoint(&remove));
        for (account, _) in &plan.to_update {
            assert!(cloud_set.contains(account.email.as_str()));
            assert!(local_set.contains(account.email.as_str()));
        }
        // u3 and u5 are disabled in Cloudflare but active locally
        assert_eq!(plan.to_update.len(), 2);
    }

    #[test]
    fn test_plan_keeps_accounts_of_failed_domains() {
        let local = vec![account(1, "keep@example.com", AccountStatus::Active)];
        let skipped: HashSet<String> = ["example.com".to_string()].into();

        let plan = plan_sync(&[], &local, &skipped);
        assert!(plan.to_remove.is_empty());
    }

    #[tokio::test]
    async fn test_sync_applies_plan() {
        let db = Database::in_memory().await.unwrap();
        db.create_account(NewAccount::from_email("gone@example.com").unwrap())
            .await
            .unwrap();
        db.create_account(NewAccount::from_email("flip@example.com").unwrap())
            .await
            .unwrap();

        let mut routes = MockRouteProvider::new();
        routes
            .expect_virtual_domains()
            .returning(|| vec!["example.com".to_string()]);
        routes.expect_list_routes().times(1).returning(|| {
            Ok(RouteListing {
                routes: vec![
                    route("1", "new@example.com", true),
                    route("2", "flip@example.com", false),
                    route("3", "stray@other.com", true),
                ],
                failed_domains: vec![],
            })
        });

        let report = sync_accounts(&db, &routes).await.unwrap();

        assert!(report.success);
        assert_eq!(report.added, 1);
        assert_eq!(report.removed, 1);
        assert_eq!(report.updated_status, 1);
        assert_eq!(report.updated, 1);
        assert!(report.failures.is_empty());

        let added = db.account_by_email("new@example.com").await.unwrap().unwrap();
        assert!(added.password.is_some());
        assert_eq!(added.notes.as_deref(), Some("synced from Cloudflare"));
        assert!(db.account_by_email("gone@example.com").await.unwrap().is_none());
        assert!(db.account_by_email("stray@other.com").await.unwrap().is_none());
        let flipped = db.account_by_email("flip@example.com").await.unwrap().unwrap();
        assert_eq!(flipped.status, AccountStatus::Inactive);

        let runs = db
            .activities_by_type(ActivityKind::AccountSync, 5)
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn test_sync_is_stable_on_second_run() {
        let db = Database::in_memory().await.unwrap();
        let mut routes = MockRouteProvider::new();
        routes
            .expect_virtual_domains()
            .returning(|| vec!["example.com".to_string()]);
        routes.expect_list_routes().times(2).returning(|| {
            Ok(RouteListing {
                routes: vec![route("1", "a@example.com", true)],
                failed_domains: vec![],
            })
        });

        let first = sync_accounts(&db, &routes).await.unwrap();
        let second = sync_accounts(&db, &routes).await.unwrap();

        assert_eq!(first.added, 1);
        assert_eq!((second.added, second.removed, second.updated), (0, 0, 0));
    }
}
