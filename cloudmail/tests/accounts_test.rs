//! Account lifecycle against a fake routing provider

mod common;

use cloudmail::error::CloudMailError;
use cloudmail::store::{AccountStatus, AccountUpdate, ActivityKind};
use common::{app_state, test_config, FakeRoutes};
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[tokio::test]
async fn test_provision_creates_route_and_account() {
    let routes = Arc::new(FakeRoutes::new(&["example.com"]));
    let (state, _dir) = app_state(routes.clone(), test_config(&["example.com"])).await;

    let account = state
        .provision_account("Swift42", "@example.com", None, Some("Swift Coder".to_string()))
        .await
        .unwrap();

    assert_eq!(account.email, "swift42@example.com");
    assert_eq!(account.domain, "example.com");
    assert_eq!(account.status, AccountStatus::Active);
    assert!(account.password.as_deref().is_some_and(|p| !p.is_empty()));

    let route = routes.route_for("swift42@example.com").unwrap();
    assert!(route.enabled);
    assert_eq!(route.actions[0].value, vec![common::FORWARD_TO.to_string()]);

    let activities = state
        .db
        .activities_by_type(ActivityKind::AccountCreate, 10)
        .await
        .unwrap();
    assert_eq!(activities.len(), 1);
}

#[tokio::test]
async fn test_provision_rejects_bad_input_before_touching_routes() {
    let routes = Arc::new(FakeRoutes::new(&["example.com"]));
    let (state, _dir) = app_state(routes.clone(), test_config(&["example.com"])).await;

    let bad_name = state
        .provision_account("not valid!", "example.com", None, None)
        .await;
    assert!(matches!(bad_name, Err(CloudMailError::Validation(_))));

    let unknown_domain = state
        .provision_account("swift42", "elsewhere.test", None, None)
        .await;
    assert!(matches!(unknown_domain, Err(CloudMailError::Validation(_))));

    state
        .provision_account("swift42", "example.com", None, None)
        .await
        .unwrap();
    let duplicate = state
        .provision_account("swift42", "example.com", None, None)
        .await;
    assert!(matches!(duplicate, Err(CloudMailError::Validation(_))));

    assert_eq!(routes.creates.load(Ordering::SeqCst), 1);
    assert_eq!(routes.routes().len(), 1);
}

#[tokio::test]
async fn test_generate_accounts() {
    let routes = Arc::new(FakeRoutes::new(&["example.com", "example.org"]));
    let (state, _dir) =
        app_state(routes.clone(), test_config(&["example.com", "example.org"])).await;

    let report = state.generate_accounts(4, Some("random")).await.unwrap();
    assert_eq!(report.accounts.len() + report.failures.len(), 4);
    assert!(!report.accounts.is_empty());
    for account in &report.accounts {
        assert!(account.domain == "example.com" || account.domain == "example.org");
        assert!(routes.route_for(&account.email).is_some());
        let notes = account.notes.as_deref().unwrap();
        assert_eq!(notes.split(' ').count(), 2);
    }

    let pinned = state.generate_accounts(2, Some("example.org")).await.unwrap();
    assert!(pinned.accounts.iter().all(|a| a.domain == "example.org"));

    assert!(matches!(
        state.generate_accounts(0, None).await,
        Err(CloudMailError::Validation(_))
    ));
    assert!(matches!(
        state.generate_accounts(11, None).await,
        Err(CloudMailError::Validation(_))
    ));

    let generated = state
        .db
        .activities_by_type(ActivityKind::AccountGenerate, 10)
        .await
        .unwrap();
    assert_eq!(generated.len(), 2);
}

#[tokio::test]
async fn test_status_change_flips_route() {
    let routes = Arc::new(FakeRoutes::new(&["example.com"]));
    let (state, _dir) = app_state(routes.clone(), test_config(&["example.com"])).await;
    let account = state
        .provision_account("swift42", "example.com", None, None)
        .await
        .unwrap();

    let updated = state
        .change_account(
            account.id,
            AccountUpdate {
                status: Some(AccountStatus::Inactive),
                notes: Some("paused".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.status, AccountStatus::Inactive);
    assert_eq!(updated.notes.as_deref(), Some("paused"));
    assert!(!routes.route_for("swift42@example.com").unwrap().enabled);
}

#[tokio::test]
async fn test_status_change_without_route_updates_locally() {
    let routes = Arc::new(FakeRoutes::new(&["example.com"]));
    let (state, _dir) = app_state(routes.clone(), test_config(&["example.com"])).await;
    let account = state
        .provision_account("swift42", "example.com", None, None)
        .await
        .unwrap();
    let route = routes.route_for("swift42@example.com").unwrap();
    routes.remove_route_now(&route.id);

    let updated = state
        .change_account(
            account.id,
            AccountUpdate {
                status: Some(AccountStatus::Inactive),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.status, AccountStatus::Inactive);
}

#[tokio::test]
async fn test_remove_account_deletes_route() {
    let routes = Arc::new(FakeRoutes::new(&["example.com"]));
    let (state, _dir) = app_state(routes.clone(), test_config(&["example.com"])).await;
    let account = state
        .provision_account("swift42", "example.com", None, None)
        .await
        .unwrap();

    let removed = state.remove_account(account.id).await.unwrap();
    assert_eq!(removed.email, "swift42@example.com");
    assert!(routes.routes().is_empty());
    assert!(state.db.account_by_id(account.id).await.unwrap().is_none());

    assert!(matches!(
        state.remove_account(account.id).await,
        Err(CloudMailError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_reset_password() {
    let routes = Arc::new(FakeRoutes::new(&["example.com"]));
    let (state, _dir) = app_state(routes, test_config(&["example.com"])).await;
    let account = state
        .provision_account("swift42", "example.com", Some("initial-pass".to_string()), None)
        .await
        .unwrap();
    assert_eq!(account.password.as_deref(), Some("initial-pass"));

    let reset = state.reset_password(account.id).await.unwrap();
    assert_ne!(reset.password, account.password);
    assert!(reset.password.is_some());
}

#[tokio::test]
async fn test_sync_imports_routes_made_elsewhere() {
    let routes = Arc::new(
        FakeRoutes::new(&["example.com"])
            .with_route("outside@example.com", true)
            .with_route("paused@example.com", false)
            .with_route("foreign@unmanaged.test", true),
    );
    let (state, _dir) = app_state(routes, test_config(&["example.com"])).await;

    let report = state.sync_routes().await.unwrap();
    assert!(report.success);
    assert_eq!(report.added, 2);
    assert_eq!(report.removed, 0);

    let paused = state
        .db
        .account_by_email("paused@example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(paused.status, AccountStatus::Inactive);
    assert!(state
        .db
        .account_by_email("foreign@unmanaged.test")
        .await
        .unwrap()
        .is_none());

    let again = state.sync_routes().await.unwrap();
    assert_eq!((again.added, again.removed, again.updated), (0, 0, 0));
}
