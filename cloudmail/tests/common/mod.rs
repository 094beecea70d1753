//! Shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use cloudmail::api::AppState;
use cloudmail::cloudflare::types::Action;
use cloudmail::cloudflare::{EmailRoute, Matcher, RouteListing, RouteProvider};
use cloudmail::config::{CloudflareZone, Config, ConfigHandle};
use cloudmail::error::{CloudMailError, Result};
use cloudmail::ingest::{
    AttachmentStore, Envelope, InMemoryJobStore, MailService, MailboxClient, MailboxConnector,
};
use cloudmail::store::Database;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const FORWARD_TO: &str = "collector@gmail.com";

/// In-memory stand-in for the Cloudflare rules of a set of domains
pub struct FakeRoutes {
    routes: Mutex<Vec<EmailRoute>>,
    domains: Vec<String>,
    next_id: AtomicUsize,
    pub creates: AtomicUsize,
}

impl FakeRoutes {
    pub fn new(domains: &[&str]) -> Self {
        Self {
            routes: Mutex::new(Vec::new()),
            domains: domains.iter().map(|d| d.to_string()).collect(),
            next_id: AtomicUsize::new(1),
            creates: AtomicUsize::new(0),
        }
    }

    pub fn with_route(self, email: &str, enabled: bool) -> Self {
        self.insert(email, enabled);
        self
    }

    fn insert(&self, email: &str, enabled: bool) -> String {
        let id = format!("rule-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let domain = email.split_once('@').map(|(_, d)| d).unwrap_or_default();
        self.routes.lock().unwrap().push(EmailRoute {
            id: id.clone(),
            name: Some(format!("Forward {}", email)),
            enabled,
            matchers: vec![Matcher::literal_to(email)],
            actions: vec![Action::forward(FORWARD_TO)],
            priority: None,
            domain: domain.to_string(),
        });
        id
    }

    /// Drop a rule behind the application's back
    pub fn remove_route_now(&self, route_id: &str) {
        self.routes.lock().unwrap().retain(|r| r.id != route_id);
    }

    pub fn routes(&self) -> Vec<EmailRoute> {
        self.routes.lock().unwrap().clone()
    }

    pub fn route_for(&self, email: &str) -> Option<EmailRoute> {
        self.routes()
            .into_iter()
            .find(|r| r.recipient().as_deref() == Some(email))
    }
}

#[async_trait]
impl RouteProvider for FakeRoutes {
    async fn create_route(&self, email: &str) -> Result<String> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(self.insert(&email.to_lowercase(), true))
    }

    async fn remove_route(&self, route_id: &str, _domain: &str) -> Result<()> {
        let mut routes = self.routes.lock().unwrap();
        let before = routes.len();
        routes.retain(|r| r.id != route_id);
        if routes.len() == before {
            return Err(CloudMailError::Cloudflare(format!("unknown rule {}", route_id)));
        }
        Ok(())
    }

    async fn list_routes(&self) -> Result<RouteListing> {
        Ok(RouteListing {
            routes: self.routes(),
            failed_domains: Vec::new(),
        })
    }

    async fn update_route(&self, route: &EmailRoute, enabled: bool) -> Result<()> {
        let mut routes = self.routes.lock().unwrap();
        let stored = routes
            .iter_mut()
            .find(|r| r.id == route.id)
            .ok_or_else(|| CloudMailError::Cloudflare(format!("unknown rule {}", route.id)))?;
        stored.enabled = enabled;
        Ok(())
    }

    async fn virtual_domains(&self) -> Vec<String> {
        self.domains.clone()
    }
}

/// Mailbox that is never reachable; the tests using it never fetch
struct OfflineConnector;

struct OfflineClient;

#[async_trait]
impl MailboxClient for OfflineClient {
    async fn search_since(&mut self, _since: NaiveDate) -> Result<Vec<u32>> {
        Ok(Vec::new())
    }

    async fn fetch_envelopes(&mut self, _uids: &[u32]) -> Result<Vec<Envelope>> {
        Ok(Vec::new())
    }

    async fn fetch_source(&mut self, _uid: u32) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn logout(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl MailboxConnector for OfflineConnector {
    async fn connect(&self) -> Result<Box<dyn MailboxClient>> {
        Ok(Box::new(OfflineClient))
    }
}

pub fn zone(domain: &str) -> CloudflareZone {
    CloudflareZone {
        domain: format!("@{}", domain),
        email_forward: FORWARD_TO.to_string(),
        api_token: "test-token".to_string(),
        zone_id: format!("zone-{}", domain),
    }
}

pub fn test_config(domains: &[&str]) -> Config {
    let mut config = Config::default();
    config.cloudflare = domains.iter().map(|d| zone(d)).collect();
    config.admin.username = "admin".to_string();
    config.admin.password = "s3cret-admin".to_string();
    config.jwt.secret = "integration-test-secret".to_string();
    config.login_limiter.max_attempts = 3;
    config
}

/// App state over an in-memory database. Keep the returned directory alive.
pub async fn app_state(routes: Arc<FakeRoutes>, config: Config) -> (Arc<AppState>, TempDir) {
    let db = Database::in_memory().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let config = ConfigHandle::in_memory(config);

    let jobs = Arc::new(InMemoryJobStore::with_delays(
        CancellationToken::new(),
        Duration::from_millis(50),
        Duration::from_secs(5),
    ));
    let mail = MailService::new(
        db.clone(),
        config.clone(),
        Arc::new(OfflineConnector),
        jobs,
        AttachmentStore::new(dir.path()),
    );

    let state = AppState::build(db, config, routes, mail).await.unwrap();
    (Arc::new(state), dir)
}
