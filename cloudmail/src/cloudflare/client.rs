//! HTTP client for the Cloudflare Email Routing API

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::types::{
    Action, ApiResponse, EmailRoute, Matcher, ResultInfo, RouteListing, RoutingRule, RuleRequest,
};
use super::RouteProvider;
use crate::config::{CloudflareZone, Config, ConfigHandle};
use crate::error::{CloudMailError, Result};

pub const DEFAULT_API_BASE: &str = "https://api.cloudflare.com/client/v4";

const PER_PAGE: u32 = 50;

/// Cloudflare Email Routing client.
///
/// Zones, tokens and proxy settings are read from the live configuration on every call, so
/// edits made from the settings page apply immediately.
pub struct EmailRouter {
    config: ConfigHandle,
    api_base: String,
}

impl EmailRouter {
    pub fn new(config: ConfigHandle) -> Self {
        Self::with_api_base(config, DEFAULT_API_BASE)
    }

    pub fn with_api_base(config: ConfigHandle, api_base: impl Into<String>) -> Self {
        Self {
            config,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn http_client(config: &Config) -> Result<Client> {
        let mut builder = Client::builder().timeout(Duration::from_secs(30));
        if let Some(url) = config.proxy.url() {
            debug!("Using proxy {} for Cloudflare API", url);
            builder = builder.proxy(reqwest::Proxy::all(url)?);
        }
        Ok(builder.build()?)
    }

    fn rules_url(&self, zone: &CloudflareZone) -> String {
        format!("{}/zones/{}/email/routing/rules", self.api_base, zone.zone_id)
    }

    fn request(&self, http: &Client, method: Method, url: &str, zone: &CloudflareZone) -> RequestBuilder {
        http.request(method, url).bearer_auth(&zone.api_token)
    }

    /// Send a request and unwrap Cloudflare's response envelope.
    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<(Option<T>, Option<ResultInfo>)> {
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        let envelope: ApiResponse<T> = serde_json::from_str(&text).map_err(|e| {
            CloudMailError::Cloudflare(format!("unexpected response ({}): {}", status, e))
        })?;

        if !status.is_success() || !envelope.success {
            let message = envelope
                .errors
                .first()
                .map(|e| format!("{} (code {})", e.message, e.code))
                .unwrap_or_else(|| format!("request failed with status {}", status));
            return Err(CloudMailError::Cloudflare(message));
        }
        Ok((envelope.result, envelope.result_info))
    }

    fn zone_for_email<'a>(config: &'a Config, email: &str) -> Result<&'a CloudflareZone> {
        let domain = email
            .split_once('@')
            .map(|(_, d)| d)
            .ok_or_else(|| CloudMailError::Validation(format!("invalid address: {}", email)))?;
        config.zone_for_domain(domain).ok_or_else(|| {
            CloudMailError::Config(format!("no Cloudflare zone configured for {}", domain))
        })
    }

    /// All rules of one zone, following pagination
    async fn list_zone(&self, http: &Client, zone: &CloudflareZone) -> Result<Vec<EmailRoute>> {
        let domain = zone.bare_domain();
        let mut routes = Vec::new();
        let mut page = 1u32;

        loop {
            let request = self
                .request(http, Method::GET, &self.rules_url(zone), zone)
                .query(&[("page", page), ("per_page", PER_PAGE)]);
            let (rules, info) = self.send::<Vec<RoutingRule>>(request).await?;
            let rules = rules.unwrap_or_default();
            let fetched = rules.len() as u32;

            routes.extend(rules.into_iter().map(|r| EmailRoute::from_rule(r, &domain)));

            let info = info.unwrap_or(ResultInfo {
                page,
                per_page: PER_PAGE,
                count: fetched,
                total_count: routes.len() as u32,
            });
            if !info.has_more(page, PER_PAGE) {
                break;
            }
            page += 1;
        }

        debug!("Listed {} routes for {}", routes.len(), domain);
        Ok(routes)
    }
}

#[async_trait]
impl RouteProvider for EmailRouter {
    async fn create_route(&self, email: &str) -> Result<String> {
        let config = self.config.snapshot().await;
        let email = email.trim().to_lowercase();
        let zone = Self::zone_for_email(&config, &email)?;
        let http = Self::http_client(&config)?;

        let body = RuleRequest {
            name: format!("Forward {}", email),
            enabled: true,
            matchers: vec![Matcher::literal_to(&email)],
            actions: vec![Action::forward(&zone.email_forward)],
            priority: None,
        };
        let request = self
            .request(&http, Method::POST, &self.rules_url(zone), zone)
            .json(&body);
        let (rule, _) = self.send::<RoutingRule>(request).await?;

        let id = rule
            .and_then(|r| r.id.or(r.tag))
            .ok_or_else(|| CloudMailError::Cloudflare("created rule has no id".to_string()))?;
        info!("Created Cloudflare route {} for {}", id, email);
        Ok(id)
    }

    async fn remove_route(&self, route_id: &str, domain: &str) -> Result<()> {
        let config = self.config.snapshot().await;
        let zone = config.zone_for_domain(domain).ok_or_else(|| {
            CloudMailError::Config(format!("no Cloudflare zone configured for {}", domain))
        })?;
        let http = Self::http_client(&config)?;

        let url = format!("{}/{}", self.rules_url(zone), route_id);
        let request = self.request(&http, Method::DELETE, &url, zone);
        self.send::<Value>(request).await?;

        info!("Removed Cloudflare route {} from {}", route_id, domain);
        Ok(())
    }

    async fn list_routes(&self) -> Result<RouteListing> {
        let config = self.config.snapshot().await;
        let http = Self::http_client(&config)?;
        let mut listing = RouteListing::default();

        for zone in &config.cloudflare {
            match self.list_zone(&http, zone).await {
                Ok(routes) => listing.routes.extend(routes),
                Err(e) => {
                    warn!("Failed to list routes for {}: {}", zone.bare_domain(), e);
                    listing.failed_domains.push(zone.bare_domain());
                }
            }
        }
        Ok(listing)
    }

    async fn update_route(&self, route: &EmailRoute, enabled: bool) -> Result<()> {
        let config = self.config.snapshot().await;
        let zone = config.zone_for_domain(&route.domain).ok_or_else(|| {
            CloudMailError::Config(format!("no Cloudflare zone configured for {}", route.domain))
        })?;
        let http = Self::http_client(&config)?;

        let url = format!("{}/{}", self.rules_url(zone), route.id);
        let request = self
            .request(&http, Method::PUT, &url, zone)
            .json(&route.to_request(enabled));
        self.send::<Value>(request).await?;

        info!(
            "Route {} ({}) is now {}",
            route.id,
            route.domain,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    async fn virtual_domains(&self) -> Vec<String> {
        self.config.snapshot().await.domains()
    }

    async fn find_route(&self, email: &str) -> Result<Option<EmailRoute>> {
        let config = self.config.snapshot().await;
        let email = email.trim().to_lowercase();
        let zone = Self::zone_for_email(&config, &email)?;
        let http = Self::http_client(&config)?;

        let routes = self.list_zone(&http, zone).await?;
        Ok(routes
            .into_iter()
            .find(|route| route.recipient().as_deref() == Some(email.as_str())))
    }
}
