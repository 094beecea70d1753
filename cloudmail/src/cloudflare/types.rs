//! Cloudflare Email Routing wire types

use serde::{Deserialize, Serialize};

/// Envelope of every Cloudflare v4 API response
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<ApiMessage>,
    pub result: Option<T>,
    pub result_info: Option<ResultInfo>,
}

#[derive(Debug, Deserialize)]
pub struct ApiMessage {
    #[serde(default)]
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ResultInfo {
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub per_page: u32,
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub total_count: u32,
}

impl ResultInfo {
    /// Another page exists after `page`
    pub fn has_more(&self, page: u32, per_page: u32) -> bool {
        self.count == per_page && page.saturating_mul(per_page) < self.total_count
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matcher {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Matcher {
    pub fn literal_to(email: &str) -> Self {
        Self {
            kind: "literal".to_string(),
            field: Some("to".to_string()),
            value: Some(email.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub value: Vec<String>,
}

impl Action {
    pub fn forward(to: &str) -> Self {
        Self {
            kind: "forward".to_string(),
            value: vec![to.to_string()],
        }
    }
}

/// Rule body sent on create and update
#[derive(Debug, Clone, Serialize)]
pub struct RuleRequest {
    pub name: String,
    pub enabled: bool,
    pub matchers: Vec<Matcher>,
    pub actions: Vec<Action>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
}

/// Routing rule as returned by Cloudflare
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingRule {
    #[serde(default)]
    pub id: Option<String>,
    /// Older name of `id`, still returned alongside it
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub matchers: Vec<Matcher>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub priority: Option<i64>,
}

/// A routing rule tagged with the domain whose zone it was listed from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmailRoute {
    pub id: String,
    pub name: Option<String>,
    pub enabled: bool,
    pub matchers: Vec<Matcher>,
    pub actions: Vec<Action>,
    pub priority: Option<i64>,
    pub domain: String,
}

impl EmailRoute {
    pub fn from_rule(rule: RoutingRule, domain: &str) -> Self {
        Self {
            id: rule.id.or(rule.tag).unwrap_or_default(),
            name: rule.name,
            enabled: rule.enabled,
            matchers: rule.matchers,
            actions: rule.actions,
            priority: rule.priority,
            domain: domain.to_string(),
        }
    }

    /// Address of the literal `to` matcher, lowercased
    pub fn recipient(&self) -> Option<String> {
        self.matchers
            .iter()
            .find(|m| m.kind == "literal" && m.field.as_deref() == Some("to"))
            .and_then(|m| m.value.as_deref())
            .filter(|v| v.contains('@'))
            .map(|v| v.trim().to_lowercase())
    }

    /// Body for a PUT, without the local domain tag
    pub fn to_request(&self, enabled: bool) -> RuleRequest {
        RuleRequest {
            name: self.name.clone().unwrap_or_default(),
            enabled,
            matchers: self.matchers.clone(),
            actions: self.actions.clone(),
            priority: self.priority,
        }
    }
}

/// Routes of every configured zone, plus the domains whose listing failed
#[derive(Debug, Clone, Default)]
pub struct RouteListing {
    pub routes: Vec<EmailRoute>,
    pub failed_domains: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_more_pages() {
        let full = ResultInfo {
            page: 1,
            per_page: 50,
            count: 50,
            total_count: 120,
        };
        assert!(full.has_more(1, 50));
        assert!(full.has_more(2, 50));
        assert!(!full.has_more(3, 50));

        let short = ResultInfo {
            count: 20,
            total_count: 70,
            ..full
        };
        assert!(!short.has_more(2, 50));

        let exact = ResultInfo {
            count: 50,
            total_count: 50,
            ..full
        };
        assert!(!exact.has_more(1, 50));
    }

    #[test]
    fn test_route_recipient() {
        let rule: RoutingRule = serde_json::from_value(serde_json::json!({
            "tag": "abc",
            "name": "rule",
            "enabled": true,
            "matchers": [
                {"type": "all"},
                {"type": "literal", "field": "to", "value": "Swift42@Example.com"}
            ],
            "actions": [{"type": "forward", "value": ["me@gmail.com"]}],
            "priority": 0
        }))
        .unwrap();

        let route = EmailRoute::from_rule(rule, "example.com");
        assert_eq!(route.id, "abc");
        assert_eq!(route.recipient().as_deref(), Some("swift42@example.com"));

        let body = serde_json::to_value(route.to_request(false)).unwrap();
        assert_eq!(body["enabled"], false);
        assert!(body.get("domain").is_none());
        assert_eq!(body["matchers"][0], serde_json::json!({"type": "all"}));
    }

    #[test]
    fn test_catch_all_has_no_recipient() {
        let route = EmailRoute {
            id: "1".to_string(),
            name: None,
            enabled: true,
            matchers: vec![Matcher {
                kind: "all".to_string(),
                field: None,
                value: None,
            }],
            actions: vec![],
            priority: None,
            domain: "example.com".to_string(),
        };
        assert!(route.recipient().is_none());
    }
}
