//! Request classification.
//!
//! An ordered rule list of (predicate, route) pairs, evaluated top to
//! bottom; the first match wins and the last rule always matches. Each
//! predicate is a plain value that can be evaluated on its own.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::RoutingConfig;
use crate::router::request::InterceptedRequest;

/// A host-name match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostPattern {
    /// Host equals the domain or is a subdomain of it.
    Suffix(String),
    /// The labels occur at a label boundary and are followed by at least
    /// one more label (`translate.google` matches `translate.google.co.uk`).
    LabelSequence(String),
}

impl HostPattern {
    pub fn suffix(domain: &str) -> Self {
        HostPattern::Suffix(domain.to_ascii_lowercase())
    }

    pub fn label_sequence(labels: &str) -> Self {
        HostPattern::LabelSequence(labels.to_ascii_lowercase())
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').as_bytes();
        match self {
            HostPattern::Suffix(domain) => {
                let domain = domain.as_bytes();
                let Some(start) = host.len().checked_sub(domain.len()) else {
                    return false;
                };
                host[start..].eq_ignore_ascii_case(domain)
                    && (start == 0 || host[start - 1] == b'.')
            }
            HostPattern::LabelSequence(labels) => {
                let labels = labels.as_bytes();
                // Candidate starts: the first label and every label after a dot.
                std::iter::once(0)
                    .chain(host.iter().enumerate().filter(|(_, b)| **b == b'.').map(|(i, _)| i + 1))
                    .any(|start| {
                        let end = start + labels.len();
                        end + 1 < host.len()
                            && host[start..end].eq_ignore_ascii_case(labels)
                            && host[end] == b'.'
                    })
            }
        }
    }
}

/// The request class chosen by the rule list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    TranslatePassthrough,
    Navigation,
    StaticAsset,
    Api,
    Upload,
    ThirdPartyStatic,
    Default,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::TranslatePassthrough => "translate",
            Route::Navigation => "navigation",
            Route::StaticAsset => "static_asset",
            Route::Api => "api",
            Route::Upload => "upload",
            Route::ThirdPartyStatic => "third_party_static",
            Route::Default => "default",
        }
    }

    pub fn strategy(&self) -> Strategy {
        match self {
            Route::TranslatePassthrough => Strategy::NetworkWithCacheFallback,
            Route::Navigation => Strategy::NetworkFirst {
                fallback_document: true,
            },
            Route::Api => Strategy::NetworkFirst {
                fallback_document: false,
            },
            Route::StaticAsset | Route::Upload | Route::Default => Strategy::CacheFirst,
            Route::ThirdPartyStatic => Strategy::StaleWhileRevalidate,
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a response is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Network; cache lookup only when the network fails. Never writes.
    NetworkWithCacheFallback,
    /// Network, persisted on success; cache (then optionally the fallback
    /// document) on failure.
    NetworkFirst { fallback_document: bool },
    /// Cache; network on miss, persisted.
    CacheFirst,
    /// Cache now, network refresh in the background; network awaited on miss.
    StaleWhileRevalidate,
}

/// A single classification test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    TranslateHost,
    WantsHtml,
    SameOriginAsset,
    SameOriginPrefix(String),
    StaticHost,
    Always,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub predicate: Predicate,
    pub route: Route,
}

/// Evaluates the rule list against intercepted requests.
#[derive(Debug, Clone)]
pub struct Classifier {
    origin: Url,
    assets: HashSet<String>,
    translate_hosts: Vec<HostPattern>,
    static_hosts: Vec<HostPattern>,
    rules: Vec<Rule>,
}

impl Classifier {
    pub fn new(routing: &RoutingConfig, manifest: &[String]) -> Self {
        let rules = vec![
            Rule {
                predicate: Predicate::TranslateHost,
                route: Route::TranslatePassthrough,
            },
            Rule {
                predicate: Predicate::WantsHtml,
                route: Route::Navigation,
            },
            Rule {
                predicate: Predicate::SameOriginAsset,
                route: Route::StaticAsset,
            },
            Rule {
                predicate: Predicate::SameOriginPrefix(routing.api_prefix.clone()),
                route: Route::Api,
            },
            Rule {
                predicate: Predicate::SameOriginPrefix(routing.uploads_prefix.clone()),
                route: Route::Upload,
            },
            Rule {
                predicate: Predicate::StaticHost,
                route: Route::ThirdPartyStatic,
            },
            Rule {
                predicate: Predicate::Always,
                route: Route::Default,
            },
        ];

        Self {
            origin: routing.origin.clone(),
            assets: manifest.iter().cloned().collect(),
            translate_hosts: routing.translate_hosts.clone(),
            static_hosts: routing.static_hosts.clone(),
            rules,
        }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.origin.origin()
    }

    /// Evaluate one predicate against a request.
    pub fn matches(&self, predicate: &Predicate, request: &InterceptedRequest) -> bool {
        let host = request.url.host_str().unwrap_or_default();
        match predicate {
            Predicate::TranslateHost => self.translate_hosts.iter().any(|p| p.matches(host)),
            Predicate::WantsHtml => request.wants_html(),
            Predicate::SameOriginAsset => {
                self.is_same_origin(&request.url) && self.assets.contains(request.url.path())
            }
            Predicate::SameOriginPrefix(prefix) => {
                self.is_same_origin(&request.url) && request.url.path().starts_with(prefix.as_str())
            }
            Predicate::StaticHost => self.static_hosts.iter().any(|p| p.matches(host)),
            Predicate::Always => true,
        }
    }

    /// Classify a request. `None` means the router does not intervene
    /// (anything but GET).
    pub fn classify(&self, request: &InterceptedRequest) -> Option<Route> {
        if !request.is_get() {
            return None;
        }
        let route = self
            .rules
            .iter()
            .find(|rule| self.matches(&rule.predicate, request))
            .map_or(Route::Default, |rule| rule.route);
        Some(route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_manifest, RoutingConfig};

    fn classifier() -> Classifier {
        let mut routing = RoutingConfig::default();
        routing.origin = Url::parse("https://civicpol.example/").unwrap();
        Classifier::new(&routing, &default_manifest())
    }

    fn get(url: &str) -> InterceptedRequest {
        InterceptedRequest::get(Url::parse(url).unwrap())
    }

    #[test]
    fn test_suffix_pattern() {
        let p = HostPattern::suffix("fonts.gstatic.com");
        assert!(p.matches("fonts.gstatic.com"));
        assert!(p.matches("eu.fonts.gstatic.com"));
        assert!(p.matches("FONTS.GSTATIC.COM."));
        assert!(!p.matches("evilfonts.gstatic.com"));
        assert!(!p.matches("fonts.gstatic.com.evil.net"));
        assert!(!p.matches("gstatic.com"));
    }

    #[test]
    fn test_label_sequence_pattern() {
        let p = HostPattern::label_sequence("translate.google");
        assert!(p.matches("translate.google.com"));
        assert!(p.matches("translate.google.co.uk"));
        assert!(p.matches("x.translate.google.de"));
        assert!(p.matches("Translate.Google.FR."));
        assert!(!p.matches("translate.google"));
        assert!(!p.matches("translate.google."));
        assert!(!p.matches("nottranslate.google.com"));
        assert!(!p.matches("translate.googleusercontent.com"));
    }

    #[test]
    fn test_non_get_is_not_classified() {
        let c = classifier();
        let post = InterceptedRequest::new("POST", Url::parse("https://civicpol.example/api/cases").unwrap());
        assert_eq!(c.classify(&post), None);
    }

    #[test]
    fn test_classification_order() {
        let c = classifier();
        assert_eq!(
            c.classify(&get("https://translate.googleapis.com/x")),
            Some(Route::Default)
        );
        assert_eq!(
            c.classify(&get("https://translate.gstatic.com/element.js")),
            Some(Route::TranslatePassthrough)
        );
        assert_eq!(
            c.classify(&InterceptedRequest::navigate(Url::parse("https://translate.google.com/").unwrap())),
            Some(Route::TranslatePassthrough)
        );
        assert_eq!(
            c.classify(&InterceptedRequest::navigate(Url::parse("https://civicpol.example/case.html").unwrap())),
            Some(Route::Navigation)
        );
        assert_eq!(c.classify(&get("https://civicpol.example/style.css")), Some(Route::StaticAsset));
        assert_eq!(c.classify(&get("https://civicpol.example/api/cases?open=1")), Some(Route::Api));
        assert_eq!(c.classify(&get("https://civicpol.example/uploads/a.png")), Some(Route::Upload));
        assert_eq!(
            c.classify(&get("https://fonts.googleapis.com/css2?family=Inter")),
            Some(Route::ThirdPartyStatic)
        );
        assert_eq!(c.classify(&get("https://civicpol.example/app.js")), Some(Route::Default));
    }

    #[test]
    fn test_same_origin_rules_require_origin_match() {
        let c = classifier();
        assert_eq!(c.classify(&get("https://other.example/style.css")), Some(Route::Default));
        assert_eq!(c.classify(&get("http://civicpol.example/api/cases")), Some(Route::Default));
        assert_eq!(c.classify(&get("https://civicpol.example:8443/api/cases")), Some(Route::Default));
    }

    #[test]
    fn test_html_accept_header_wins_over_asset_rule() {
        let c = classifier();
        let req = get("https://civicpol.example/reports.html").with_header("accept", "text/html");
        assert_eq!(c.classify(&req), Some(Route::Navigation));
    }

    #[test]
    fn test_each_predicate_in_isolation() {
        let c = classifier();
        let req = get("https://civicpol.example/uploads/x.png");
        assert!(c.matches(&Predicate::SameOriginPrefix("/uploads/".into()), &req));
        assert!(!c.matches(&Predicate::SameOriginAsset, &req));
        assert!(!c.matches(&Predicate::StaticHost, &req));
        assert!(c.matches(&Predicate::Always, &req));
        assert_eq!(c.rules().last().map(|r| r.route), Some(Route::Default));
    }

    #[test]
    fn test_route_strategies() {
        assert_eq!(Route::Upload.strategy(), Strategy::CacheFirst);
        assert_eq!(
            Route::Api.strategy(),
            Strategy::NetworkFirst { fallback_document: false }
        );
        assert_eq!(Route::ThirdPartyStatic.strategy(), Strategy::StaleWhileRevalidate);
    }
}
