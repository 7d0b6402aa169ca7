//! Route table shared between the coordinator and the config renderer
//!
//! A `Route` is the externally visible mapping the proxy must enforce for
//! one application: a public listener and a canvas listener, both forwarding
//! to the same backend. The `RouteSet` is the single source of truth the
//! configuration document is regenerated from.

use serde::Serialize;
use std::collections::BTreeMap;

/// A response-header directive applied to the canvas stanza only.
///
/// Canvas listeners exist so apps can be embedded in an iframe; the default
/// rules strip the framing-restriction headers backends commonly send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum HeaderRule {
    /// Strip a response header before it reaches the client
    Remove { name: String },
    /// Set a response header on the way out
    Add { name: String, value: String },
}

impl HeaderRule {
    pub fn remove(name: &str) -> Self {
        HeaderRule::Remove {
            name: name.to_string(),
        }
    }

    pub fn add(name: &str, value: &str) -> Self {
        HeaderRule::Add {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

/// Default canvas rules: drop the two headers that block iframe embedding
pub fn default_canvas_rules() -> Vec<HeaderRule> {
    vec![
        HeaderRule::remove("X-Frame-Options"),
        HeaderRule::remove("Content-Security-Policy"),
    ]
}

/// The proxy-facing mapping for one deployed application
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    /// Application identifier (stable ordering key for rendering)
    pub app_id: String,
    /// Exclusive public listen port
    pub public_port: u16,
    /// Exclusive canvas (iframe) listen port
    pub canvas_port: u16,
    /// Backend host the proxy forwards to
    pub backend_host: String,
    /// Backend port the proxy forwards to
    pub backend_port: u16,
    /// Ordered header directives for the canvas stanza
    pub header_rules: Vec<HeaderRule>,
}

impl Route {
    /// Build a route with the default canvas header rules
    pub fn new(
        app_id: &str,
        public_port: u16,
        canvas_port: u16,
        backend_host: &str,
        backend_port: u16,
    ) -> Self {
        Self {
            app_id: app_id.to_string(),
            public_port,
            canvas_port,
            backend_host: backend_host.to_string(),
            backend_port,
            header_rules: default_canvas_rules(),
        }
    }

    /// Upstream address in host:port form
    pub fn backend_addr(&self) -> String {
        format!("{}:{}", self.backend_host, self.backend_port)
    }
}

/// The full `app_id -> Route` mapping the proxy must reflect.
///
/// Backed by a BTreeMap so iteration follows app_id order regardless of
/// insertion order; the renderer depends on this for byte-stable output.
#[derive(Debug, Clone, Default)]
pub struct RouteSet {
    routes: BTreeMap<String, Route>,
}

impl RouteSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the route for an app, returning the previous one
    pub fn insert(&mut self, route: Route) -> Option<Route> {
        self.routes.insert(route.app_id.clone(), route)
    }

    /// Remove an app's route, returning it so a failed teardown can reinsert
    pub fn remove(&mut self, app_id: &str) -> Option<Route> {
        self.routes.remove(app_id)
    }

    pub fn get(&self, app_id: &str) -> Option<&Route> {
        self.routes.get(app_id)
    }

    pub fn contains(&self, app_id: &str) -> bool {
        self.routes.contains_key(app_id)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Routes in app_id order
    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_canvas_rules_strip_framing_headers() {
        let rules = default_canvas_rules();
        assert_eq!(
            rules,
            vec![
                HeaderRule::remove("X-Frame-Options"),
                HeaderRule::remove("Content-Security-Policy"),
            ]
        );
    }

    #[test]
    fn test_route_backend_addr() {
        let route = Route::new("app1", 30000, 40000, "10.0.0.5", 80);
        assert_eq!(route.backend_addr(), "10.0.0.5:80");
        assert_eq!(route.header_rules.len(), 2);
    }

    #[test]
    fn test_route_set_orders_by_app_id() {
        let mut set = RouteSet::new();
        set.insert(Route::new("zeta", 30002, 40002, "10.0.0.7", 80));
        set.insert(Route::new("alpha", 30000, 40000, "10.0.0.5", 80));
        set.insert(Route::new("mid", 30001, 40001, "10.0.0.6", 80));

        let order: Vec<&str> = set.iter().map(|r| r.app_id.as_str()).collect();
        assert_eq!(order, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_route_set_remove_returns_route_for_reinsert() {
        let mut set = RouteSet::new();
        set.insert(Route::new("app1", 30000, 40000, "10.0.0.5", 80));

        let removed = set.remove("app1").unwrap();
        assert!(set.is_empty());

        set.insert(removed);
        assert!(set.contains("app1"));
        assert_eq!(set.len(), 1);
    }
}
