//! Deterministic rendering of the route set into a proxy config document
//!
//! The whole document is regenerated from scratch on every call; nothing is
//! patched incrementally. Two calls over an equal route set produce
//! byte-identical output, which is what lets the reconciler skip no-op
//! reloads and keeps staged documents diffable.

use crate::routes::{HeaderRule, Route, RouteSet};
use std::fmt::Write;

/// Fixed first line of every generated document
pub const DOCUMENT_HEADER: &str =
    "# Managed by portgate. Do not edit; regenerated on every deploy and teardown.";

/// Which listener of a route a stanza serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Listener {
    Public,
    Canvas,
}

/// Render the full configuration document for a route set.
///
/// Stanzas are emitted in app_id order, public listener first, so output
/// never depends on insertion order.
pub fn render(routes: &RouteSet) -> String {
    let mut out = String::new();
    out.push_str(DOCUMENT_HEADER);
    out.push('\n');

    for route in routes.iter() {
        write_stanza(&mut out, route, Listener::Public);
        write_stanza(&mut out, route, Listener::Canvas);
    }

    out
}

fn write_stanza(out: &mut String, route: &Route, listener: Listener) {
    let (label, port) = match listener {
        Listener::Public => ("public", route.public_port),
        Listener::Canvas => ("canvas", route.canvas_port),
    };

    out.push_str(&format!(
        r#"
# {app} ({label})
server {{
    listen {port};

    location / {{
        proxy_pass http://{backend};
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection "upgrade";
"#,
        app = route.app_id,
        label = label,
        port = port,
        backend = route.backend_addr(),
    ));

    // Header directives apply to the canvas listener only: they exist to
    // let the app be embedded in an iframe.
    if listener == Listener::Canvas {
        for rule in &route.header_rules {
            match rule {
                HeaderRule::Remove { name } => {
                    let _ = writeln!(out, "        proxy_hide_header {};", name);
                }
                HeaderRule::Add { name, value } => {
                    let _ = writeln!(out, "        add_header {} \"{}\" always;", name, value);
                }
            }
        }
    }

    out.push_str("    }\n}\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::HeaderRule;

    fn sample_routes() -> RouteSet {
        let mut set = RouteSet::new();
        set.insert(Route::new("appa", 30001, 40001, "10.0.0.5", 80));
        set.insert(Route::new("appb", 30002, 40002, "10.0.0.6", 8080));
        set
    }

    #[test]
    fn test_renders_two_stanzas_per_route() {
        let doc = render(&sample_routes());

        assert_eq!(doc.matches("server {").count(), 4);
        assert_eq!(doc.matches("listen 30001;").count(), 1);
        assert_eq!(doc.matches("listen 40001;").count(), 1);
        assert_eq!(doc.matches("listen 30002;").count(), 1);
        assert_eq!(doc.matches("listen 40002;").count(), 1);
        assert_eq!(doc.matches("proxy_pass http://10.0.0.5:80;").count(), 2);
        assert_eq!(doc.matches("proxy_pass http://10.0.0.6:8080;").count(), 2);
    }

    #[test]
    fn test_canvas_stanzas_carry_header_rules() {
        let doc = render(&sample_routes());

        // One hide directive per canvas stanza, none for public stanzas.
        assert_eq!(doc.matches("proxy_hide_header X-Frame-Options;").count(), 2);
        assert_eq!(
            doc.matches("proxy_hide_header Content-Security-Policy;")
                .count(),
            2
        );

        // The hide directives appear only after the canvas listen lines.
        let first_hide = doc.find("proxy_hide_header").unwrap();
        let first_canvas = doc.find("listen 40001;").unwrap();
        assert!(first_hide > first_canvas);
    }

    #[test]
    fn test_add_rule_renders_always_header() {
        let mut set = RouteSet::new();
        let mut route = Route::new("appa", 30001, 40001, "10.0.0.5", 80);
        route
            .header_rules
            .push(HeaderRule::add("Content-Security-Policy", "frame-ancestors *"));
        set.insert(route);

        let doc = render(&set);
        assert!(doc.contains("add_header Content-Security-Policy \"frame-ancestors *\" always;"));
    }

    #[test]
    fn test_rendering_is_idempotent_and_order_independent() {
        let forward = render(&sample_routes());

        let mut reversed = RouteSet::new();
        reversed.insert(Route::new("appb", 30002, 40002, "10.0.0.6", 8080));
        reversed.insert(Route::new("appa", 30001, 40001, "10.0.0.5", 80));

        assert_eq!(forward, render(&sample_routes()));
        assert_eq!(forward, render(&reversed));
    }

    #[test]
    fn test_stanzas_follow_app_id_order() {
        let doc = render(&sample_routes());
        let a = doc.find("# appa (public)").unwrap();
        let b = doc.find("# appb (public)").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_empty_route_set_renders_header_only() {
        let doc = render(&RouteSet::new());
        assert_eq!(doc, format!("{}\n", DOCUMENT_HEADER));
    }
}
