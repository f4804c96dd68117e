// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Route matching, dot-path lookup, and prompt templating.

use serde_json::Value;

use drover_config::WebhookRouteConfig;

/// Resolve a `a.b.c` dot-path inside a JSON payload.
pub fn lookup_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = payload;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Render a JSON value for template substitution: strings verbatim, other
/// scalars via JSON, missing paths as empty.
fn render_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Substitute `{{dot.path}}` placeholders from the payload.
pub fn render_template(template: &str, payload: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let path = after[..end].trim();
                out.push_str(&render_value(lookup_path(payload, path)));
                rest = &after[end + 2..];
            }
            None => {
                // Unterminated placeholder: emit literally.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// The payload field matched against a route's `event`: `type` first (the
/// Linear shape), falling back to `event`.
fn payload_event(payload: &Value) -> Option<&str> {
    payload
        .get("type")
        .or_else(|| payload.get("event"))
        .and_then(|v| v.as_str())
}

/// Whether `route` matches a payload delivered under `source`.
pub fn route_matches(route: &WebhookRouteConfig, source: &str, payload: &Value) -> bool {
    if route.source != source {
        return false;
    }
    if let Some(event) = &route.event {
        if payload_event(payload) != Some(event.as_str()) {
            return false;
        }
    }
    if let Some(action) = &route.action {
        if payload.get("action").and_then(|v| v.as_str()) != Some(action.as_str()) {
            return false;
        }
    }
    for (path, expected) in &route.filters {
        let actual = render_value(lookup_path(payload, path));
        if &actual != expected {
            return false;
        }
    }
    true
}

/// First matching route wins, in declaration order.
pub fn match_route<'a>(
    routes: &'a [WebhookRouteConfig],
    source: &str,
    payload: &Value,
) -> Option<&'a WebhookRouteConfig> {
    routes.iter().find(|r| route_matches(r, source, payload))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> Value {
        serde_json::json!({
            "action": "create",
            "type": "Issue",
            "data": {
                "id": "u1",
                "identifier": "ENG-42",
                "title": "fix the gate",
                "team": { "key": "ENG" },
                "priority": 2
            }
        })
    }

    fn route(yaml: &str) -> WebhookRouteConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn dot_paths_traverse_nesting() {
        let p = payload();
        assert_eq!(
            lookup_path(&p, "data.team.key").and_then(|v| v.as_str()),
            Some("ENG")
        );
        assert!(lookup_path(&p, "data.missing.key").is_none());
    }

    #[test]
    fn template_substitutes_strings_and_numbers() {
        let rendered = render_template(
            "Issue {{data.identifier}} (prio {{data.priority}}): {{data.title}}",
            &payload(),
        );
        assert_eq!(rendered, "Issue ENG-42 (prio 2): fix the gate");
    }

    #[test]
    fn template_renders_missing_paths_empty() {
        assert_eq!(render_template("[{{nope.nothing}}]", &payload()), "[]");
    }

    #[test]
    fn template_keeps_unterminated_placeholder_literal() {
        assert_eq!(render_template("{{oops", &payload()), "{{oops");
    }

    #[test]
    fn route_matches_source_event_action() {
        let r = route(
            "name: linear-issue-created\nsource: linear\nevent: Issue\naction: create\nagent: coder\nprompt: x",
        );
        assert!(route_matches(&r, "linear", &payload()));
        assert!(!route_matches(&r, "github", &payload()));

        let wrong_action = route(
            "name: r\nsource: linear\nevent: Issue\naction: update\nagent: coder\nprompt: x",
        );
        assert!(!route_matches(&wrong_action, "linear", &payload()));
    }

    #[test]
    fn route_filters_compare_rendered_values() {
        let r = route(concat!(
            "name: eng-only\nsource: linear\nagent: coder\nprompt: x\n",
            "filters:\n  data.team.key: ENG\n",
        ));
        assert!(route_matches(&r, "linear", &payload()));

        let r2 = route(concat!(
            "name: web-only\nsource: linear\nagent: coder\nprompt: x\n",
            "filters:\n  data.team.key: WEB\n",
        ));
        assert!(!route_matches(&r2, "linear", &payload()));
    }

    #[test]
    fn first_matching_route_wins() {
        let routes = vec![
            route("name: never\nsource: linear\nevent: Comment\nagent: a\nprompt: x"),
            route("name: broad\nsource: linear\nagent: b\nprompt: x"),
            route("name: specific\nsource: linear\nevent: Issue\nagent: c\nprompt: x"),
        ];
        let matched = match_route(&routes, "linear", &payload()).unwrap();
        assert_eq!(matched.name, "broad");
    }
}
