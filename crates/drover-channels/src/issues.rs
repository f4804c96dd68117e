// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Issue-tracker event routing.
//!
//! The issue-tracker connector is webhook-driven and comment-based; this
//! module owns the pure routing decision: which configured agent (if any)
//! handles an inbound issue event. The conversation key for the resulting
//! job is the issue id.

use serde::{Deserialize, Serialize};

use drover_config::IssueFilterConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueEventKind {
    IssueCreated,
    CommentAdded,
    IssueAssigned,
    StatusChanged,
}

/// Normalised issue fields the router reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueSummary {
    pub id: String,
    /// Human identifier, e.g. `ENG-42`.
    pub identifier: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub creator_id: Option<String>,
    #[serde(default)]
    pub assignee_id: Option<String>,
    #[serde(default)]
    pub team_key: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub project: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IssueEvent {
    pub kind: IssueEventKind,
    pub issue: IssueSummary,
    /// Comment body for `comment_added`.
    pub comment: Option<String>,
}

/// Routing decision for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueRouting {
    Route { agent_name: String },
    Ignore { reason: String },
}

/// Whether `filter` matches `issue`. Criteria are conjunctive: every
/// configured field must hold.
fn filter_matches(filter: &IssueFilterConfig, issue: &IssueSummary) -> bool {
    let mut any_criterion = false;

    if let Some(assignee) = &filter.assignee {
        any_criterion = true;
        if issue.assignee_id.as_deref() != Some(assignee.as_str()) {
            return false;
        }
    }
    if let Some(team) = &filter.team {
        any_criterion = true;
        if issue.team_key.as_deref() != Some(team.as_str()) {
            return false;
        }
        if !filter.states.is_empty() {
            let Some(state) = &issue.state else {
                return false;
            };
            if !filter.states.iter().any(|s| s.eq_ignore_ascii_case(state)) {
                return false;
            }
        }
        if filter
            .exclude_labels
            .iter()
            .any(|ex| issue.labels.iter().any(|l| l.eq_ignore_ascii_case(ex)))
        {
            return false;
        }
    }
    if let Some(label) = &filter.label {
        any_criterion = true;
        if !issue.labels.iter().any(|l| l.eq_ignore_ascii_case(label)) {
            return false;
        }
    }
    if let Some(project) = &filter.project {
        any_criterion = true;
        if issue.project.as_deref() != Some(project.as_str()) {
            return false;
        }
    }

    any_criterion
}

/// Route an issue event to the first matching agent.
///
/// `agents` is the configured (name, filter) list in declaration order;
/// first match wins. Self-created suppression: when the issue's creator is
/// the connector's own API user, the event is ignored unless it is
/// explicitly assigned to a *different* user that matches an agent's
/// assignee filter.
pub fn route_issue(
    event: &IssueEvent,
    agents: &[(String, IssueFilterConfig)],
    api_user_id: Option<&str>,
) -> IssueRouting {
    let issue = &event.issue;

    let self_created = match (api_user_id, &issue.creator_id) {
        (Some(me), Some(creator)) => me == creator,
        _ => false,
    };

    for (name, filter) in agents {
        if filter.require_assignment || self_created {
            // Only an explicit assignment can route this event.
            let Some(assignee) = &filter.assignee else {
                continue;
            };
            if issue.assignee_id.as_deref() != Some(assignee.as_str()) {
                continue;
            }
            if self_created && issue.assignee_id.as_deref() == api_user_id {
                // Assigned back to ourselves: still self-created noise.
                continue;
            }
            return IssueRouting::Route {
                agent_name: name.clone(),
            };
        }
        if filter_matches(filter, issue) {
            return IssueRouting::Route {
                agent_name: name.clone(),
            };
        }
    }

    IssueRouting::Ignore {
        reason: if self_created {
            "self_created".to_string()
        } else {
            "no_matching_agent".to_string()
        },
    }
}

/// Default prompt rendered for an issue event when no template applies.
pub fn default_prompt(event: &IssueEvent) -> String {
    let issue = &event.issue;
    match event.kind {
        IssueEventKind::CommentAdded => format!(
            "New comment on issue {} ({}):\n\n{}",
            issue.identifier,
            issue.title,
            event.comment.as_deref().unwrap_or("")
        ),
        _ => format!(
            "Work on issue {} ({}).\n\n{}",
            issue.identifier, issue.title, issue.description
        ),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(yaml: &str) -> IssueFilterConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn issue() -> IssueSummary {
        IssueSummary {
            id: "u1".into(),
            identifier: "ENG-42".into(),
            title: "broken build".into(),
            creator_id: Some("U-human".into()),
            assignee_id: None,
            team_key: Some("ENG".into()),
            state: Some("Todo".into()),
            labels: vec!["bug".into()],
            ..IssueSummary::default()
        }
    }

    fn event(issue: IssueSummary) -> IssueEvent {
        IssueEvent {
            kind: IssueEventKind::IssueCreated,
            issue,
            comment: None,
        }
    }

    #[test]
    fn team_filter_routes_first_match() {
        let agents = vec![
            ("frontend".to_string(), filter("team: WEB")),
            ("coder".to_string(), filter("team: ENG")),
            ("also-eng".to_string(), filter("team: ENG")),
        ];
        let routing = route_issue(&event(issue()), &agents, None);
        assert_eq!(
            routing,
            IssueRouting::Route {
                agent_name: "coder".into()
            }
        );
    }

    #[test]
    fn state_allowlist_is_enforced() {
        let agents = vec![(
            "coder".to_string(),
            filter("team: ENG\nstates: [In Progress]"),
        )];
        let routing = route_issue(&event(issue()), &agents, None);
        assert!(matches!(routing, IssueRouting::Ignore { .. }));
    }

    #[test]
    fn exclude_labels_block_routing() {
        let agents = vec![(
            "coder".to_string(),
            filter("team: ENG\nexclude_labels: [bug]"),
        )];
        let routing = route_issue(&event(issue()), &agents, None);
        assert!(matches!(routing, IssueRouting::Ignore { .. }));
    }

    #[test]
    fn empty_filter_never_matches() {
        let agents = vec![("coder".to_string(), IssueFilterConfig::default())];
        let routing = route_issue(&event(issue()), &agents, None);
        assert!(matches!(routing, IssueRouting::Ignore { .. }));
    }

    #[test]
    fn self_created_unassigned_is_suppressed() {
        // Connector user U created the issue and it is assigned to U:
        // matching agent A must NOT fire.
        let agents = vec![("agent-a".to_string(), filter("assignee: U"))];
        let mut i = issue();
        i.creator_id = Some("U".into());
        i.assignee_id = Some("U".into());
        let routing = route_issue(&event(i), &agents, Some("U"));
        assert_eq!(
            routing,
            IssueRouting::Ignore {
                reason: "self_created".into()
            }
        );
    }

    #[test]
    fn self_created_reassigned_to_other_agent_routes() {
        let agents = vec![
            ("agent-a".to_string(), filter("assignee: U")),
            ("agent-b".to_string(), filter("assignee: V")),
        ];
        let mut i = issue();
        i.creator_id = Some("U".into());
        i.assignee_id = Some("V".into());
        let routing = route_issue(&event(i), &agents, Some("U"));
        assert_eq!(
            routing,
            IssueRouting::Route {
                agent_name: "agent-b".into()
            }
        );
    }

    #[test]
    fn require_assignment_skips_filter_matches() {
        let agents = vec![(
            "coder".to_string(),
            filter("team: ENG\nrequire_assignment: true"),
        )];
        // Matches the team filter but is not assigned → no route.
        let routing = route_issue(&event(issue()), &agents, None);
        assert!(matches!(routing, IssueRouting::Ignore { .. }));
    }

    #[test]
    fn comment_prompt_includes_body() {
        let ev = IssueEvent {
            kind: IssueEventKind::CommentAdded,
            issue: issue(),
            comment: Some("try rebooting it".into()),
        };
        let prompt = default_prompt(&ev);
        assert!(prompt.contains("ENG-42"));
        assert!(prompt.contains("try rebooting it"));
    }
}
