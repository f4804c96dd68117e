// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The webhook HTTP receiver.
//!
//! Pipeline: raw body capture → per-provider signature verification →
//! delivery-id idempotency → route match → prompt templating → session-key
//! resolution → async dispatch into the fleet. The HTTP response is always
//! synchronous: 202 for anything accepted (including unmatched routes, so
//! the route table never leaks), 401 on bad signatures, 404 for unknown
//! providers, 400 for unparseable bodies.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};
use chrono::Utc;
use tracing::{debug, info, warn};

use drover_config::{WebhookConfig, WebhookProviderKind};

use crate::{
    delivery_header, lookup_path, match_route, render_template, verify_signature, IdempotencySet,
};

// ─── Dispatcher contract ──────────────────────────────────────────────────────

/// A fully resolved webhook trigger, ready for the fleet manager.
#[derive(Debug, Clone)]
pub struct WebhookTrigger {
    pub route_name: String,
    /// Provider name the delivery arrived under; doubles as the
    /// conversation-key-store namespace.
    pub source: String,
    pub agent_name: String,
    pub prompt: String,
    /// Conversation key resolved from the route's `session_key` dot-path.
    pub session_key: Option<String>,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait WebhookDispatcher: Send + Sync {
    async fn dispatch(&self, trigger: WebhookTrigger) -> anyhow::Result<()>;
}

// ─── Server state ─────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct WebhookMetrics {
    pub received: AtomicU64,
    pub rejected: AtomicU64,
    pub duplicates: AtomicU64,
    pub unmatched: AtomicU64,
    pub dispatched: AtomicU64,
}

struct Provider {
    kind: WebhookProviderKind,
    secret: Vec<u8>,
}

#[derive(Clone)]
pub struct WebhookState {
    providers: Arc<HashMap<String, Provider>>,
    routes: Arc<Vec<drover_config::WebhookRouteConfig>>,
    idempotency: Arc<IdempotencySet>,
    dispatcher: Arc<dyn WebhookDispatcher>,
    pub metrics: Arc<WebhookMetrics>,
}

impl WebhookState {
    /// Build server state, resolving provider secrets from the
    /// environment. A configured-but-unset secret env var is a startup
    /// error, not a silent unverified provider.
    pub fn from_config(
        config: &WebhookConfig,
        idempotency: Arc<IdempotencySet>,
        dispatcher: Arc<dyn WebhookDispatcher>,
    ) -> anyhow::Result<Self> {
        let mut providers = HashMap::new();
        for (name, provider) in &config.providers {
            let secret = match (&provider.kind, &provider.secret_env) {
                (WebhookProviderKind::Unverified, _) => Vec::new(),
                (_, Some(env)) => std::env::var(env)
                    .map_err(|_| {
                        anyhow::anyhow!("webhook provider '{name}': env var {env} is not set")
                    })?
                    .into_bytes(),
                (_, None) => anyhow::bail!("webhook provider '{name}' has no secret_env"),
            };
            providers.insert(
                name.clone(),
                Provider {
                    kind: provider.kind,
                    secret,
                },
            );
        }
        Ok(Self {
            providers: Arc::new(providers),
            routes: Arc::new(config.routes.clone()),
            idempotency,
            dispatcher,
            metrics: Arc::new(WebhookMetrics::default()),
        })
    }
}

/// Providers retry aggressively; cap bodies well above any real payload
/// but below anything that could exhaust memory.
const MAX_BODY_BYTES: usize = 1024 * 1024;

pub fn build_router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhooks/:provider", post(receive))
        .layer(tower_http::limit::RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

/// Bind and serve. Returns the bound address and the server task.
pub async fn serve(
    listen: &str,
    state: WebhookState,
) -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    let addr = listener.local_addr()?;
    info!(addr = %addr, "webhook server listening");
    let app = build_router(state);
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "webhook server exited");
        }
    });
    Ok((addr, task))
}

// ─── Handler ──────────────────────────────────────────────────────────────────

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

async fn receive(
    State(state): State<WebhookState>,
    Path(provider_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    state.metrics.received.fetch_add(1, Ordering::Relaxed);

    let Some(provider) = state.providers.get(&provider_name) else {
        return StatusCode::NOT_FOUND;
    };

    if let Err(e) = verify_signature(
        provider.kind,
        &provider.secret,
        &body,
        |name| header_value(&headers, name),
        Utc::now().timestamp(),
    ) {
        warn!(provider = %provider_name, error = %e, "webhook signature rejected");
        state.metrics.rejected.fetch_add(1, Ordering::Relaxed);
        return StatusCode::UNAUTHORIZED;
    }

    if let Some(header) = delivery_header(provider.kind) {
        if let Some(delivery_id) = header_value(&headers, header) {
            let scoped = format!("{provider_name}:{delivery_id}");
            if !state.idempotency.check_and_insert(&scoped, Utc::now()) {
                debug!(provider = %provider_name, delivery = %delivery_id, "duplicate delivery");
                state.metrics.duplicates.fetch_add(1, Ordering::Relaxed);
                return StatusCode::ACCEPTED;
            }
        }
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return StatusCode::BAD_REQUEST,
    };

    let Some(route) = match_route(&state.routes, &provider_name, &payload) else {
        // 202, not 404: never reveal which events are wired up.
        state.metrics.unmatched.fetch_add(1, Ordering::Relaxed);
        return StatusCode::ACCEPTED;
    };

    let prompt = render_template(&route.prompt, &payload);
    let session_key = route.session_key.as_deref().and_then(|path| {
        lookup_path(&payload, path).map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    });

    let trigger = WebhookTrigger {
        route_name: route.name.clone(),
        source: provider_name.clone(),
        agent_name: route.agent.clone(),
        prompt,
        session_key,
        payload,
    };
    state.metrics.dispatched.fetch_add(1, Ordering::Relaxed);

    // Processing is asynchronous; the provider gets its 202 immediately.
    let dispatcher = state.dispatcher.clone();
    tokio::spawn(async move {
        if let Err(e) = dispatcher.dispatch(trigger).await {
            warn!(error = %e, "webhook dispatch failed");
        }
    });

    StatusCode::ACCEPTED
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use hmac::Mac;

    use super::*;

    struct RecordingDispatcher {
        triggers: Mutex<Vec<WebhookTrigger>>,
    }

    #[async_trait]
    impl WebhookDispatcher for RecordingDispatcher {
        async fn dispatch(&self, trigger: WebhookTrigger) -> anyhow::Result<()> {
            self.triggers.lock().unwrap().push(trigger);
            Ok(())
        }
    }

    const SECRET: &str = "test-secret";

    fn sign(body: &[u8]) -> String {
        let mut mac =
            hmac::Hmac::<sha2::Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    async fn start() -> (SocketAddr, Arc<RecordingDispatcher>, WebhookState) {
        std::env::set_var("DROVER_TEST_WEBHOOK_SECRET", SECRET);
        let config: WebhookConfig = serde_yaml::from_str(concat!(
            "enabled: true\n",
            "providers:\n",
            "  linear:\n",
            "    kind: linear\n",
            "    secret_env: DROVER_TEST_WEBHOOK_SECRET\n",
            "routes:\n",
            "  - name: linear-issue-created\n",
            "    source: linear\n",
            "    event: Issue\n",
            "    action: create\n",
            "    agent: coder\n",
            "    prompt: \"Work on {{data.identifier}}: {{data.title}}\"\n",
            "    session_key: data.id\n",
        ))
        .unwrap();
        let dispatcher = Arc::new(RecordingDispatcher {
            triggers: Mutex::new(Vec::new()),
        });
        let state = WebhookState::from_config(
            &config,
            Arc::new(IdempotencySet::new(Duration::from_secs(3600))),
            dispatcher.clone(),
        )
        .unwrap();
        let (addr, _task) = serve("127.0.0.1:0", state.clone()).await.unwrap();
        (addr, dispatcher, state)
    }

    fn issue_body() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "action": "create",
            "type": "Issue",
            "data": { "id": "u1", "identifier": "ENG-42", "title": "x", "team": {"key": "ENG"} }
        }))
        .unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn verified_delivery_dispatches_trigger() {
        let (addr, dispatcher, _state) = start().await;
        let body = issue_body();
        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/webhooks/linear"))
            .header("linear-signature", sign(&body))
            .header("linear-delivery", "d-1")
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 202);
        settle().await;

        let triggers = dispatcher.triggers.lock().unwrap();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].agent_name, "coder");
        assert_eq!(triggers[0].prompt, "Work on ENG-42: x");
        assert_eq!(triggers[0].session_key.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn bad_signature_is_401_and_never_dispatches() {
        let (addr, dispatcher, state) = start().await;
        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/webhooks/linear"))
            .header("linear-signature", "deadbeef")
            .body(issue_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 401);
        settle().await;
        assert!(dispatcher.triggers.lock().unwrap().is_empty());
        assert_eq!(state.metrics.rejected.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn unknown_provider_is_404() {
        let (addr, _dispatcher, _state) = start().await;
        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/webhooks/nowhere"))
            .body("{}")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 404);
    }

    #[tokio::test]
    async fn unparseable_body_is_400() {
        let (addr, _dispatcher, _state) = start().await;
        let body = b"not json".to_vec();
        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/webhooks/linear"))
            .header("linear-signature", sign(&body))
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
    }

    #[tokio::test]
    async fn duplicate_delivery_dispatches_once() {
        let (addr, dispatcher, state) = start().await;
        let body = issue_body();
        let client = reqwest::Client::new();
        for _ in 0..3 {
            let resp = client
                .post(format!("http://{addr}/webhooks/linear"))
                .header("linear-signature", sign(&body))
                .header("linear-delivery", "dup-1")
                .body(body.clone())
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status().as_u16(), 202);
        }
        settle().await;
        assert_eq!(dispatcher.triggers.lock().unwrap().len(), 1);
        assert_eq!(state.metrics.duplicates.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn unmatched_route_is_202_with_metric() {
        let (addr, dispatcher, state) = start().await;
        let body = serde_json::to_vec(&serde_json::json!({
            "action": "delete", "type": "Issue", "data": {}
        }))
        .unwrap();
        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/webhooks/linear"))
            .header("linear-signature", sign(&body))
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 202);
        settle().await;
        assert!(dispatcher.triggers.lock().unwrap().is_empty());
        assert_eq!(state.metrics.unmatched.load(Ordering::Relaxed), 1);
    }
}
