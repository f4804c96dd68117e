// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod idempotency;
mod routes;
mod server;
mod verify;

pub use idempotency::IdempotencySet;
pub use routes::{lookup_path, match_route, render_template, route_matches};
pub use server::{
    build_router, serve, WebhookDispatcher, WebhookMetrics, WebhookState, WebhookTrigger,
};
pub use verify::{delivery_header, signature_header, verify_signature, VerifyError};
