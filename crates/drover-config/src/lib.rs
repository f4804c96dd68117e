// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod loader;
mod schema;
mod validate;

pub use loader::load;
pub use schema::*;
pub use validate::ValidationError;
