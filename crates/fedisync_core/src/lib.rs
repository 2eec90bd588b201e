/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod collection_sync;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod fetch;
pub mod follow_state;
pub mod handlers;
pub mod http_sig;
pub mod reconcile;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod signature_gate;
pub mod store;
