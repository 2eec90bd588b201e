/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::DeferSignatures;
use crate::error::GateError;
use http::{Method, StatusCode};

/// What the deferral hook gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct GateRequest<'a> {
    pub method: &'a Method,
    pub route: &'a str,
    pub authorized_fetch: bool,
}

pub type DeferHook = Box<dyn Fn(&GateRequest<'_>) -> bool + Send + Sync>;

pub fn defer_hook(preset: DeferSignatures) -> DeferHook {
    match preset {
        DeferSignatures::Never => Box::new(|_| false),
        DeferSignatures::Always => Box::new(|_| true),
        DeferSignatures::ReadsOnly => Box::new(|req| is_read(req.method)),
    }
}

fn is_read(method: &Method) -> bool {
    !matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE)
}

// Peers must be able to fetch our key before they can check our signed
// fetches; the outbox authenticates local clients by token.
fn is_unsigned_route(method: &Method, route: &str) -> bool {
    match *method {
        Method::GET => route == "/actor",
        Method::POST => route
            .strip_prefix("/users/")
            .and_then(|rest| rest.split_once('/'))
            .is_some_and(|(id, leaf)| leaf == "outbox" && id.parse::<u64>().is_ok()),
        _ => false,
    }
}

/// Decides per request whether a valid HTTP signature is required.
pub struct SignatureGate {
    authorized_fetch: bool,
    defer: DeferHook,
}

impl SignatureGate {
    pub fn new(authorized_fetch: bool, defer: DeferHook) -> Self {
        Self { authorized_fetch, defer }
    }

    pub fn from_preset(authorized_fetch: bool, preset: DeferSignatures) -> Self {
        Self::new(authorized_fetch, defer_hook(preset))
    }

    /// Whether the caller has to run the signature verifier at all.
    pub fn needs_signature(&self, method: &Method, route: &str) -> bool {
        if *method == Method::HEAD || is_unsigned_route(method, route) {
            return false;
        }
        let req = GateRequest {
            method,
            route,
            authorized_fetch: self.authorized_fetch,
        };
        if (self.defer)(&req) {
            return false;
        }
        !is_read(method) || self.authorized_fetch
    }

    pub fn verify(&self, method: &Method, route: &str, signature_valid: bool) -> Result<(), GateError> {
        if signature_valid || !self.needs_signature(method, route) {
            return Ok(());
        }
        let status = (*method == Method::POST).then_some(StatusCode::UNAUTHORIZED);
        Err(GateError::SignatureRequired {
            method: method.to_string(),
            route: route.to_string(),
            status,
        })
    }
}
