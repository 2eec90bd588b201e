/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use http::StatusCode;

/// Raised by the signature gate. The only error that reaches the HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("signature required for {method} {route}")]
    SignatureRequired {
        method: String,
        route: String,
        /// Forced status; `None` leaves the default (403).
        status: Option<StatusCode>,
    },
}

impl GateError {
    pub fn status(&self) -> StatusCode {
        match self {
            GateError::SignatureRequired { status, .. } => status.unwrap_or(StatusCode::FORBIDDEN),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("{url} answered {status}")]
    Status { url: String, status: StatusCode },
    #[error("invalid json from {url}: {source}")]
    Parse {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{url} sent more than {limit} bytes")]
    TooLarge { url: String, limit: usize },
    #[error("malformed collection from {url}: {reason}")]
    Malformed { url: String, reason: String },
}
