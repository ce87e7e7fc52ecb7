//! Per-request handling: decode, decide, translate the decision.

use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::ratelimit::{AdmissionController, Decision, RequestContext};

/// One inbound request as read from the input stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundRequest {
    /// Request attributes
    #[serde(flatten)]
    pub context: RequestContext,

    /// Arrival time; the wall clock is used when absent
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// What the host should do with a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// Whether the request may proceed to business logic
    pub admitted: bool,
    /// Response status: 200 when admitted, otherwise the short-circuit status
    pub status: u16,
    /// Short-circuit body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<serde_json::Value>,
    /// Set when the input could not be decoded; never sent to the client
    #[serde(skip)]
    pub malformed: bool,
}

impl Outcome {
    /// Translate a decision; a deny carries exactly the configured status and message.
    pub fn from_decision(decision: Decision) -> Self {
        match decision {
            Decision::Admit => Self {
                admitted: true,
                status: StatusCode::OK.as_u16(),
                message: None,
                malformed: false,
            },
            Decision::Deny { status_code, message } => Self {
                admitted: false,
                status: status_code.as_u16(),
                message: Some(message),
                malformed: false,
            },
        }
    }

    /// Outcome for input that could not be decoded.
    pub fn malformed(reason: impl std::fmt::Display) -> Self {
        Self {
            admitted: false,
            status: StatusCode::BAD_REQUEST.as_u16(),
            message: Some(serde_json::Value::String(reason.to_string())),
            malformed: true,
        }
    }

    /// Whether this outcome came from the rate limiter rather than bad input.
    pub fn is_throttled(&self) -> bool {
        !self.admitted && !self.malformed
    }
}

/// Runs inbound requests through a shared admission controller.
#[derive(Clone)]
pub struct ReplayService {
    controller: Arc<AdmissionController>,
}

impl ReplayService {
    pub fn new(controller: Arc<AdmissionController>) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &Arc<AdmissionController> {
        &self.controller
    }

    /// Decide on one request.
    pub fn handle(&self, request: &InboundRequest) -> Outcome {
        let decision = match request.timestamp {
            Some(now) => self.controller.decide(&request.context, now),
            None => self.controller.check(&request.context),
        };
        Outcome::from_decision(decision)
    }

    /// Decode one JSON line and decide on it.
    ///
    /// Malformed input never reaches the window.
    #[instrument(skip(self, line), fields(len = line.len()))]
    pub fn handle_line(&self, line: &str) -> Outcome {
        match serde_json::from_str::<InboundRequest>(line) {
            Ok(request) => {
                let outcome = self.handle(&request);
                debug!(admitted = outcome.admitted, status = outcome.status, "Request processed");
                outcome
            }
            Err(e) => {
                warn!(error = %e, "Received malformed request");
                Outcome::malformed(format!("malformed request: {}", e))
            }
        }
    }
}
