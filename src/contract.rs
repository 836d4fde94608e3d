//! Schema-bound model calls.
//!
//! Every reply is parsed and validated by the caller-supplied closure. A
//! transport error, a timeout or a rejected reply all count as one failed
//! attempt; the second attempt carries a correction hint naming the
//! problem, and a second failure is final.

use regex::Regex;
use serde::de::DeserializeOwned;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

use crate::external::{ExternalError, LanguageModel, ModelRequest};

/// First attempt plus one corrective retry
pub const MAX_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractFailure {
    pub attempts: usize,
    pub reason: String,
}

fn trailing_comma() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r",(\s*[\]}])").unwrap())
}

/// Reduce a model reply to the JSON object it is supposed to be.
///
/// Strips Markdown code fences and surrounding prose, and removes trailing
/// commas before closing brackets.
pub fn sanitize_reply(reply: &str) -> String {
    let mut body = reply.trim();
    if let Some(rest) = body.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        body = rest.strip_suffix("```").unwrap_or(rest).trim();
    }

    if let (Some(open), Some(close)) = (body.find('{'), body.rfind('}')) {
        if open < close {
            body = &body[open..=close];
        }
    }

    trailing_comma().replace_all(body, "$1").into_owned()
}

/// Parse a sanitized reply into `T`, describing the failure as text
pub fn parse_json<T: DeserializeOwned>(reply: &str) -> Result<T, String> {
    serde_json::from_str(&sanitize_reply(reply)).map_err(|e| format!("invalid JSON: {}", e))
}

fn correction_hint(prompt: &str, reason: &str) -> String {
    format!(
        "{}\n\nYour previous reply was rejected: {}\n\
         Respond again with only a JSON object that satisfies the required schema.",
        prompt, reason
    )
}

/// Call the model until `parse` accepts a reply, at most [`MAX_ATTEMPTS`] times
pub async fn call_with_retry<T, F>(
    model: &dyn LanguageModel,
    request: &ModelRequest,
    timeout: Duration,
    parse: F,
) -> Result<T, ContractFailure>
where
    F: Fn(&str) -> Result<T, String>,
{
    let mut attempt_request = request.clone();
    let mut reason = String::new();

    for attempt in 1..=MAX_ATTEMPTS {
        if attempt > 1 {
            attempt_request.prompt = correction_hint(&request.prompt, &reason);
        }

        let outcome = match tokio::time::timeout(timeout, model.complete(&attempt_request)).await {
            Err(_) => Err(ExternalError::Timeout(timeout).to_string()),
            Ok(Err(e)) => Err(e.to_string()),
            Ok(Ok(reply)) => parse(&reply),
        };

        match outcome {
            Ok(value) => {
                debug!(attempt, "Model reply accepted");
                return Ok(value);
            }
            Err(e) => {
                warn!(attempt, max_attempts = MAX_ATTEMPTS, reason = %e, "Model reply rejected");
                reason = e;
            }
        }
    }

    Err(ContractFailure {
        attempts: MAX_ATTEMPTS,
        reason,
    })
}
