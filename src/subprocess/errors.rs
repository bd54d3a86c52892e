use crate::error::DriverError;
use serde_json::Value;

/// Substrings that mark a `result` message as a context-limit failure
/// (spec.md §4.6). Checked against the message's `result` text when
/// `type == "result"` and `is_error == true`.
const CONTEXT_LIMIT_SUBSTRINGS: &[&str] = &["too long", "context", "limit"];

/// Substrings gleaned from a stale-resume-token failure's stderr, used to
/// sub-classify `ResumeFailed` (spec.md §4.6).
const SESSION_GONE_SUBSTRINGS: &[&str] = &["no longer exists", "session not found"];
const CONTEXT_WINDOW_SUBSTRINGS: &[&str] = &["context window", "maximum context"];

/// Accumulated signals observed across a subprocess's stderr stream.
/// The classifier is intentionally heuristic/substring-based — per
/// spec.md §9's own caveat, this may false-positive on user-originating
/// text that happens to echo one of these substrings.
#[derive(Debug, Default, Clone)]
pub struct StderrFlags {
    pub overloaded: bool,
    pub rate_limited: bool,
    pub service_unavailable: bool,
    pub unauthorized: bool,
    pub session_gone: bool,
    pub context_window: bool,
}

impl StderrFlags {
    pub fn observe_line(&mut self, line: &str) {
        let lower = line.to_lowercase();
        if lower.contains("529") || lower.contains("overloaded") {
            self.overloaded = true;
        }
        if contains_any(&lower, &["rate limit"]) || lower.contains("429") {
            self.rate_limited = true;
        }
        if matches_status_code_class_5xx(&lower) {
            self.service_unavailable = true;
        }
        if lower.contains("401") || contains_any(&lower, &["unauthorized", "authentication"]) {
            self.unauthorized = true;
        }
        if contains_any(&lower, SESSION_GONE_SUBSTRINGS) {
            self.session_gone = true;
        }
        if contains_any(&lower, CONTEXT_WINDOW_SUBSTRINGS) {
            self.context_window = true;
        }
    }

    /// Highest-priority transient/terminal error observed, if any, in the
    /// order spec.md §4.6 lists them.
    pub fn classify(&self) -> Option<DriverError> {
        if self.overloaded {
            return Some(DriverError::Overloaded);
        }
        if self.service_unavailable {
            return Some(DriverError::ServiceUnavailable);
        }
        if self.rate_limited {
            return Some(DriverError::RateLimited);
        }
        if self.unauthorized {
            return Some(DriverError::Unauthorized);
        }
        None
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// `"50[234]"` — any of 502/503/504.
fn matches_status_code_class_5xx(s: &str) -> bool {
    ["502", "503", "504"].iter().any(|code| s.contains(code))
}

/// Detects the context-limit terminal pattern in a parsed stdout message:
/// `type = "result"` with `is_error = true` and `result` text containing
/// any of {"too long", "context", "limit"}.
pub fn classify_result_message(message: &Value) -> Option<DriverError> {
    if message.get("type").and_then(Value::as_str) != Some("result") {
        return None;
    }
    if message.get("is_error").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    let text = message.get("result").and_then(Value::as_str)?.to_lowercase();
    if CONTEXT_LIMIT_SUBSTRINGS.iter().any(|s| text.contains(s)) {
        return Some(DriverError::ContextLimit(text));
    }
    None
}

/// Exit code != 0 with zero messages produced and a resume token had been
/// supplied → `ResumeFailed`, sub-classified from stderr substrings
/// (spec.md §4.6).
pub fn classify_resume_failure(
    exit_success: bool,
    message_count: u64,
    resume_token_supplied: bool,
    stderr: &StderrFlags,
) -> Option<DriverError> {
    if exit_success || message_count > 0 || !resume_token_supplied {
        return None;
    }
    let reason = if stderr.session_gone {
        "session no longer exists"
    } else if stderr.context_window {
        "context window exceeded"
    } else {
        "resume failed"
    };
    Some(DriverError::ResumeFailed(reason.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn context_limit_detected_from_result_text() {
        let msg = json!({"type": "result", "is_error": true, "result": "prompt is too long"});
        assert!(matches!(classify_result_message(&msg), Some(DriverError::ContextLimit(_))));
    }

    #[test]
    fn non_error_result_is_not_context_limit() {
        let msg = json!({"type": "result", "is_error": false, "result": "too long"});
        assert!(classify_result_message(&msg).is_none());
    }

    #[test]
    fn stderr_flags_classify_in_priority_order() {
        let mut flags = StderrFlags::default();
        flags.observe_line("error: 529 overloaded");
        flags.observe_line("error: rate limit hit, 429");
        assert!(matches!(flags.classify(), Some(DriverError::Overloaded)));
    }

    #[test]
    fn resume_failure_requires_zero_messages_and_prior_token() {
        let flags = StderrFlags::default();
        assert!(classify_resume_failure(false, 0, true, &flags).is_some());
        assert!(classify_resume_failure(false, 1, true, &flags).is_none());
        assert!(classify_resume_failure(false, 0, false, &flags).is_none());
        assert!(classify_resume_failure(true, 0, true, &flags).is_none());
    }
}
