//! Result envelopes returned by every public safety-layer operation

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Success or failure of one operation invocation, with a message for operators.
///
/// `T` is the payload of a success and `F` the payload of a failure, so a result can never
/// claim success while carrying failure details (or the reverse). Outcomes are built once and
/// never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome<T, F> {
    Success {
        message: String,
        timestamp: DateTime<Utc>,
        #[serde(flatten)]
        detail: T,
    },
    Failure {
        message: String,
        timestamp: DateTime<Utc>,
        #[serde(flatten)]
        detail: F,
    },
}

impl<T, F> Outcome<T, F> {
    pub fn success(message: impl Into<String>, detail: T) -> Self {
        Outcome::Success {
            message: message.into(),
            timestamp: Utc::now(),
            detail,
        }
    }

    pub fn failure(message: impl Into<String>, detail: F) -> Self {
        Outcome::Failure {
            message: message.into(),
            timestamp: Utc::now(),
            detail,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    pub fn message(&self) -> &str {
        match self {
            Outcome::Success { message, .. } | Outcome::Failure { message, .. } => message,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Outcome::Success { timestamp, .. } | Outcome::Failure { timestamp, .. } => *timestamp,
        }
    }

    pub fn success_detail(&self) -> Option<&T> {
        match self {
            Outcome::Success { detail, .. } => Some(detail),
            Outcome::Failure { .. } => None,
        }
    }

    pub fn failure_detail(&self) -> Option<&F> {
        match self {
            Outcome::Success { .. } => None,
            Outcome::Failure { detail, .. } => Some(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct Applied {
        count: usize,
    }

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct Broken {
        error: String,
    }

    #[test]
    fn accessors_follow_the_variant() {
        let ok: Outcome<Applied, Broken> = Outcome::success("done", Applied { count: 2 });
        assert!(ok.is_success());
        assert_eq!(ok.message(), "done");
        assert_eq!(ok.success_detail().map(|d| d.count), Some(2));
        assert!(ok.failure_detail().is_none());

        let err: Outcome<Applied, Broken> = Outcome::failure(
            "boom",
            Broken {
                error: "disk full".into(),
            },
        );
        assert!(err.is_failure());
        assert!(err.success_detail().is_none());
    }

    #[test]
    fn serializes_with_status_tag_and_flattened_detail() {
        let ok: Outcome<Applied, Broken> = Outcome::success("done", Applied { count: 2 });
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["count"], 2);
        assert_eq!(json["message"], "done");
    }
}
