use std::{fmt, str::FromStr};

use anyhow::{anyhow, Context};
use serde_json::json;
use uuid::Uuid;

use crate::CommentId;

/// Input field a validation error refers to
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Field {
    SubjectId,
    ParentId,
    Body,
    AuthorName,
    AuthorEmail,
    Referrer,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Field::SubjectId => "subject-id",
            Field::ParentId => "parent-id",
            Field::Body => "body",
            Field::AuthorName => "author-name",
            Field::AuthorEmail => "author-email",
            Field::Referrer => "referrer",
        })
    }
}

impl FromStr for Field {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Field> {
        Ok(match s {
            "subject-id" => Field::SubjectId,
            "parent-id" => Field::ParentId,
            "body" => Field::Body,
            "author-name" => Field::AuthorName,
            "author-email" => Field::AuthorEmail,
            "referrer" => Field::Referrer,
            _ => return Err(anyhow!("unknown field name {s:?}")),
        })
    }
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Null byte in string is not allowed {0:?}")]
    NullByteInString(String),

    #[error("Invalid {field}: {message}")]
    Validation { field: Field, message: String },

    #[error("Too many submissions, try again later")]
    RateLimited,

    #[error("Parent comment {0:?} does not exist")]
    ParentNotFound(CommentId),

    #[error("Parent comment {0:?} belongs to another subject")]
    ParentInOtherSubject(CommentId),
}

impl Error {
    pub fn invalid(field: Field, message: impl Into<String>) -> Error {
        Error::Validation {
            field,
            message: message.into(),
        }
    }

    /// Whether this error means the caller or a tampering client broke a
    /// store invariant, as opposed to merely sending bad input
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Error::ParentNotFound(_) | Error::ParentInOtherSubject(_)
        )
    }

    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Error::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::PermissionDenied => StatusCode::FORBIDDEN,
            Error::NullByteInString(_) => StatusCode::BAD_REQUEST,
            Error::Validation { .. } => StatusCode::BAD_REQUEST,
            Error::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Error::ParentNotFound(_) => StatusCode::CONFLICT,
            Error::ParentInOtherSubject(_) => StatusCode::CONFLICT,
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        serde_json::to_vec(&match self {
            Error::Unknown(msg) => json!({
                "message": msg,
                "type": "unknown",
            }),
            Error::PermissionDenied => json!({
                "message": "permission denied",
                "type": "permission-denied",
            }),
            Error::NullByteInString(s) => json!({
                "message": "there was a null byte in argument string",
                "type": "null-byte",
                "string": s,
            }),
            Error::Validation { field, message } => json!({
                "message": message,
                "type": "invalid-field",
                "field": field.to_string(),
            }),
            // Reveals neither the current count nor the remaining time
            Error::RateLimited => json!({
                "message": "too many submissions, please wait a few minutes and try again",
                "type": "rate-limited",
            }),
            Error::ParentNotFound(c) => json!({
                "message": "parent comment does not exist",
                "type": "parent-not-found",
                "parent": c.0,
            }),
            Error::ParentInOtherSubject(c) => json!({
                "message": "parent comment belongs to another subject",
                "type": "parent-in-other-subject",
                "parent": c.0,
            }),
        })
        .expect("serializing error contents")
    }

    pub fn parse(body: &[u8]) -> anyhow::Result<Error> {
        let data: serde_json::Value =
            serde_json::from_slice(body).context("parsing error contents")?;
        let parent = || {
            data.get("parent")
                .and_then(|p| p.as_str())
                .and_then(|p| Uuid::from_str(p).ok())
                .map(CommentId)
                .ok_or_else(|| anyhow!("error is about a parent comment without a proper uuid"))
        };
        Ok(
            match data
                .get("type")
                .and_then(|t| t.as_str())
                .ok_or_else(|| anyhow!("error type is not a string"))?
            {
                "unknown" => Error::Unknown(String::from(
                    data.get("message")
                        .and_then(|msg| msg.as_str())
                        .unwrap_or(""),
                )),
                "permission-denied" => Error::PermissionDenied,
                "null-byte" => Error::NullByteInString(String::from(
                    data.get("string").and_then(|s| s.as_str()).ok_or_else(|| {
                        anyhow!("error is a null-byte-in-string without a string")
                    })?,
                )),
                "invalid-field" => Error::Validation {
                    field: data
                        .get("field")
                        .and_then(|f| f.as_str())
                        .ok_or_else(|| anyhow!("error is an invalid field without a field"))?
                        .parse()?,
                    message: String::from(
                        data.get("message")
                            .and_then(|msg| msg.as_str())
                            .unwrap_or(""),
                    ),
                },
                "rate-limited" => Error::RateLimited,
                "parent-not-found" => Error::ParentNotFound(parent()?),
                "parent-in-other-subject" => Error::ParentInOtherSubject(parent()?),
                _ => return Err(anyhow!("error contents has unknown type")),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_errors() -> Vec<Error> {
        vec![
            Error::Unknown(String::from("Internal server error, please try again")),
            Error::PermissionDenied,
            Error::NullByteInString(String::from("foo\0bar")),
            Error::invalid(Field::Body, "must be between 10 and 2000 characters long"),
            Error::RateLimited,
            Error::ParentNotFound(CommentId(Uuid::new_v4())),
            Error::ParentInOtherSubject(CommentId(Uuid::new_v4())),
        ]
    }

    #[test]
    fn errors_survive_json() {
        for e in all_errors() {
            assert_eq!(Error::parse(&e.contents()).unwrap(), e);
        }
    }

    #[test]
    fn rate_limit_does_not_leak_limiter_state() {
        let body = String::from_utf8(Error::RateLimited.contents()).unwrap();
        assert!(!body.chars().any(|c| c.is_ascii_digit()), "{body}");
    }

    #[test]
    fn invariant_violations_are_distinct_from_validation() {
        let parent = CommentId(Uuid::new_v4());
        assert!(Error::ParentNotFound(parent).is_invariant_violation());
        assert!(Error::ParentInOtherSubject(parent).is_invariant_violation());
        assert!(!Error::invalid(Field::ParentId, "thread is too deep").is_invariant_violation());
        assert_ne!(
            Error::ParentNotFound(parent).status_code(),
            Error::invalid(Field::ParentId, "x").status_code()
        );
    }

    #[test]
    fn unknown_type_is_refused() {
        assert!(Error::parse(br#"{"type": "nope"}"#).is_err());
        assert!(Error::parse(br#"{"type": "invalid-field", "field": "nope"}"#).is_err());
    }
}
