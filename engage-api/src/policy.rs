use std::{fmt, str::FromStr};

use anyhow::anyhow;
use chrono::Duration;

use crate::RateLimit;

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModerationMode {
    /// Comments that pass the gate are visible immediately
    Open,

    /// Comments that pass the gate are held until approved out-of-band
    Manual,
}

impl FromStr for ModerationMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<ModerationMode> {
        match s {
            "open" => Ok(ModerationMode::Open),
            "manual" => Ok(ModerationMode::Manual),
            _ => Err(anyhow!("unknown moderation mode {s:?}, expected open or manual")),
        }
    }
}

/// Server-held secret mixed into every fingerprint
#[derive(Clone)]
pub struct Salt(pub String);

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Salt(..)")
    }
}

#[derive(Clone, Debug)]
pub struct Policy {
    pub fingerprint_salt: Salt,
    pub anonymous_comments: RateLimit,
    pub authenticated_comments: RateLimit,
    /// A repeat view of a subject by the same fingerprint within this window is
    /// not counted as unique
    pub view_dedup_window: Duration,
    /// Deepest nesting a reply may reach, roots being at depth 0
    pub max_reply_depth: Option<usize>,
    pub moderation: ModerationMode,
}

impl Policy {
    pub fn with_salt(salt: impl Into<String>) -> Policy {
        Policy {
            fingerprint_salt: Salt(salt.into()),
            ..Policy::default()
        }
    }

    pub fn comment_limit(&self, authenticated: bool) -> &RateLimit {
        match authenticated {
            true => &self.authenticated_comments,
            false => &self.anonymous_comments,
        }
    }

    /// Whether a comment at `depth` may still receive replies
    pub fn accepts_replies_at(&self, depth: usize) -> bool {
        self.max_reply_depth.map_or(true, |max| depth < max)
    }
}

impl Default for Policy {
    fn default() -> Policy {
        Policy {
            fingerprint_salt: Salt(String::new()),
            anonymous_comments: RateLimit::new(3, Duration::minutes(5)),
            authenticated_comments: RateLimit::new(10, Duration::minutes(5)),
            view_dedup_window: Duration::minutes(30),
            max_reply_depth: Some(5),
            moderation: ModerationMode::Open,
        }
    }
}
