use anyhow::Context;

use crate::{count_recent_actions, ActionClass, Db, Error, Fingerprint, Policy, SubjectId, Time};

pub const MAX_REFERRER_LEN: usize = 500;

/// A page view as reported by the page being rendered
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct NewView {
    #[serde(default)]
    pub referrer: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ViewEvent {
    pub subject_id: SubjectId,
    pub fingerprint: Fingerprint,
    pub viewed_at: Time,
    pub referrer: Option<String>,
}

/// Rolling aggregate of the views of one subject
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Stats {
    pub subject_id: SubjectId,
    pub total_views: u64,
    /// Never above `total_views`
    pub unique_views: u64,
    pub last_viewed_at: Option<Time>,
}

impl Stats {
    pub fn zeroed(subject_id: SubjectId) -> Stats {
        Stats {
            subject_id,
            total_views: 0,
            unique_views: 0,
            last_viewed_at: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ViewRecorded {
    pub total_views: u64,
    pub unique_views: u64,
    pub is_new_view: bool,
}

fn normalize_referrer(referrer: Option<String>) -> Option<String> {
    let referrer = referrer?;
    let referrer = referrer.trim();
    if referrer.is_empty() || crate::validate_string(referrer).is_err() {
        return None;
    }
    Some(referrer.chars().take(MAX_REFERRER_LEN).collect())
}

/// Records one page view and returns the subject's updated counters
///
/// Never fails: view counting must not get in the way of the page. Storage
/// failures are logged and swallowed. The event append and the counter upsert
/// are both attempted whatever happens to the other; a failed dedup lookup
/// counts the view as a repeat, and a failed upsert yields zeroed counters.
pub async fn record_view<D: Db>(
    db: &mut D,
    policy: &Policy,
    subject: &SubjectId,
    view: NewView,
    raw_address: Option<&str>,
    now: Time,
) -> ViewRecorded {
    if let Err(err) = subject.validate() {
        tracing::debug!(%err, "not recording view of invalid subject");
        return ViewRecorded {
            total_views: 0,
            unique_views: 0,
            is_new_view: false,
        };
    }

    let fingerprint = Fingerprint::of(raw_address, &policy.fingerprint_salt.0);
    let class = ActionClass::View(subject.clone());
    let is_new_view =
        match count_recent_actions(db, &fingerprint, &class, policy.view_dedup_window, now).await {
            Ok(recent) => recent == 0,
            Err(err) => {
                tracing::warn!(%subject, ?err, "view dedup lookup failed, counting as repeat");
                false
            }
        };

    if is_new_view {
        let event = ViewEvent {
            subject_id: subject.clone(),
            fingerprint,
            viewed_at: now,
            referrer: normalize_referrer(view.referrer),
        };
        if let Err(err) = db.append_view(event).await {
            tracing::warn!(%subject, ?err, "failed appending view event");
        }
    }

    match db.bump_stats(subject, is_new_view, now).await {
        Ok(stats) => ViewRecorded {
            total_views: stats.total_views,
            unique_views: stats.unique_views,
            is_new_view,
        },
        Err(err) => {
            tracing::warn!(%subject, ?err, "failed updating engagement stats");
            ViewRecorded {
                total_views: 0,
                unique_views: 0,
                is_new_view,
            }
        }
    }
}

/// Current counters of a subject, zeroed if it was never viewed
pub async fn get_stats<D: Db>(
    db: &mut D,
    subject: &SubjectId,
) -> anyhow::Result<Result<Stats, Error>> {
    if let Err(err) = subject.validate() {
        return Ok(Err(err));
    }
    let stats = db
        .fetch_stats(subject)
        .await
        .with_context(|| format!("fetching engagement stats of {subject}"))?;
    Ok(Ok(stats.unwrap_or_else(|| Stats::zeroed(subject.clone()))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referrer_normalization() {
        assert_eq!(normalize_referrer(None), None);
        assert_eq!(normalize_referrer(Some(String::from("   "))), None);
        assert_eq!(normalize_referrer(Some(String::from("a\0b"))), None);
        assert_eq!(
            normalize_referrer(Some(String::from(" https://example.com/ "))),
            Some(String::from("https://example.com/"))
        );
        let long = "é".repeat(MAX_REFERRER_LEN + 20);
        assert_eq!(
            normalize_referrer(Some(long))
                .map(|r| r.chars().count()),
            Some(MAX_REFERRER_LEN)
        );
    }

    #[test]
    fn new_view_accepts_missing_referrer() {
        let v: NewView = serde_json::from_str("{}").unwrap();
        assert_eq!(v, NewView::default());
    }
}
