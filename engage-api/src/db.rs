use async_trait::async_trait;

use crate::{Comment, CommentId, CommentRecord, Fingerprint, Stats, SubjectId, Time, ViewEvent};

/// Kind of logged action the rate limiter counts
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ActionClass {
    /// Comments submitted anywhere on the site
    Comment,

    /// Views recorded for one subject
    View(SubjectId),
}

/// The persistent store behind the engagement core
///
/// Implementations must give read-your-writes consistency, so that a count
/// issued after an insert on the same store sees that insert.
#[async_trait]
pub trait Db {
    async fn fetch_comment(&mut self, id: CommentId) -> anyhow::Result<Option<Comment>>;

    /// Assigns `created_at`, strictly later than any comment already stored and
    /// no earlier than `record.submitted_at`
    async fn insert_comment(&mut self, record: CommentRecord) -> anyhow::Result<Comment>;

    /// In no particular order
    async fn fetch_published_comments(&mut self, subject: &SubjectId)
        -> anyhow::Result<Vec<Comment>>;

    /// Number of logged actions of this class by `fingerprint` at or after `since`
    async fn count_actions_since(
        &mut self,
        fingerprint: &Fingerprint,
        class: &ActionClass,
        since: Time,
    ) -> anyhow::Result<u64>;

    async fn append_view(&mut self, view: ViewEvent) -> anyhow::Result<()>;

    /// Atomic upsert-with-increment of a subject's counters
    async fn bump_stats(
        &mut self,
        subject: &SubjectId,
        is_new_view: bool,
        now: Time,
    ) -> anyhow::Result<Stats>;

    async fn fetch_stats(&mut self, subject: &SubjectId) -> anyhow::Result<Option<Stats>>;
}
