use std::collections::{BTreeMap, HashMap};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Duration;
use engage_api::{
    ActionClass, Actor, Comment, CommentId, CommentRecord, Db, Error, Fingerprint, NewComment,
    NewView, Policy, Stats, SubjectId, Submission, Submitted, ThreadNode, Time, Uuid, ViewEvent,
    ViewRecorded,
};

/// In-memory store, with knobs to make each kind of write fail
#[derive(Debug, Default)]
pub struct MockDb {
    comments: BTreeMap<CommentId, Comment>,
    views: Vec<ViewEvent>,
    stats: HashMap<SubjectId, Stats>,
    last_created_at: Option<Time>,
    pub fail_counts: bool,
    pub fail_comment_inserts: bool,
    pub fail_view_appends: bool,
    pub fail_stats: bool,
}

impl MockDb {
    pub fn new() -> MockDb {
        MockDb::default()
    }

    pub fn test_comments(&self) -> impl Iterator<Item = &Comment> {
        self.comments.values()
    }

    pub fn test_views(&self) -> &[ViewEvent] {
        &self.views
    }

    pub fn test_publish(&mut self, id: CommentId) {
        if let Some(c) = self.comments.get_mut(&id) {
            c.published = true;
        }
    }
}

#[async_trait]
impl Db for MockDb {
    async fn fetch_comment(&mut self, id: CommentId) -> anyhow::Result<Option<Comment>> {
        Ok(self.comments.get(&id).cloned())
    }

    async fn insert_comment(&mut self, record: CommentRecord) -> anyhow::Result<Comment> {
        if self.fail_comment_inserts {
            return Err(anyhow!("mock comment insert failure"));
        }
        let created_at = match self.last_created_at {
            Some(last) if last >= record.submitted_at => last + Duration::microseconds(1),
            _ => record.submitted_at,
        };
        self.last_created_at = Some(created_at);
        let comment = Comment {
            id: record.id,
            subject_id: record.subject_id,
            author_name: record.author_name,
            author_email: record.author_email,
            body: record.body,
            parent_id: record.parent_id,
            actor_id: record.actor_id,
            fingerprint: record.fingerprint,
            created_at,
            published: record.published,
        };
        self.comments.insert(comment.id, comment.clone());
        Ok(comment)
    }

    async fn fetch_published_comments(
        &mut self,
        subject: &SubjectId,
    ) -> anyhow::Result<Vec<Comment>> {
        Ok(self
            .comments
            .values()
            .filter(|c| c.published && c.subject_id == *subject)
            .cloned()
            .collect())
    }

    async fn count_actions_since(
        &mut self,
        fingerprint: &Fingerprint,
        class: &ActionClass,
        since: Time,
    ) -> anyhow::Result<u64> {
        if self.fail_counts {
            return Err(anyhow!("mock count failure"));
        }
        let count = match class {
            ActionClass::Comment => self
                .comments
                .values()
                .filter(|c| c.fingerprint == *fingerprint && c.created_at >= since)
                .count(),
            ActionClass::View(subject) => self
                .views
                .iter()
                .filter(|v| {
                    v.subject_id == *subject && v.fingerprint == *fingerprint && v.viewed_at >= since
                })
                .count(),
        };
        Ok(count as u64)
    }

    async fn append_view(&mut self, view: ViewEvent) -> anyhow::Result<()> {
        if self.fail_view_appends {
            return Err(anyhow!("mock view append failure"));
        }
        self.views.push(view);
        Ok(())
    }

    async fn bump_stats(
        &mut self,
        subject: &SubjectId,
        is_new_view: bool,
        now: Time,
    ) -> anyhow::Result<Stats> {
        if self.fail_stats {
            return Err(anyhow!("mock stats upsert failure"));
        }
        let stats = self
            .stats
            .entry(subject.clone())
            .or_insert_with(|| Stats::zeroed(subject.clone()));
        stats.total_views += 1;
        if is_new_view {
            stats.unique_views += 1;
        }
        stats.last_viewed_at = Some(stats.last_viewed_at.map_or(now, |last| last.max(now)));
        Ok(stats.clone())
    }

    async fn fetch_stats(&mut self, subject: &SubjectId) -> anyhow::Result<Option<Stats>> {
        if self.fail_stats {
            return Err(anyhow!("mock stats fetch failure"));
        }
        Ok(self.stats.get(subject).cloned())
    }
}

/// Reference model of the HTTP server, answering like it would
pub struct MockServer {
    pub db: MockDb,
    policy: Policy,
    sessions: HashMap<Uuid, Actor>,
}

fn flatten<T>(res: anyhow::Result<Result<T, Error>>) -> Result<T, Error> {
    match res {
        Ok(res) => res,
        Err(err) => Err(Error::Unknown(format!("{err:#}"))),
    }
}

impl MockServer {
    pub fn new(policy: Policy) -> MockServer {
        MockServer {
            db: MockDb::new(),
            policy,
            sessions: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Registers a session the way the external auth system would
    pub fn test_add_session(&mut self, token: Uuid, actor: Actor) {
        self.sessions.insert(token, actor);
    }

    fn resolve(&self, token: Option<Uuid>) -> Result<Option<Actor>, Error> {
        match token {
            None => Ok(None),
            Some(token) => match self.sessions.get(&token) {
                Some(actor) => Ok(Some(actor.clone())),
                None => Err(Error::PermissionDenied),
            },
        }
    }

    pub async fn submit_comment(
        &mut self,
        subject: SubjectId,
        comment: NewComment,
        token: Option<Uuid>,
        raw_address: Option<&str>,
        now: Time,
    ) -> Result<Submitted, Error> {
        let actor = self.resolve(token)?;
        let submission = Submission {
            subject,
            comment,
            actor,
            raw_address: raw_address.map(String::from),
        };
        flatten(engage_api::submit_comment(&mut self.db, &self.policy, submission, now).await)
    }

    pub async fn list_thread(&mut self, subject: &SubjectId) -> Result<Vec<ThreadNode>, Error> {
        flatten(engage_api::list_thread(&mut self.db, &self.policy, subject).await)
    }

    pub async fn record_view(
        &mut self,
        subject: &SubjectId,
        view: NewView,
        raw_address: Option<&str>,
        now: Time,
    ) -> ViewRecorded {
        engage_api::record_view(&mut self.db, &self.policy, subject, view, raw_address, now).await
    }

    pub async fn get_stats(&mut self, subject: &SubjectId) -> Result<Stats, Error> {
        flatten(engage_api::get_stats(&mut self.db, subject).await)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use engage_api::{ActorId, Field, ModerationMode, Outcome};

    use super::*;

    const X: &str = "198.51.100.23";
    const Y: &str = "198.51.100.24";

    fn t0() -> Time {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn post1() -> SubjectId {
        SubjectId::new("post-1")
    }

    fn anon(body: &str) -> NewComment {
        NewComment {
            parent_id: None,
            body: String::from(body),
            author_name: Some(String::from("Ada")),
            author_email: Some(String::from("ada@example.com")),
        }
    }

    fn reply(parent: CommentId, body: &str) -> NewComment {
        NewComment {
            parent_id: Some(parent),
            ..anon(body)
        }
    }

    fn server() -> MockServer {
        MockServer::new(Policy::with_salt("mock-salt"))
    }

    async fn post(s: &mut MockServer, c: NewComment, at: Time) -> Result<Submitted, Error> {
        s.submit_comment(post1(), c, None, Some(X), at).await
    }

    #[tokio::test]
    async fn anonymous_submission_scenario() {
        let mut s = server();
        let res = post(&mut s, anon("123456789"), t0()).await;
        assert!(matches!(
            res,
            Err(Error::Validation {
                field: Field::Body,
                ..
            })
        ));

        for i in 0..3 {
            let res = post(&mut s, anon("1234567890"), t0() + Duration::seconds(i)).await;
            assert_eq!(res.map(|r| r.outcome), Ok(Outcome::Published), "comment {i}");
        }
        let res = post(&mut s, anon("1234567890"), t0() + Duration::minutes(4)).await;
        assert_eq!(res, Err(Error::RateLimited));
        assert_eq!(s.db.test_comments().count(), 3);
    }

    #[tokio::test]
    async fn rate_limit_window_slides() {
        let mut s = server();
        for i in 0..3 {
            post(&mut s, anon("still a fine comment"), t0() + Duration::seconds(i))
                .await
                .unwrap();
        }
        let res = post(&mut s, anon("still a fine comment"), t0() + Duration::seconds(10)).await;
        assert_eq!(res, Err(Error::RateLimited));

        // the oldest comment leaves the window, so one more fits in
        let later = t0() + Duration::minutes(5) + Duration::microseconds(500);
        post(&mut s, anon("still a fine comment"), later).await.unwrap();
        let res = post(&mut s, anon("still a fine comment"), later).await;
        assert_eq!(res, Err(Error::RateLimited));

        // other visitors are not affected
        let res = s
            .submit_comment(post1(), anon("from another address"), None, Some(Y), later)
            .await;
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn rejected_submissions_do_not_count() {
        let mut s = server();
        for i in 0..5 {
            let res = post(&mut s, anon("short"), t0() + Duration::seconds(i)).await;
            assert!(res.is_err());
        }
        for i in 0..3 {
            post(&mut s, anon("long enough now"), t0() + Duration::seconds(10 + i))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn authenticated_limit_is_higher() {
        let mut s = server();
        let token = Uuid::new_v4();
        s.test_add_session(
            token,
            Actor {
                id: ActorId::stub(),
                name: String::from("Grace"),
                email: String::from("grace@example.com"),
            },
        );
        let comment = NewComment {
            author_name: None,
            author_email: None,
            ..anon("signed in and talkative")
        };
        for i in 0..10 {
            let res = s
                .submit_comment(post1(), comment.clone(), Some(token), Some(X), t0() + Duration::seconds(i))
                .await;
            assert!(res.is_ok(), "comment {i}: {res:?}");
        }
        let res = s
            .submit_comment(post1(), comment.clone(), Some(token), Some(X), t0() + Duration::seconds(20))
            .await;
        assert_eq!(res, Err(Error::RateLimited));

        let stored = s.db.test_comments().next().unwrap();
        assert_eq!(stored.author_name, "Grace");
        assert_eq!(stored.actor_id, Some(ActorId::stub()));

        let res = s
            .submit_comment(post1(), comment, Some(Uuid::new_v4()), Some(X), t0())
            .await;
        assert_eq!(res, Err(Error::PermissionDenied));
    }

    #[tokio::test]
    async fn three_level_chain() {
        let mut s = server();
        let a = post(&mut s, anon("comment A is a root"), t0()).await.unwrap();
        let b = post(&mut s, reply(a.comment_id, "comment B replies to A"), t0())
            .await
            .unwrap();
        let c = post(&mut s, reply(b.comment_id, "comment C replies to B"), t0())
            .await
            .unwrap();

        let thread = s.list_thread(&post1()).await.unwrap();
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].id, a.comment_id);
        assert_eq!(thread[0].depth, 0);
        assert_eq!(thread[0].replies.len(), 1);
        assert_eq!(thread[0].replies[0].id, b.comment_id);
        assert_eq!(thread[0].replies[0].replies.len(), 1);
        assert_eq!(thread[0].replies[0].replies[0].id, c.comment_id);
        assert_eq!(thread[0].replies[0].replies[0].depth, 2);

        // identical submission times still give a stable order
        assert_eq!(s.list_thread(&post1()).await.unwrap(), thread);
    }

    #[tokio::test]
    async fn bad_parents_are_refused() {
        let mut s = server();
        let missing = CommentId::new();
        let res = post(&mut s, reply(missing, "replying to nothing"), t0()).await;
        assert_eq!(res, Err(Error::ParentNotFound(missing)));

        let elsewhere = s
            .submit_comment(SubjectId::new("post-2"), anon("on another post"), None, Some(Y), t0())
            .await
            .unwrap();
        let res = post(&mut s, reply(elsewhere.comment_id, "crossing subjects"), t0()).await;
        assert_eq!(res, Err(Error::ParentInOtherSubject(elsewhere.comment_id)));
        assert!(res.unwrap_err().is_invariant_violation());

        assert!(s.list_thread(&post1()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn depth_is_capped() {
        let mut s = MockServer::new(Policy {
            anonymous_comments: engage_api::RateLimit::new(100, Duration::minutes(5)),
            max_reply_depth: Some(2),
            ..Policy::with_salt("mock-salt")
        });
        let a = post(&mut s, anon("depth zero comment"), t0()).await.unwrap();
        let b = post(&mut s, reply(a.comment_id, "depth one comment"), t0()).await.unwrap();
        let c = post(&mut s, reply(b.comment_id, "depth two comment"), t0()).await.unwrap();
        let res = post(&mut s, reply(c.comment_id, "depth three comment"), t0()).await;
        assert!(matches!(
            res,
            Err(Error::Validation {
                field: Field::ParentId,
                ..
            })
        ));

        let thread = s.list_thread(&post1()).await.unwrap();
        assert!(thread[0].accepts_replies);
        assert!(thread[0].replies[0].accepts_replies);
        assert!(!thread[0].replies[0].replies[0].accepts_replies);
    }

    #[tokio::test]
    async fn manual_moderation_holds() {
        let mut s = MockServer::new(Policy {
            moderation: ModerationMode::Manual,
            ..Policy::with_salt("mock-salt")
        });
        let held = post(&mut s, anon("waiting for approval"), t0()).await.unwrap();
        assert_eq!(held.outcome, Outcome::Held);
        assert!(s.list_thread(&post1()).await.unwrap().is_empty());

        // a reply to a held comment stays hidden with it even once approved
        let r = post(&mut s, reply(held.comment_id, "a reply to a held one"), t0())
            .await
            .unwrap();
        s.db.test_publish(r.comment_id);
        assert!(s.list_thread(&post1()).await.unwrap().is_empty());

        s.db.test_publish(held.comment_id);
        let thread = s.list_thread(&post1()).await.unwrap();
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].replies.len(), 1);

        // held comments still count against the limit
        post(&mut s, anon("third in the window"), t0()).await.unwrap();
        assert_eq!(
            post(&mut s, anon("fourth in the window"), t0()).await,
            Err(Error::RateLimited)
        );
    }

    #[tokio::test]
    async fn storage_failure_surfaces_for_comments() {
        let mut s = server();
        s.db.fail_comment_inserts = true;
        let res = post(&mut s, anon("this will not be stored"), t0()).await;
        assert!(matches!(res, Err(Error::Unknown(_))));
        assert_eq!(s.db.test_comments().count(), 0);

        s.db.fail_comment_inserts = false;
        s.db.fail_counts = true;
        let res = post(&mut s, anon("this will not be stored"), t0()).await;
        assert!(matches!(res, Err(Error::Unknown(_))));
    }

    #[tokio::test]
    async fn repeat_views_are_not_unique() {
        let mut s = server();
        let first = s.record_view(&post1(), NewView::default(), Some(X), t0()).await;
        assert_eq!(
            first,
            ViewRecorded {
                total_views: 1,
                unique_views: 1,
                is_new_view: true
            }
        );
        let second = s
            .record_view(&post1(), NewView::default(), Some(X), t0() + Duration::seconds(5))
            .await;
        assert_eq!(
            second,
            ViewRecorded {
                total_views: 2,
                unique_views: 1,
                is_new_view: false
            }
        );
        let stats = s.get_stats(&post1()).await.unwrap();
        assert_eq!((stats.total_views, stats.unique_views), (2, 1));
        assert_eq!(stats.last_viewed_at, Some(t0() + Duration::seconds(5)));
        assert_eq!(s.db.test_views().len(), 1);
    }

    #[tokio::test]
    async fn dedup_is_per_subject_and_window() {
        let mut s = server();
        let other = SubjectId::new("post-2");
        assert!(s.record_view(&post1(), NewView::default(), Some(X), t0()).await.is_new_view);
        assert!(s.record_view(&other, NewView::default(), Some(X), t0()).await.is_new_view);
        assert!(s.record_view(&post1(), NewView::default(), Some(Y), t0()).await.is_new_view);

        let later = t0() + Duration::minutes(31);
        let again = s.record_view(&post1(), NewView::default(), Some(X), later).await;
        assert!(again.is_new_view);
        assert_eq!((again.total_views, again.unique_views), (3, 3));
    }

    #[tokio::test]
    async fn stats_default_to_zero() {
        let mut s = server();
        assert_eq!(s.get_stats(&post1()).await, Ok(Stats::zeroed(post1())));
        assert!(s.get_stats(&SubjectId::new("")).await.is_err());
    }

    #[tokio::test]
    async fn view_recording_is_best_effort() {
        let mut s = server();
        s.db.fail_view_appends = true;
        let res = s.record_view(&post1(), NewView::default(), Some(X), t0()).await;
        assert!(res.is_new_view);
        assert_eq!((res.total_views, res.unique_views), (1, 1));
        assert!(s.db.test_views().is_empty());

        s.db.fail_view_appends = false;
        s.db.fail_stats = true;
        let res = s.record_view(&post1(), NewView::default(), Some(Y), t0()).await;
        assert_eq!((res.total_views, res.unique_views), (0, 0));
        assert_eq!(s.db.test_views().len(), 1);

        s.db.fail_stats = false;
        s.db.fail_counts = true;
        let res = s.record_view(&post1(), NewView::default(), Some("192.0.2.1"), t0()).await;
        assert!(!res.is_new_view);
        assert_eq!((res.total_views, res.unique_views), (2, 1));
    }

    #[tokio::test]
    async fn views_keep_referrer_but_not_address() {
        let mut s = server();
        let view = NewView {
            referrer: Some(String::from("  https://news.example/item  ")),
        };
        s.record_view(&post1(), view, Some(X), t0()).await;
        let stored = &s.db.test_views()[0];
        assert_eq!(stored.referrer.as_deref(), Some("https://news.example/item"));
        assert!(!stored.fingerprint.as_str().contains(X));
    }

    #[derive(Clone, Debug, bolero::generator::TypeGenerator)]
    struct GenView {
        subject: bool,
        address: u8,
        after_secs: u16,
    }

    #[test]
    fn unique_never_exceeds_total() {
        let runtime = std::panic::AssertUnwindSafe(
            tokio::runtime::Builder::new_current_thread()
                .build()
                .expect("failed initializing tokio runtime"),
        );
        bolero::check!()
            .with_type::<Vec<GenView>>()
            .for_each(move |views| {
                runtime.block_on(async {
                    let mut s = server();
                    let mut now = t0();
                    for v in views {
                        now = now + Duration::seconds(i64::from(v.after_secs));
                        let subject = match v.subject {
                            true => post1(),
                            false => SubjectId::new("post-2"),
                        };
                        let address = format!("192.0.2.{}", v.address % 4);
                        let res = s
                            .record_view(&subject, NewView::default(), Some(&address), now)
                            .await;
                        assert!(res.unique_views <= res.total_views);
                        assert!(res.unique_views >= 1);
                    }
                })
            });
    }
}
