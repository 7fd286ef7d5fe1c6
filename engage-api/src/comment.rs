use anyhow::Context;
use uuid::Uuid;

use crate::{ActorId, Db, Error, Field, Fingerprint, SubjectId, Time};

#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    bolero::generator::TypeGenerator,
    serde::Deserialize,
    serde::Serialize,
)]
pub struct CommentId(#[generator(bolero::generator::gen_arbitrary())] pub Uuid);

impl CommentId {
    pub fn new() -> CommentId {
        CommentId(Uuid::new_v4())
    }
}

impl Default for CommentId {
    fn default() -> CommentId {
        CommentId::new()
    }
}

/// A stored comment, as the database holds it
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Comment {
    pub id: CommentId,
    pub subject_id: SubjectId,
    pub author_name: String,
    /// Never shown to readers
    pub author_email: String,
    pub body: String,
    pub parent_id: Option<CommentId>,
    pub actor_id: Option<ActorId>,
    pub fingerprint: Fingerprint,
    pub created_at: Time,
    pub published: bool,
}

/// A comment as submitted by a visitor
///
/// Author fields are ignored for authenticated actors, whose identity provides
/// them instead.
#[derive(
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    bolero::generator::TypeGenerator,
    serde::Deserialize,
    serde::Serialize,
)]
pub struct NewComment {
    pub parent_id: Option<CommentId>,
    /// Missing is the same as empty, and fails validation like it
    #[generator(bolero::generator::gen_with::<String>().len(0..64usize))]
    #[serde(default)]
    pub body: String,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
}

impl NewComment {
    /// Trims surrounding whitespace and turns blank optional fields into `None`
    pub fn normalized(self) -> NewComment {
        fn opt(s: Option<String>) -> Option<String> {
            s.map(|s| String::from(s.trim())).filter(|s| !s.is_empty())
        }
        NewComment {
            parent_id: self.parent_id,
            body: String::from(self.body.trim()),
            author_name: opt(self.author_name),
            author_email: opt(self.author_email),
        }
    }
}

/// Everything about a comment but its creation time, which the store assigns
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommentRecord {
    pub id: CommentId,
    pub subject_id: SubjectId,
    pub author_name: String,
    pub author_email: String,
    pub body: String,
    pub parent_id: Option<CommentId>,
    pub actor_id: Option<ActorId>,
    pub fingerprint: Fingerprint,
    pub published: bool,
    /// Lower bound for `created_at`; stores bump it to stay strictly monotonic
    pub submitted_at: Time,
}

/// Persists a comment after checking its parent reference
///
/// A dangling or cross-subject parent is refused outright, never coerced into a
/// root comment. `max_reply_depth` caps how deep a new reply may be nested,
/// roots being at depth 0.
pub async fn create_comment<D: Db>(
    db: &mut D,
    record: CommentRecord,
    max_reply_depth: Option<usize>,
) -> anyhow::Result<Result<Comment, Error>> {
    if let Some(parent_id) = record.parent_id {
        let parent = match db
            .fetch_comment(parent_id)
            .await
            .with_context(|| format!("fetching parent comment {:?}", parent_id))?
        {
            Some(parent) => parent,
            None => return Ok(Err(Error::ParentNotFound(parent_id))),
        };
        if parent.subject_id != record.subject_id {
            return Ok(Err(Error::ParentInOtherSubject(parent_id)));
        }
        if let Some(max) = max_reply_depth {
            if depth_of(db, &parent, max).await? + 1 > max {
                return Ok(Err(Error::invalid(
                    Field::ParentId,
                    "this discussion is nested too deeply to accept more replies",
                )));
            }
        }
    }
    let id = record.id;
    let comment = db
        .insert_comment(record)
        .await
        .with_context(|| format!("inserting comment {:?}", id))?;
    Ok(Ok(comment))
}

/// Walks up at most `limit` ancestors, so the answer saturates at `limit`
async fn depth_of<D: Db>(db: &mut D, comment: &Comment, limit: usize) -> anyhow::Result<usize> {
    let mut depth = 0;
    let mut parent_id = comment.parent_id;
    while let Some(id) = parent_id {
        depth += 1;
        if depth >= limit {
            break;
        }
        parent_id = match db
            .fetch_comment(id)
            .await
            .with_context(|| format!("fetching ancestor comment {:?}", id))?
        {
            Some(c) => c.parent_id,
            // the ancestor was removed out-of-band, count from there
            None => None,
        };
    }
    Ok(depth)
}
