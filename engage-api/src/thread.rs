use std::collections::HashMap;

use anyhow::Context;

use crate::{Comment, CommentId, Db, Error, Policy, SubjectId, Time};

/// One published comment with its visible replies, as readers get it
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ThreadNode {
    pub id: CommentId,
    pub author: String,
    pub body: String,
    pub created_at: Time,
    /// Roots are at depth 0
    pub depth: usize,
    /// Whether the reply affordance should be offered under this comment
    pub accepts_replies: bool,
    /// Oldest first
    pub replies: Vec<ThreadNode>,
}

impl ThreadNode {
    /// Number of nodes in this subtree, this one included
    pub fn subtree_len(&self) -> usize {
        1 + self
            .replies
            .iter()
            .map(ThreadNode::subtree_len)
            .sum::<usize>()
    }
}

/// Rebuilds the reply tree of a subject from its flat comment records
///
/// Roots come newest first, replies oldest first (conversation order), ties
/// being broken by id either way. Unpublished comments are never shown, and
/// neither is anything below them: a comment whose parent is missing or
/// unpublished is an orphan and gets dropped along with its own replies rather
/// than promoted to a root.
///
/// The input order does not matter. Parents are assumed to be strictly older
/// than their replies, which the stores guarantee; a record breaking that is
/// treated as an orphan.
pub fn build_thread(mut comments: Vec<Comment>, policy: &Policy) -> Vec<ThreadNode> {
    comments.retain(|c| c.published);
    comments.sort_unstable_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));

    let index = comments
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id, i))
        .collect::<HashMap<CommentId, usize>>();

    // Parents sort before their replies, so one forward pass settles both the
    // depth and whether a comment hangs off a visible root
    let mut parent_idx = Vec::with_capacity(comments.len());
    let mut depth = Vec::with_capacity(comments.len());
    let mut visible = Vec::with_capacity(comments.len());
    for (i, c) in comments.iter().enumerate() {
        match c.parent_id {
            None => {
                parent_idx.push(None);
                depth.push(0);
                visible.push(true);
            }
            Some(parent) => match index.get(&parent) {
                Some(&p) if p < i && visible[p] => {
                    parent_idx.push(Some(p));
                    depth.push(depth[p] + 1);
                    visible.push(true);
                }
                _ => {
                    tracing::debug!(comment = ?c.id, ?parent, "dropping orphaned comment");
                    parent_idx.push(None);
                    depth.push(0);
                    visible.push(false);
                }
            },
        }
    }

    // Backwards, so that every comment's replies are complete by the time the
    // comment itself is built; they come out newest first and get reversed
    let mut pending: Vec<Vec<ThreadNode>> = vec![Vec::new(); comments.len()];
    let mut roots = Vec::new();
    for (i, c) in comments.into_iter().enumerate().rev() {
        if !visible[i] {
            continue;
        }
        let mut replies = std::mem::take(&mut pending[i]);
        replies.reverse();
        let node = ThreadNode {
            id: c.id,
            author: c.author_name,
            body: c.body,
            created_at: c.created_at,
            depth: depth[i],
            accepts_replies: policy.accepts_replies_at(depth[i]),
            replies,
        };
        match parent_idx[i] {
            None => roots.push(node),
            Some(p) => pending[p].push(node),
        }
    }
    roots
}

/// Published discussion of a subject, ready for rendering
pub async fn list_thread<D: Db>(
    db: &mut D,
    policy: &Policy,
    subject: &SubjectId,
) -> anyhow::Result<Result<Vec<ThreadNode>, Error>> {
    if let Err(err) = subject.validate() {
        return Ok(Err(err));
    }
    let comments = db
        .fetch_published_comments(subject)
        .await
        .with_context(|| format!("fetching published comments of {subject}"))?;
    Ok(Ok(build_thread(comments, policy)))
}
