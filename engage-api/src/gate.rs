use crate::{
    validate_email, validate_length, validate_string, ActionClass, Actor, CommentId,
    CommentRecord, Db, Error, Field, Fingerprint, ModerationMode, NewComment, Policy, SubjectId,
    Time,
};

pub const AUTHOR_NAME_LEN: std::ops::RangeInclusive<usize> = 2..=50;
pub const BODY_LEN: std::ops::RangeInclusive<usize> = 10..=2000;

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Published,
    Held,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Submitted {
    pub outcome: Outcome,
    pub comment_id: CommentId,
}

/// Everything the gate gets to know about one comment submission
#[derive(Clone, Debug)]
pub struct Submission {
    pub subject: SubjectId,
    pub comment: NewComment,
    /// `None` for anonymous visitors
    pub actor: Option<Actor>,
    /// As seen by the server; never stored
    pub raw_address: Option<String>,
}

struct Author {
    name: String,
    email: String,
}

fn validate(s: &Submission) -> Result<Author, Error> {
    s.subject.validate()?;
    let c = &s.comment;

    let name = match &s.actor {
        Some(actor) => actor.name.clone(),
        None => c.author_name.clone().unwrap_or_default(),
    };
    validate_string(&name)?;
    validate_length(Field::AuthorName, &name, AUTHOR_NAME_LEN)?;

    validate_string(&c.body)?;
    validate_length(Field::Body, &c.body, BODY_LEN)?;

    let email = match &s.actor {
        Some(actor) => actor.email.clone(),
        None => {
            let email = c.author_email.as_deref().ok_or_else(|| {
                Error::invalid(Field::AuthorEmail, "is required when not signed in")
            })?;
            validate_email(email)?;
            String::from(email)
        }
    };
    Ok(Author { name, email })
}

/// Runs a comment submission through the moderation gate
///
/// Resolves to `Published` (or `Held` under manual moderation) with exactly one
/// comment stored, or to a rejection with nothing stored. The outer error is a
/// storage failure, which callers must surface rather than swallow.
///
/// Not idempotent: a retried submission stores a second comment.
pub async fn submit_comment<D: Db>(
    db: &mut D,
    policy: &Policy,
    submission: Submission,
    now: Time,
) -> anyhow::Result<Result<Submitted, Error>> {
    let submission = Submission {
        comment: submission.comment.normalized(),
        ..submission
    };
    let author = match validate(&submission) {
        Ok(author) => author,
        Err(err) => {
            tracing::debug!(subject = %submission.subject, %err, "comment failed validation");
            return Ok(Err(err));
        }
    };

    let fingerprint = Fingerprint::of(
        submission.raw_address.as_deref(),
        &policy.fingerprint_salt.0,
    );

    let authenticated = submission.actor.is_some();
    let limit = policy.comment_limit(authenticated);
    if let Err(err) = limit
        .check(db, &fingerprint, &ActionClass::Comment, now)
        .await?
    {
        tracing::info!(%fingerprint, authenticated, "comment submission rate limited");
        return Ok(Err(err));
    }

    let published = match policy.moderation {
        ModerationMode::Open => true,
        ModerationMode::Manual => false,
    };
    let record = CommentRecord {
        id: CommentId::new(),
        subject_id: submission.subject,
        author_name: author.name,
        author_email: author.email,
        body: submission.comment.body,
        parent_id: submission.comment.parent_id,
        actor_id: submission.actor.map(|a| a.id),
        fingerprint,
        published,
        submitted_at: now,
    };
    let comment = match crate::create_comment(db, record, policy.max_reply_depth).await? {
        Ok(comment) => comment,
        Err(err) => {
            if err.is_invariant_violation() {
                tracing::warn!(%err, "comment submission violates a store invariant");
            }
            return Ok(Err(err));
        }
    };

    let outcome = match comment.published {
        true => Outcome::Published,
        false => Outcome::Held,
    };
    tracing::info!(
        comment = ?comment.id,
        subject = %comment.subject_id,
        ?outcome,
        "comment accepted"
    );
    Ok(Ok(Submitted {
        outcome,
        comment_id: comment.id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ActorId;

    fn anonymous(body: &str) -> Submission {
        Submission {
            subject: SubjectId::new("post-1"),
            comment: NewComment {
                parent_id: None,
                body: String::from(body),
                author_name: Some(String::from("Ada")),
                author_email: Some(String::from("ada@example.com")),
            },
            actor: None,
            raw_address: Some(String::from("203.0.113.9")),
        }
    }

    #[test]
    fn body_bounds() {
        assert_eq!(
            validate(&anonymous("123456789")).err(),
            Some(Error::invalid(
                Field::Body,
                "must be between 10 and 2000 characters long"
            ))
        );
        assert!(validate(&anonymous("1234567890")).is_ok());
        assert!(validate(&anonymous(&"x".repeat(2000))).is_ok());
        assert!(validate(&anonymous(&"x".repeat(2001))).is_err());
    }

    #[test]
    fn missing_body_is_a_validation_error() {
        let mut s = anonymous("placeholder body");
        s.comment = serde_json::from_str(
            r#"{"author_name": "Ada", "author_email": "ada@example.com"}"#,
        )
        .unwrap();
        assert_eq!(s.comment.body, "");
        assert!(matches!(
            validate(&s),
            Err(Error::Validation {
                field: Field::Body,
                ..
            })
        ));
    }

    #[test]
    fn name_bounds() {
        let mut s = anonymous("a perfectly fine comment");
        s.comment.author_name = Some(String::from("A"));
        assert!(matches!(
            validate(&s),
            Err(Error::Validation {
                field: Field::AuthorName,
                ..
            })
        ));
        s.comment.author_name = None;
        assert!(validate(&s).is_err());
        s.comment.author_name = Some("n".repeat(51));
        assert!(validate(&s).is_err());
        s.comment.author_name = Some("n".repeat(50));
        assert!(validate(&s).is_ok());
    }

    #[test]
    fn anonymous_needs_email() {
        let mut s = anonymous("a perfectly fine comment");
        s.comment.author_email = None;
        assert!(matches!(
            validate(&s),
            Err(Error::Validation {
                field: Field::AuthorEmail,
                ..
            })
        ));
        s.comment.author_email = Some(String::from("not-an-email"));
        assert!(validate(&s).is_err());
    }

    #[test]
    fn authenticated_author_comes_from_identity() {
        let mut s = anonymous("a perfectly fine comment");
        s.comment.author_name = Some(String::from("Impostor"));
        s.comment.author_email = None;
        s.actor = Some(Actor {
            id: ActorId::stub(),
            name: String::from("Grace"),
            email: String::from("grace@example.com"),
        });
        let author = validate(&s).unwrap();
        assert_eq!(author.name, "Grace");
        assert_eq!(author.email, "grace@example.com");
    }

    #[test]
    fn nul_bytes_are_refused() {
        let s = anonymous("a comment with a \0 in it");
        assert!(matches!(validate(&s), Err(Error::NullByteInString(_))));
    }
}
