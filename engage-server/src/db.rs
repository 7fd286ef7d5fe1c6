use anyhow::Context;
use async_trait::async_trait;
use engage_api::{
    ActionClass, Actor, ActorId, Comment, CommentId, CommentRecord, Db, Fingerprint, Stats,
    SubjectId, Time, Uuid, ViewEvent,
};
use sqlx::{postgres::PgRow, Connection, Row};

/// Serializes comment inserts, so that creation times stay strictly increasing
const COMMENT_CLOCK_LOCK: i64 = 0x656e_6761_6765;

pub struct PostgresDb<'a> {
    conn: &'a mut sqlx::PgConnection,
}

impl<'a> PostgresDb<'a> {
    pub fn new(conn: &'a mut sqlx::PgConnection) -> PostgresDb<'a> {
        PostgresDb { conn }
    }
}

fn comment_from_row(row: &PgRow) -> anyhow::Result<Comment> {
    Ok(Comment {
        id: CommentId(row.try_get("id").context("retrieving the id field")?),
        subject_id: SubjectId(
            row.try_get("subject_id")
                .context("retrieving the subject_id field")?,
        ),
        author_name: row
            .try_get("author_name")
            .context("retrieving the author_name field")?,
        author_email: row
            .try_get("author_email")
            .context("retrieving the author_email field")?,
        body: row.try_get("body").context("retrieving the body field")?,
        parent_id: row
            .try_get::<Option<Uuid>, _>("parent_id")
            .context("retrieving the parent_id field")?
            .map(CommentId),
        actor_id: row
            .try_get::<Option<Uuid>, _>("actor_id")
            .context("retrieving the actor_id field")?
            .map(ActorId),
        fingerprint: Fingerprint(
            row.try_get("fingerprint")
                .context("retrieving the fingerprint field")?,
        ),
        created_at: row
            .try_get("created_at")
            .context("retrieving the created_at field")?,
        published: row
            .try_get("published")
            .context("retrieving the published field")?,
    })
}

fn stats_from_row(subject: &SubjectId, row: &PgRow) -> anyhow::Result<Stats> {
    let count = |field: &str| -> anyhow::Result<u64> {
        let n = row
            .try_get::<i64, _>(field)
            .with_context(|| format!("retrieving the {field} field"))?;
        u64::try_from(n).with_context(|| format!("{field} of {subject} is negative"))
    };
    Ok(Stats {
        subject_id: subject.clone(),
        total_views: count("total_views")?,
        unique_views: count("unique_views")?,
        last_viewed_at: row
            .try_get("last_viewed_at")
            .context("retrieving the last_viewed_at field")?,
    })
}

#[async_trait]
impl<'a> Db for PostgresDb<'a> {
    async fn fetch_comment(&mut self, id: CommentId) -> anyhow::Result<Option<Comment>> {
        sqlx::query("SELECT * FROM comments WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&mut *self.conn)
            .await
            .with_context(|| format!("querying comment {id:?}"))?
            .map(|row| comment_from_row(&row))
            .transpose()
    }

    async fn insert_comment(&mut self, c: CommentRecord) -> anyhow::Result<Comment> {
        let mut transaction = self
            .conn
            .begin()
            .await
            .context("opening comment insert transaction")?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(COMMENT_CLOCK_LOCK)
            .execute(&mut transaction)
            .await
            .context("taking the comment clock lock")?;
        let row = sqlx::query(
            "
                INSERT INTO comments
                    (id, subject_id, author_name, author_email, body,
                     parent_id, actor_id, fingerprint, published, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, GREATEST(
                    $10,
                    (SELECT MAX(created_at) + INTERVAL '1 microsecond' FROM comments)
                ))
                RETURNING *
            ",
        )
        .bind(c.id.0)
        .bind(&c.subject_id.0)
        .bind(&c.author_name)
        .bind(&c.author_email)
        .bind(&c.body)
        .bind(c.parent_id.map(|p| p.0))
        .bind(c.actor_id.map(|a| a.0))
        .bind(&c.fingerprint.0)
        .bind(c.published)
        .bind(c.submitted_at)
        .fetch_one(&mut transaction)
        .await
        .with_context(|| format!("inserting comment {:?}", c.id))?;
        let comment = comment_from_row(&row)?;
        transaction
            .commit()
            .await
            .with_context(|| format!("committing comment {:?}", c.id))?;
        Ok(comment)
    }

    async fn fetch_published_comments(
        &mut self,
        subject: &SubjectId,
    ) -> anyhow::Result<Vec<Comment>> {
        sqlx::query("SELECT * FROM comments WHERE subject_id = $1 AND published")
            .bind(&subject.0)
            .fetch_all(&mut *self.conn)
            .await
            .with_context(|| format!("querying published comments of {subject}"))?
            .iter()
            .map(comment_from_row)
            .collect()
    }

    async fn count_actions_since(
        &mut self,
        fingerprint: &Fingerprint,
        class: &ActionClass,
        since: Time,
    ) -> anyhow::Result<u64> {
        let query = match class {
            ActionClass::Comment => sqlx::query(
                "SELECT COUNT(*) FROM comments WHERE fingerprint = $1 AND created_at >= $2",
            )
            .bind(&fingerprint.0)
            .bind(since),
            ActionClass::View(subject) => sqlx::query(
                "
                    SELECT COUNT(*) FROM view_events
                    WHERE fingerprint = $1 AND viewed_at >= $2 AND subject_id = $3
                ",
            )
            .bind(&fingerprint.0)
            .bind(since)
            .bind(&subject.0),
        };
        let count = query
            .fetch_one(&mut *self.conn)
            .await
            .with_context(|| format!("counting {class:?} actions"))?
            .try_get::<i64, _>(0)
            .context("retrieving the count")?;
        u64::try_from(count).context("postgres returned a negative count")
    }

    async fn append_view(&mut self, v: ViewEvent) -> anyhow::Result<()> {
        sqlx::query(
            "
                INSERT INTO view_events (subject_id, fingerprint, viewed_at, referrer)
                VALUES ($1, $2, $3, $4)
            ",
        )
        .bind(&v.subject_id.0)
        .bind(&v.fingerprint.0)
        .bind(v.viewed_at)
        .bind(&v.referrer)
        .execute(&mut *self.conn)
        .await
        .with_context(|| format!("appending view event for {}", v.subject_id))?;
        Ok(())
    }

    async fn bump_stats(
        &mut self,
        subject: &SubjectId,
        is_new_view: bool,
        now: Time,
    ) -> anyhow::Result<Stats> {
        let row = sqlx::query(
            "
                INSERT INTO engagement_stats
                    (subject_id, total_views, unique_views, last_viewed_at)
                VALUES ($1, 1, $2, $3)
                ON CONFLICT (subject_id) DO UPDATE SET
                    total_views = engagement_stats.total_views + 1,
                    unique_views = engagement_stats.unique_views + EXCLUDED.unique_views,
                    last_viewed_at = GREATEST(
                        engagement_stats.last_viewed_at,
                        EXCLUDED.last_viewed_at
                    )
                RETURNING total_views, unique_views, last_viewed_at
            ",
        )
        .bind(&subject.0)
        .bind(i64::from(is_new_view))
        .bind(now)
        .fetch_one(&mut *self.conn)
        .await
        .with_context(|| format!("upserting engagement stats of {subject}"))?;
        stats_from_row(subject, &row)
    }

    async fn fetch_stats(&mut self, subject: &SubjectId) -> anyhow::Result<Option<Stats>> {
        sqlx::query(
            "
                SELECT total_views, unique_views, last_viewed_at
                FROM engagement_stats
                WHERE subject_id = $1
            ",
        )
        .bind(&subject.0)
        .fetch_optional(&mut *self.conn)
        .await
        .with_context(|| format!("querying engagement stats of {subject}"))?
        .map(|row| stats_from_row(subject, &row))
        .transpose()
    }
}

/// Resolves a bearer token into the actor it was issued to, if it is still valid
pub async fn recover_actor(
    conn: &mut sqlx::PgConnection,
    token: Uuid,
) -> anyhow::Result<Option<Actor>> {
    sqlx::query(
        "
            SELECT a.id, a.name, a.email
            FROM sessions s
            INNER JOIN actors a
                ON a.id = s.actor_id
            WHERE s.id = $1
            AND (s.expires_at IS NULL OR s.expires_at > NOW())
        ",
    )
    .bind(token)
    .fetch_optional(conn)
    .await
    .context("querying sessions table")?
    .map(|row| -> anyhow::Result<Actor> {
        Ok(Actor {
            id: ActorId(row.try_get("id").context("retrieving the id field")?),
            name: row.try_get("name").context("retrieving the name field")?,
            email: row.try_get("email").context("retrieving the email field")?,
        })
    })
    .transpose()
}

#[cfg(test)]
pub async fn create_session(
    conn: &mut sqlx::PgConnection,
    token: Uuid,
    actor: &Actor,
) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO actors (id, name, email) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING")
        .bind(actor.id.0)
        .bind(&actor.name)
        .bind(&actor.email)
        .execute(&mut *conn)
        .await
        .context("inserting actor")?;
    sqlx::query("INSERT INTO sessions (id, actor_id) VALUES ($1, $2)")
        .bind(token)
        .bind(actor.id.0)
        .execute(&mut *conn)
        .await
        .context("inserting session")?;
    Ok(())
}
