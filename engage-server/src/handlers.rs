use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use engage_api::{
    NewComment, NewView, Policy, Stats, SubjectId, Submission, Submitted, ThreadNode,
    ViewRecorded,
};

use crate::{db::PostgresDb, extractors::*, Error};

pub async fn submit_comment(
    State(policy): State<Arc<Policy>>,
    MaybeActor(actor): MaybeActor,
    addr: ClientAddr,
    Path(subject): Path<String>,
    mut conn: PgConn,
    Json(comment): Json<NewComment>,
) -> Result<Json<Submitted>, Error> {
    let submission = Submission {
        subject: SubjectId(subject),
        comment,
        actor,
        raw_address: addr.0,
    };
    let mut db = PostgresDb::new(&mut *conn);
    Ok(Json(
        engage_api::submit_comment(&mut db, &policy, submission, Utc::now()).await??,
    ))
}

pub async fn list_thread(
    State(policy): State<Arc<Policy>>,
    Path(subject): Path<String>,
    mut conn: PgConn,
) -> Result<Json<Vec<ThreadNode>>, Error> {
    let mut db = PostgresDb::new(&mut *conn);
    Ok(Json(
        engage_api::list_thread(&mut db, &policy, &SubjectId(subject)).await??,
    ))
}

/// Always answers 200, whatever happened to the view
pub async fn record_view(
    State(policy): State<Arc<Policy>>,
    State(pool): State<PgPool>,
    addr: ClientAddr,
    Path(subject): Path<String>,
    body: Bytes,
) -> Json<ViewRecorded> {
    let view = match body.is_empty() {
        true => NewView::default(),
        false => serde_json::from_slice(&body).unwrap_or_else(|err| {
            tracing::debug!(%err, "ignoring unparseable view body");
            NewView::default()
        }),
    };
    let mut conn = match pool.acquire().await {
        Ok(conn) => conn,
        Err(err) => {
            tracing::warn!(?err, "dropping view, no database connection");
            return Json(ViewRecorded {
                total_views: 0,
                unique_views: 0,
                is_new_view: false,
            });
        }
    };
    let mut db = PostgresDb::new(&mut *conn);
    Json(
        engage_api::record_view(
            &mut db,
            &policy,
            &SubjectId(subject),
            view,
            addr.as_deref(),
            Utc::now(),
        )
        .await,
    )
}

pub async fn get_stats(
    Path(subject): Path<String>,
    mut conn: PgConn,
) -> Result<Json<Stats>, Error> {
    let mut db = PostgresDb::new(&mut *conn);
    Ok(Json(
        engage_api::get_stats(&mut db, &SubjectId(subject)).await??,
    ))
}
