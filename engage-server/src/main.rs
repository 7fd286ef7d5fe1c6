use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{routing::get, Router};
use chrono::Duration;
use engage_api::{ModerationMode, Policy, RateLimit, Salt};
use structopt::StructOpt;

mod db;
mod error;
mod extractors;
mod fuzz;
mod handlers;

use error::Error;
use extractors::{AppState, PgPool, ProxyTrust};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// Longest accepted rate limit or deduplication window, a year
const MAX_WINDOW_MINUTES: i64 = 366 * 24 * 60;

#[derive(Debug, StructOpt)]
#[structopt(about = "Comment and page view engagement server")]
struct Opt {
    #[structopt(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: String,

    #[structopt(long, env = "LISTEN_ADDR", default_value = "127.0.0.1:3000")]
    listen: SocketAddr,

    /// Secret mixed into visitor fingerprints; changing it resets all rate limits
    /// and view deduplication
    #[structopt(long, env = "FINGERPRINT_SALT", hide_env_values = true)]
    fingerprint_salt: String,

    #[structopt(long, default_value = "3")]
    anonymous_comment_limit: u64,

    #[structopt(long, default_value = "10")]
    authenticated_comment_limit: u64,

    #[structopt(long, default_value = "5")]
    comment_window_minutes: i64,

    #[structopt(long, default_value = "30")]
    view_window_minutes: i64,

    /// 0 disables the cap
    #[structopt(long, default_value = "5")]
    max_reply_depth: usize,

    /// open or manual
    #[structopt(long, default_value = "open")]
    moderation: ModerationMode,

    /// Take the client address from the X-Forwarded-For entry appended by the
    /// reverse proxy in front of this server
    #[structopt(long)]
    trust_forwarded_for: bool,
}

impl Opt {
    fn policy(&self) -> anyhow::Result<Policy> {
        if self.fingerprint_salt.trim().is_empty() {
            anyhow::bail!("the fingerprint salt must not be empty");
        }
        for (name, minutes) in [
            ("comment window", self.comment_window_minutes),
            ("view deduplication window", self.view_window_minutes),
        ] {
            if !(1..=MAX_WINDOW_MINUTES).contains(&minutes) {
                anyhow::bail!("the {name} must be between 1 and {MAX_WINDOW_MINUTES} minutes");
            }
        }
        let comment_window = Duration::minutes(self.comment_window_minutes);
        Ok(Policy {
            fingerprint_salt: Salt(self.fingerprint_salt.clone()),
            anonymous_comments: RateLimit::new(self.anonymous_comment_limit, comment_window),
            authenticated_comments: RateLimit::new(
                self.authenticated_comment_limit,
                comment_window,
            ),
            view_dedup_window: Duration::minutes(self.view_window_minutes),
            max_reply_depth: match self.max_reply_depth {
                0 => None,
                depth => Some(depth),
            },
            moderation: self.moderation,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let opt = Opt::from_args();
    let policy = opt.policy()?;
    tracing::info!(?policy, "starting engagement server");

    let db = create_sqlx_pool(&opt.database_url).await?;
    MIGRATOR
        .run(&db)
        .await
        .context("running pending migrations")?;

    let app = app(db, policy, opt.trust_forwarded_for).await;

    tracing::info!("listening on {}", opt.listen);
    axum::Server::bind(&opt.listen)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("serving axum webserver")
}

pub async fn create_sqlx_pool(db_url: &str) -> anyhow::Result<sqlx::PgPool> {
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect(db_url)
        .await
        .with_context(|| format!("Error opening database {:?}", db_url))
}

pub async fn app(db: sqlx::PgPool, policy: Policy, trust_forwarded_for: bool) -> Router {
    let state = AppState {
        db: PgPool::new(db),
        policy: Arc::new(policy),
        proxy: ProxyTrust(trust_forwarded_for),
    };
    Router::new()
        .route(
            "/api/subjects/:subject/comments",
            get(handlers::list_thread).post(handlers::submit_comment),
        )
        .route(
            "/api/subjects/:subject/views",
            axum::routing::post(handlers::record_view),
        )
        .route("/api/subjects/:subject/stats", get(handlers::get_stats))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opt(args: &[&str]) -> Opt {
        let base = [
            "engage-server",
            "--database-url",
            "postgresql://localhost/engage",
            "--fingerprint-salt",
            "pepper",
        ];
        Opt::from_iter(base.iter().chain(args))
    }

    #[test]
    fn windows_are_bounded() {
        assert!(opt(&[]).policy().is_ok());
        assert!(opt(&["--comment-window-minutes", "0"]).policy().is_err());
        assert!(opt(&["--comment-window-minutes", "9223372036854775807"])
            .policy()
            .is_err());
        assert!(opt(&["--view-window-minutes", "527041"]).policy().is_err());
        let year = opt(&["--view-window-minutes", "527040"]).policy().unwrap();
        assert_eq!(year.view_dedup_window, Duration::days(366));
    }

    #[test]
    fn zero_depth_disables_the_cap() {
        let policy = opt(&["--max-reply-depth", "0"]).policy().unwrap();
        assert_eq!(policy.max_reply_depth, None);
        assert_eq!(opt(&[]).policy().unwrap().max_reply_depth, Some(5));
    }
}
