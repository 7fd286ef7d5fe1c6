#![cfg(test)]

use axum::{
    extract::FromRequestParts,
    http::{self, request},
};
use chrono::Utc;
use engage_api::{
    Actor, ActorId, CommentId, Error as ApiError, Fingerprint, NewComment, NewView, Outcome,
    Policy, Stats, SubjectId, Submitted, ThreadNode, Uuid, ViewRecorded, STUB_UUID,
};
use engage_mock_server::MockServer;
use std::{
    cmp, collections::HashMap, fmt::Debug, ops::RangeTo, panic::AssertUnwindSafe, path::Path,
    sync::Arc,
};
use tower::{Service, ServiceExt};

use crate::{extractors::*, *};

const SALT: &str = "fuzz-salt";
const SUBJECTS: [&str; 2] = ["post-1", "post-2"];

macro_rules! do_tokio_test {
    ( $name:ident, $typ:ty, $fn:expr ) => {
        #[test]
        fn $name() {
            let runtime = AssertUnwindSafe(
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed initializing tokio runtime"),
            );
            bolero::check!()
                .with_type::<$typ>()
                .cloned()
                .for_each(move |v| {
                    let () = runtime.block_on($fn(v));
                })
        }
    };
}

/// Picks the newest postgres available, if any
fn build_pg_cluster(data: &Path) -> Option<postgresfixture::cluster::Cluster> {
    let mut runtime = None;
    let mut best_version = None;
    for r in postgresfixture::runtime::Runtime::find_on_path() {
        if let Ok(v) = r.version() {
            match (&mut runtime, &mut best_version) {
                (None, None) => {
                    runtime = Some(r);
                    best_version = Some(v);
                }
                (Some(runtime), Some(best_version)) => {
                    if *best_version < v {
                        *runtime = r;
                        *best_version = v;
                    }
                }
                _ => unreachable!(),
            }
        }
    }
    Some(postgresfixture::cluster::Cluster::new(data, runtime?))
}

macro_rules! do_sqlx_test {
    ( $name:ident, $gen:expr, $fn:expr ) => {
        #[test]
        fn $name() {
            if std::env::var("RUST_LOG").is_ok() {
                tracing_subscriber::fmt::init();
            }
            let lockfile = tempfile::tempfile().expect("creating tempfile");
            let datadir = tempfile::tempdir().expect("creating tempdir");
            let datadir_path: &Path = datadir.as_ref();
            let cluster = match build_pg_cluster(datadir_path) {
                Some(cluster) => cluster,
                None => {
                    eprintln!("postgresql is not installed in path, skipping {}", stringify!($name));
                    return;
                }
            };
            let datadir_path: &str = datadir_path.to_str().expect("tempdir is not valid utf8");
            postgresfixture::coordinate::run_and_destroy(&cluster, lockfile.into(), || {
                cluster.createdb("test_db").expect("creating test_db database");
                let runtime = AssertUnwindSafe(
                    tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("failed initializing tokio runtime"),
                );
                // create test db
                let pool = AssertUnwindSafe(runtime.block_on(async move {
                    let pool = create_sqlx_pool(&format!("postgresql://?host={}&dbname=test_db", datadir_path)).await.expect("creating sqlx pool");
                    MIGRATOR
                        .run(&mut *pool.acquire().await.expect("getting migrator connection"))
                        .await
                        .expect("failed applying migrations");
                    pool
                }));
                bolero::check!()
                    .with_generator($gen)
                    .cloned()
                    .for_each(move |v| {
                        let pool = pool.clone();
                        // run the test
                        let idle_before = pool.num_idle();
                        let v_str = format!("{v:?}");
                        let idle_after_res: Result<usize, _> = {
                            let pool = pool.clone();
                            std::panic::catch_unwind(AssertUnwindSafe(|| {
                                runtime.block_on(async move {
                                    let () = $fn(pool.clone(), v).await;
                                    let mut idle_after = pool.num_idle();
                                    let wait_release_since = std::time::Instant::now();
                                    while idle_after < idle_before
                                        && wait_release_since.elapsed()
                                            <= std::time::Duration::from_secs(1)
                                    {
                                        tokio::task::yield_now().await;
                                        idle_after = pool.num_idle();
                                    }
                                    idle_after
                                })
                            }))
                        };
                        runtime.block_on(async move {
                            // cleanup
                            let mut conn =
                                pool.acquire().await.expect("getting db cleanup connection");
                            sqlx::query(include_str!("../reset-test-db.sql"))
                                .execute(&mut *conn)
                                .await
                                .expect("failed cleaning up database");
                        });
                        // resume the panics
                        match idle_after_res {
                            Err(e) => std::panic::resume_unwind(e),
                            Ok(idle_after) => assert!(
                                idle_after >= idle_before,
                                "test {} held onto pool after exiting test: before there were {idle_before} connections, and after there were {idle_after} with value {v_str}",
                                stringify!($name)
                            ),
                        }
                    });
            })
            .expect("coordinating spinup and shutdown of the pg cluster");
        }
    };
}

do_tokio_test!(fuzz_preauth_extractor, String, |token| async move {
    if let Ok(req) = http::Request::builder()
        .method(http::Method::GET)
        .uri("/")
        .header(http::header::AUTHORIZATION, token)
        .body(())
    {
        let mut req = req.into_parts().0;
        let res = PreAuth::from_request_parts(&mut req, &()).await;
        match res {
            Ok(_) => (),
            Err(Error::Api(ApiError::PermissionDenied)) => (),
            Err(e) => panic!("got unexpected error: {e}"),
        }
    }
});

do_tokio_test!(fuzz_client_addr_extractor, String, |header| async move {
    if let Ok(req) = http::Request::builder()
        .method(http::Method::POST)
        .uri("/")
        .header(FORWARDED_FOR, header)
        .body(())
    {
        let mut req = req.into_parts().0;
        let addr = ClientAddr::from_request_parts(&mut req, &ProxyTrust(true))
            .await
            .unwrap_or_else(|e| panic!("client address extraction failed: {e}"));
        if let Some(addr) = addr.0 {
            assert!(!addr.is_empty());
            assert!(!addr.contains(','));
        }
    }
});

#[tokio::test]
async fn forwarded_for_needs_trust() {
    let req = || {
        let mut req = http::Request::builder()
            .uri("/")
            .header(FORWARDED_FOR, "203.0.113.5, 10.0.0.1")
            .body(())
            .expect("building request")
            .into_parts()
            .0;
        req.extensions.insert(axum::extract::ConnectInfo(
            "192.0.2.44:51234".parse::<std::net::SocketAddr>().unwrap(),
        ));
        req
    };
    let trusted = ClientAddr::from_request_parts(&mut req(), &ProxyTrust(true))
        .await
        .unwrap();
    assert_eq!(trusted.as_deref(), Some("10.0.0.1"));
    let untrusted = ClientAddr::from_request_parts(&mut req(), &ProxyTrust(false))
        .await
        .unwrap();
    assert_eq!(untrusted.as_deref(), Some("192.0.2.44"));

    let mut bare = http::Request::builder()
        .uri("/")
        .body(())
        .unwrap()
        .into_parts()
        .0;
    let none = ClientAddr::from_request_parts(&mut bare, &ProxyTrust(true))
        .await
        .unwrap();
    assert_eq!(none.as_deref(), None);
}

#[tokio::test]
async fn forged_forwarded_hops_do_not_dodge_limits() {
    let mut mock = MockServer::new(Policy::with_salt(SALT));
    let now = Utc::now();
    let mut fingerprints = Vec::new();
    let mut outcomes = Vec::new();
    for i in 0..6 {
        let mut req = http::Request::builder()
            .uri("/")
            .header(FORWARDED_FOR, format!("6.6.6.{i}, 203.0.113.5"))
            .body(())
            .expect("building request")
            .into_parts()
            .0;
        let addr = ClientAddr::from_request_parts(&mut req, &ProxyTrust(true))
            .await
            .unwrap();
        assert_eq!(addr.as_deref(), Some("203.0.113.5"));
        fingerprints.push(Fingerprint::of(addr.as_deref(), SALT));
        let comment = NewComment {
            parent_id: None,
            body: String::from("hello there"),
            author_name: None,
            author_email: None,
        };
        let res = mock
            .submit_comment(SubjectId::new("post-1"), comment, None, addr.as_deref(), now)
            .await;
        outcomes.push(res.map(|s| s.outcome));
    }
    assert!(fingerprints.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(
        outcomes,
        vec![
            Ok(Outcome::Published),
            Ok(Outcome::Published),
            Ok(Outcome::Published),
            Err(ApiError::RateLimited),
            Err(ApiError::RateLimited),
            Err(ApiError::RateLimited),
        ]
    );
}

async fn call<Req, Resp>(
    app: &mut Router,
    req: request::Request<axum::body::Body>,
    req_body: &Req,
) -> Result<Resp, ApiError>
where
    Req: Debug,
    Resp: 'static + for<'de> serde::Deserialize<'de>,
{
    app.ready().await.expect("waiting for app to be ready");
    let resp = app.call(req).await.expect("running request");
    let status = resp.status();
    let body = hyper::body::to_bytes(resp.into_body())
        .await
        .expect("recovering resp bytes");
    if status == http::StatusCode::OK {
        return Ok(serde_json::from_slice(&body).unwrap_or_else(|err| {
            panic!(
                r#"
                    Failed parsing resp body!

                    The error is the following:
                    ---
                    {err}
                    ---

                    Response body is:
                    ---
                    {body:?}
                    ---

                    Request was:
                    ---
                    {req_body:?}
                    ---
                "#
            )
        }));
    }
    Err(ApiError::parse(&body)
        .unwrap_or_else(|err| panic!("parsing error response body {err}, body is {body:?}")))
}

async fn run_on_app<Req, Resp>(
    app: &mut Router,
    method: &str,
    uri: &str,
    token: Option<Uuid>,
    address: &str,
    body: &Req,
) -> Result<Resp, ApiError>
where
    Req: Debug + serde::Serialize,
    Resp: 'static + for<'de> serde::Deserialize<'de>,
{
    let req = request::Builder::new()
        .method(method)
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "application/json")
        .header(FORWARDED_FOR, address);
    let req = match token {
        Some(token) => req.header(http::header::AUTHORIZATION, format!("bearer {token}")),
        None => req,
    };
    let req = req
        .body(axum::body::Body::from(
            serde_json::to_vec(body).expect("serializing request body to json"),
        ))
        .expect("building request");
    call(app, req, body).await
}

#[tokio::test]
async fn views_never_fail_when_storage_is_down() {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .acquire_timeout(std::time::Duration::from_millis(200))
        .connect_lazy("postgresql://engage@127.0.0.1:1/unreachable")
        .expect("building lazy pool");
    let mut app = app(pool, Policy::with_salt(SALT), true).await;

    let recorded: Result<ViewRecorded, ApiError> = run_on_app(
        &mut app,
        "POST",
        "/api/subjects/post-1/views",
        None,
        "192.0.2.1",
        &NewView::default(),
    )
    .await;
    assert_eq!(
        recorded,
        Ok(ViewRecorded {
            total_views: 0,
            unique_views: 0,
            is_new_view: false
        })
    );

    let stats: Result<Stats, ApiError> = run_on_app(
        &mut app,
        "GET",
        "/api/subjects/post-1/stats",
        None,
        "192.0.2.1",
        &(),
    )
    .await;
    assert!(matches!(stats, Err(ApiError::Unknown(_))), "{stats:?}");
}

fn compare<T>(name: &str, app_res: Result<T, ApiError>, mock_res: Result<T, ApiError>)
where
    T: Debug + PartialEq,
{
    assert_eq!(
        app_res, mock_res,
        "app and mock did not return the same result for {name}"
    );
}

fn resize_int(fuzz_id: usize, RangeTo { end }: RangeTo<usize>) -> Option<usize> {
    if end == 0 {
        return None;
    }
    let bucket_size = cmp::max(1, usize::MAX / end); // in case we rounded to 0
    let id = fuzz_id / bucket_size;
    Some(cmp::min(id, end - 1)) // in case id was actually over end - 1 due to rounding
}

#[derive(Clone, Debug, bolero::generator::TypeGenerator)]
enum FuzzParent {
    Root,
    Existing(usize),
    Missing,
}

#[derive(Clone, Debug, bolero::generator::TypeGenerator)]
enum FuzzOp {
    AddSession {
        #[generator(bolero::generator::gen_with::<String>().len(1..60usize))]
        name: String,
    },
    SubmitComment {
        subject: bool,
        parent: FuzzParent,
        comment: NewComment,
        // most fuzzed emails are invalid, so also try with a known-good one
        valid_email: bool,
        session: Option<usize>,
        address: u8,
    },
    ListThread {
        subject: bool,
    },
    RecordView {
        subject: bool,
        address: u8,
        referrer: Option<String>,
    },
    GetStats {
        subject: bool,
    },
}

fn subject(first: bool) -> &'static str {
    SUBJECTS[usize::from(!first)]
}

fn address(a: u8) -> String {
    format!("192.0.2.{}", a % 4)
}

/// Rewrites app-side comment ids into their mock-side counterpart, and
/// forgets creation times since the two sides run on separate clocks
fn normalize(nodes: Vec<ThreadNode>, ids: &HashMap<CommentId, CommentId>) -> Vec<ThreadNode> {
    nodes
        .into_iter()
        .map(|n| ThreadNode {
            id: ids.get(&n.id).copied().unwrap_or(n.id),
            created_at: chrono::DateTime::<Utc>::MIN_UTC,
            replies: normalize(n.replies, ids),
            ..n
        })
        .collect()
}

fn normalize_err(err: ApiError, ids: &HashMap<CommentId, CommentId>) -> ApiError {
    let map = |id: CommentId| ids.get(&id).copied().unwrap_or(id);
    match err {
        ApiError::ParentNotFound(id) => ApiError::ParentNotFound(map(id)),
        ApiError::ParentInOtherSubject(id) => ApiError::ParentInOtherSubject(map(id)),
        err => err,
    }
}

struct ComparativeFuzzer {
    pool: sqlx::PgPool,
    app: Router,
    mock: MockServer,
    sessions: Vec<Uuid>,
    /// (app id, mock id) of every stored comment, in submission order
    comments: Vec<(CommentId, CommentId)>,
    app_to_mock: HashMap<CommentId, CommentId>,
}

impl ComparativeFuzzer {
    async fn new(pool: sqlx::PgPool) -> ComparativeFuzzer {
        let app = app(pool.clone(), Policy::with_salt(SALT), true).await;
        let mock = MockServer::new(Policy::with_salt(SALT));
        ComparativeFuzzer {
            pool,
            app,
            mock,
            sessions: Vec::new(),
            comments: Vec::new(),
            app_to_mock: HashMap::new(),
        }
    }

    async fn execute_fuzz_op(&mut self, op: FuzzOp) {
        match op {
            FuzzOp::AddSession { name } => {
                let token = Uuid::new_v4();
                let actor = Actor {
                    id: ActorId(Uuid::new_v4()),
                    name,
                    email: String::from("someone@example.com"),
                };
                let mut conn = self.pool.acquire().await.expect("getting db connection");
                match db::create_session(&mut *conn, token, &actor).await {
                    Ok(()) => {
                        self.mock.test_add_session(token, actor);
                        self.sessions.push(token);
                    }
                    // postgres refuses nul bytes, the auth system would never hand those out
                    Err(_) => assert!(actor.name.contains('\0')),
                }
            }
            FuzzOp::SubmitComment {
                subject: s,
                parent,
                mut comment,
                valid_email,
                session,
                address: a,
            } => {
                let (app_parent, mock_parent) = match parent {
                    FuzzParent::Root => (None, None),
                    FuzzParent::Existing(i) => match resize_int(i, ..self.comments.len()) {
                        Some(i) => (Some(self.comments[i].0), Some(self.comments[i].1)),
                        None => (None, None),
                    },
                    FuzzParent::Missing => {
                        let missing = CommentId(STUB_UUID);
                        (Some(missing), Some(missing))
                    }
                };
                if valid_email {
                    comment.author_email = Some(String::from("fuzz@example.com"));
                }
                let token = session
                    .and_then(|i| resize_int(i, ..self.sessions.len()))
                    .map(|i| self.sessions[i]);
                let addr = address(a);

                let app_res: Result<Submitted, ApiError> = run_on_app(
                    &mut self.app,
                    "POST",
                    &format!("/api/subjects/{}/comments", subject(s)),
                    token,
                    &addr,
                    &NewComment {
                        parent_id: app_parent,
                        ..comment.clone()
                    },
                )
                .await;
                let mock_res = self
                    .mock
                    .submit_comment(
                        SubjectId::new(subject(s)),
                        NewComment {
                            parent_id: mock_parent,
                            ..comment
                        },
                        token,
                        Some(&addr),
                        Utc::now(),
                    )
                    .await;
                if let (Ok(app), Ok(mock)) = (&app_res, &mock_res) {
                    self.comments.push((app.comment_id, mock.comment_id));
                    self.app_to_mock.insert(app.comment_id, mock.comment_id);
                }
                compare(
                    "SubmitComment",
                    app_res
                        .map(|r| r.outcome)
                        .map_err(|e| normalize_err(e, &self.app_to_mock)),
                    mock_res.map(|r| r.outcome),
                );
            }
            FuzzOp::ListThread { subject: s } => {
                let app_res: Result<Vec<ThreadNode>, ApiError> = run_on_app(
                    &mut self.app,
                    "GET",
                    &format!("/api/subjects/{}/comments", subject(s)),
                    None,
                    &address(0),
                    &(),
                )
                .await;
                let mock_res = self.mock.list_thread(&SubjectId::new(subject(s))).await;
                compare(
                    "ListThread",
                    app_res.map(|t| normalize(t, &self.app_to_mock)),
                    mock_res.map(|t| normalize(t, &HashMap::new())),
                );
            }
            FuzzOp::RecordView {
                subject: s,
                address: a,
                referrer,
            } => {
                let view = NewView { referrer };
                let addr = address(a);
                let app_res: Result<ViewRecorded, ApiError> = run_on_app(
                    &mut self.app,
                    "POST",
                    &format!("/api/subjects/{}/views", subject(s)),
                    None,
                    &addr,
                    &view,
                )
                .await;
                let mock_res = self
                    .mock
                    .record_view(&SubjectId::new(subject(s)), view, Some(&addr), Utc::now())
                    .await;
                compare("RecordView", app_res, Ok(mock_res));
            }
            FuzzOp::GetStats { subject: s } => {
                let app_res: Result<Stats, ApiError> = run_on_app(
                    &mut self.app,
                    "GET",
                    &format!("/api/subjects/{}/stats", subject(s)),
                    None,
                    &address(0),
                    &(),
                )
                .await;
                let mock_res = self.mock.get_stats(&SubjectId::new(subject(s))).await;
                let counters = |s: Stats| (s.total_views, s.unique_views, s.last_viewed_at.is_some());
                compare(
                    "GetStats",
                    app_res.map(counters),
                    mock_res.map(counters),
                );
            }
        }
    }
}

do_sqlx_test!(
    compare_with_mock,
    bolero::generator::gen_with::<Vec<FuzzOp>>().len(1..100usize),
    |pool, test: Vec<FuzzOp>| async move {
        let mut fuzzer = ComparativeFuzzer::new(pool).await;
        for op in test {
            fuzzer.execute_fuzz_op(op).await;
        }
    }
);

do_sqlx_test!(
    concurrent_views_lose_no_updates,
    bolero::generator::gen_with::<u8>(),
    |pool: sqlx::PgPool, n: u8| async move {
        let views = 2 + usize::from(n % 40);
        let policy = Arc::new(Policy::with_salt(SALT));
        let subject = SubjectId::new("post-1");
        let now = Utc::now();
        let tasks = (0..views)
            .map(|i| {
                let (pool, policy, subject) = (pool.clone(), policy.clone(), subject.clone());
                tokio::spawn(async move {
                    let mut conn = pool.acquire().await.expect("getting db connection");
                    let mut db = db::PostgresDb::new(&mut *conn);
                    let addr = format!("192.0.2.{}", i % 4);
                    engage_api::record_view(
                        &mut db,
                        &policy,
                        &subject,
                        NewView::default(),
                        Some(&addr),
                        now,
                    )
                    .await
                })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            task.await.expect("view task panicked");
        }

        let mut conn = pool.acquire().await.expect("getting db connection");
        let stats = engage_api::get_stats(&mut db::PostgresDb::new(&mut *conn), &subject)
            .await
            .expect("fetching stats")
            .expect("valid subject");
        assert_eq!(stats.total_views, views as u64);
        assert!(stats.unique_views <= stats.total_views, "{stats:?}");
        // racing views of one visitor may both count as new, at least one always does
        assert!(stats.unique_views >= cmp::min(views, 4) as u64, "{stats:?}");
    }
);
