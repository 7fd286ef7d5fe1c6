use chrono::Utc;

pub use uuid::{uuid, Uuid};
pub type Time = chrono::DateTime<Utc>;

pub const STUB_UUID: Uuid = uuid!("ffffffff-ffff-ffff-ffff-ffffffffffff");

mod actor;
pub use actor::{Actor, ActorId};

mod comment;
pub use comment::{create_comment, Comment, CommentId, CommentRecord, NewComment};

mod db;
pub use db::{ActionClass, Db};

mod error;
pub use error::{Error, Field};

mod fingerprint;
pub use fingerprint::{Fingerprint, UNKNOWN_ADDRESS};

mod gate;
pub use gate::{submit_comment, Outcome, Submission, Submitted, AUTHOR_NAME_LEN, BODY_LEN};

mod limiter;
pub use limiter::{count_recent_actions, RateLimit};

mod policy;
pub use policy::{ModerationMode, Policy, Salt};

mod subject;
pub use subject::SubjectId;

mod thread;
pub use thread::{build_thread, list_thread, ThreadNode};

mod validate;
pub use validate::{validate_email, validate_length, validate_string};

mod view;
pub use view::{get_stats, record_view, NewView, Stats, ViewEvent, ViewRecorded, MAX_REFERRER_LEN};
