use anyhow::Context;
use chrono::Duration;

use crate::{ActionClass, Db, Error, Fingerprint, Time};

/// At most `max_actions` actions per sliding `window`
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RateLimit {
    pub max_actions: u64,
    pub window: Duration,
}

/// Counts the actions of `class` logged for `fingerprint` in the `window`
/// ending at `now`, bounds included
///
/// `now` must come from the server's own clock, never from the client, or an
/// abuser could slide the window past their own history.
pub async fn count_recent_actions<D: Db>(
    db: &mut D,
    fingerprint: &Fingerprint,
    class: &ActionClass,
    window: Duration,
    now: Time,
) -> anyhow::Result<u64> {
    db.count_actions_since(fingerprint, class, now - window)
        .await
        .with_context(|| format!("counting {class:?} actions of {fingerprint} in the last {window}"))
}

impl RateLimit {
    pub fn new(max_actions: u64, window: Duration) -> RateLimit {
        RateLimit {
            max_actions,
            window,
        }
    }

    /// Whether `recent` earlier actions already use up the whole allowance
    pub fn is_exhausted_by(&self, recent: u64) -> bool {
        recent >= self.max_actions
    }

    /// Checks whether one more action may go through
    ///
    /// This is a plain check-then-act: two concurrent requests from the same
    /// fingerprint may both pass before either one is logged, letting one
    /// action over the limit slip through. That is an accepted soft limit for
    /// an anti-spam heuristic, not something to serialize on.
    pub async fn check<D: Db>(
        &self,
        db: &mut D,
        fingerprint: &Fingerprint,
        class: &ActionClass,
        now: Time,
    ) -> anyhow::Result<Result<(), Error>> {
        let recent = count_recent_actions(db, fingerprint, class, self.window, now).await?;
        match self.is_exhausted_by(recent) {
            true => Ok(Err(Error::RateLimited)),
            false => Ok(Ok(())),
        }
    }
}
