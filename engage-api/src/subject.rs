use std::fmt;

use crate::{Error, Field};

pub const MAX_SUBJECT_LEN: usize = 200;

/// Content item that comments and views are attached to, e.g. an article slug
#[derive(
    Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct SubjectId(pub String);

impl SubjectId {
    pub fn new(s: impl Into<String>) -> SubjectId {
        SubjectId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_string(&self.0)?;
        crate::validate_length(Field::SubjectId, &self.0, 1..=MAX_SUBJECT_LEN)?;
        if self.0.chars().any(|c| c.is_control()) {
            return Err(Error::invalid(
                Field::SubjectId,
                "must not contain control characters",
            ));
        }
        Ok(())
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
