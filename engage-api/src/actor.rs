use crate::STUB_UUID;

use uuid::Uuid;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ActorId(pub Uuid);

impl ActorId {
    pub fn stub() -> ActorId {
        ActorId(STUB_UUID)
    }
}

/// An authenticated identity, as resolved by the external auth system
///
/// Its name and email are copied onto each comment at submission time, so a
/// later rename or account removal does not rewrite history.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Actor {
    pub id: ActorId,
    pub name: String,
    pub email: String,
}
