//! Protocol versioning and well-known constants.

use serde::{Deserialize, Serialize};

use crate::frames::Ref;

/// Serializer version requested in the connection query (`vsn=2.0.0`).
pub const PROTOCOL_VERSION: Version = Version::new(2, 0, 0);

/// Socket path on the server.
pub const SOCKET_PATH: &str = "/socket/websocket";

/// The killmail channel topic.
pub const LOBBY_TOPIC: &str = "killmails:lobby";

/// Correlation id reserved for the channel join.
pub const JOIN_REF: Ref = Ref(1);

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Major version - breaking changes increment this.
    pub major: u8,
    /// Minor version - backwards-compatible changes increment this.
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}
