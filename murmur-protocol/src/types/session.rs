use serde::{Deserialize, Serialize};

/// Authenticated handle to a homeserver for one user
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub home_server: String,
    pub user_id: String,
    pub access_token: String,
}

impl Session {
    pub fn new(
        home_server: impl Into<String>,
        user_id: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            home_server: home_server.into(),
            user_id: user_id.into(),
            access_token: access_token.into(),
        }
    }

    /// All three credential fields are present
    pub fn is_complete(&self) -> bool {
        !self.home_server.is_empty() && !self.user_id.is_empty() && !self.access_token.is_empty()
    }
}

// Keeps access tokens out of logs.
impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("home_server", &self.home_server)
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Profile of the connected user
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserProfile {
    pub id: String,
    #[serde(default, rename = "displayname")]
    pub display_name: Option<String>,
    #[serde(default, rename = "avatar")]
    pub avatar_url: Option<String>,
    /// Milliseconds since the user was last active
    #[serde(default)]
    pub last_active: Option<u64>,
    #[serde(default)]
    pub status: Option<String>,
}
