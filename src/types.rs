use serde::{Deserialize, Serialize};

/// Opaque ID types for type safety
pub type ConnectionId = String;
pub type TaskId = String;

/// Capability flags a permission rule can require
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Claim {
    Admin,
}

impl Claim {
    pub fn as_str(&self) -> &'static str {
        match self {
            Claim::Admin => "admin",
        }
    }
}

/// Identity decoded from a verified bearer token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Identity {
    /// Subject (user id)
    pub sub: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Expiry (seconds since epoch)
    pub exp: u64,
}

/// Read-mostly projection of an identity, attached to authenticated connections
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub user_id: String,
    pub display_name: String,
    pub is_admin: bool,
    pub roles: Vec<String>,
}

impl Claims {
    pub fn has(&self, claim: Claim) -> bool {
        match claim {
            Claim::Admin => self.is_admin,
        }
    }
}

impl From<&Identity> for Claims {
    fn from(identity: &Identity) -> Self {
        Self {
            user_id: identity.sub.clone(),
            display_name: identity
                .name
                .clone()
                .unwrap_or_else(|| identity.sub.clone()),
            is_admin: identity.roles.iter().any(|r| r == "admin"),
            roles: identity.roles.clone(),
        }
    }
}

/// Speaker of one conversation turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    System,
    User,
    Assistant,
}

/// One prior turn of a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}
