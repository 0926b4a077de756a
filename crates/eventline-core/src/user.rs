// User entity type
//
// Users belong to exactly one account. Every account has one system user
// that authors generated comments.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EventlineError, Result};
use crate::traits::Transaction;

/// Role of a user within an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Member,
    System,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "system" => Self::System,
            _ => Self::Member,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    pub role: UserRole,
}

impl User {
    pub fn member(account_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            account_id,
            name: name.into(),
            role: UserRole::Member,
        }
    }

    pub fn system(account_id: Uuid) -> Self {
        Self {
            id: Uuid::now_v7(),
            account_id,
            name: "System".to_string(),
            role: UserRole::System,
        }
    }

    pub fn is_system(&self) -> bool {
        self.role == UserRole::System
    }
}

/// Fail unless every id names an existing user of `account_id`
///
/// `role` names the ids in the error ("assignee", "mentionee").
pub(crate) async fn require_members(
    tx: &mut dyn Transaction,
    account_id: Uuid,
    ids: &[Uuid],
    role: &str,
) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }

    let users = tx.find_users(ids).await?;
    for id in ids {
        match users.iter().find(|user| user.id == *id) {
            None => {
                return Err(EventlineError::validation(format!(
                    "{role} {id} does not exist"
                )))
            }
            Some(user) if user.account_id != account_id => {
                return Err(EventlineError::validation(format!(
                    "{role} {id} belongs to another account"
                )))
            }
            Some(_) => {}
        }
    }
    Ok(())
}
