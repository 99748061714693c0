//! User reads. Account management (registration, password changes, CRUD)
//! is an admin-UI concern; the core only resolves identities behind
//! tokens and seeds accounts for tests.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::Db;

/// Role strings stored on users and carried in token claims.
pub const ROLE_ADMIN: &str = "Admin";
/// Default role.
pub const ROLE_USER: &str = "User";

/// One user row.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: i64,
    pub user_name: String,
    pub role: String,
    pub is_deleted: bool,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl User {
    /// Whether this user bypasses visibility checks.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }
}

/// Fetch a non-deleted user by id.
pub async fn get(db: &Db, id: i64) -> Result<Option<User>> {
    let user = sqlx::query_as::<_, User>(
        "SELECT id, user_name, role, is_deleted, create_time, update_time \
         FROM users WHERE id = ? AND is_deleted = 0",
    )
    .bind(id)
    .fetch_optional(db.pool())
    .await
    .context("user query failed")?;
    Ok(user)
}

/// Insert a user (seeding and tests). The password hash fields are owned
/// by the authentication collaborator and stored opaquely.
pub async fn insert(db: &Db, user_name: &str, role: &str) -> Result<i64> {
    let now = Utc::now();
    let result = sqlx::query(
        "INSERT INTO users (user_name, password_hash, password_salt, role, create_time, update_time) \
         VALUES (?, '', '', ?, ?, ?)",
    )
    .bind(user_name)
    .bind(role)
    .bind(now)
    .bind(now)
    .execute(db.pool())
    .await
    .context("user insert failed")?;
    Ok(result.last_insert_rowid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_get() {
        let db = Db::connect_in_memory().await.unwrap();
        let id = insert(&db, "alice", ROLE_USER).await.unwrap();
        let user = get(&db, id).await.unwrap().unwrap();
        assert_eq!(user.user_name, "alice");
        assert!(!user.is_admin());
        assert!(get(&db, 999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_user_name_is_unique() {
        let db = Db::connect_in_memory().await.unwrap();
        insert(&db, "alice", ROLE_USER).await.unwrap();
        assert!(insert(&db, "alice", ROLE_ADMIN).await.is_err());
    }

    #[tokio::test]
    async fn test_soft_deleted_users_are_invisible() {
        let db = Db::connect_in_memory().await.unwrap();
        let id = insert(&db, "bob", ROLE_ADMIN).await.unwrap();
        sqlx::query("UPDATE users SET is_deleted = 1 WHERE id = ?")
            .bind(id)
            .execute(db.pool())
            .await
            .unwrap();
        assert!(get(&db, id).await.unwrap().is_none());
    }
}
