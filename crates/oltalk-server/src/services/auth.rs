use std::sync::Arc;

use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use rusqlite::OptionalExtension;
use thiserror::Error;

use crate::db::models::UserRow;
use crate::db::{now_secs, Database};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("user already exists")]
    UserExists,
    #[error("user not found")]
    NotFound,
    #[error("password mismatch")]
    BadPassword,
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// A successfully authenticated user.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub nickname: String,
}

/// Registration and login against the `users` table. Passwords are stored as
/// Argon2id hashes and never leave the store as plaintext.
pub struct AuthService {
    db: Arc<Database>,
}

impl AuthService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn register(
        &self,
        user_id: &str,
        nickname: &str,
        password: &str,
    ) -> Result<(), AuthError> {
        if self.user_exists(user_id)? {
            return Err(AuthError::UserExists);
        }

        // Argon2 is deliberately expensive; hash off the async runtime.
        let password = password.to_string();
        let hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| AuthError::Store(anyhow::anyhow!("hash task failed: {e}")))??;

        let user_id = user_id.to_string();
        let nickname = nickname.to_string();
        self.db.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO users (user_id, nickname, password_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![user_id, nickname, hash, now_secs()],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    pub async fn login(&self, user_id: &str, password: &str) -> Result<AuthUser, AuthError> {
        let row = self.lookup(user_id)?.ok_or(AuthError::NotFound)?;

        let password = password.to_string();
        let stored_hash = row.password_hash.clone();
        let ok = tokio::task::spawn_blocking(move || verify_password(&password, &stored_hash))
            .await
            .map_err(|e| AuthError::Store(anyhow::anyhow!("verify task failed: {e}")))?;
        if !ok {
            return Err(AuthError::BadPassword);
        }

        Ok(AuthUser {
            user_id: row.user_id,
            nickname: row.nickname,
        })
    }

    /// Used to validate private-message and private-file recipients.
    pub fn user_exists(&self, user_id: &str) -> Result<bool, AuthError> {
        let user_id = user_id.to_string();
        let exists = self.db.with_conn(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM users WHERE user_id = ?1",
                    [&user_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })?;
        Ok(exists)
    }

    fn lookup(&self, user_id: &str) -> Result<Option<UserRow>, AuthError> {
        let user_id = user_id.to_string();
        let row = self.db.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT user_id, nickname, password_hash, created_at
                     FROM users WHERE user_id = ?1",
                    [&user_id],
                    |row| {
                        Ok(UserRow {
                            user_id: row.get(0)?,
                            nickname: row.get(1)?,
                            password_hash: row.get(2)?,
                            created_at: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })?;
        Ok(row)
    }
}

fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Hash(e.to_string()))
}

fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, Arc<Database>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("test.db")).unwrap());
        (dir, db)
    }

    #[tokio::test]
    async fn register_then_login() {
        let (_dir, db) = test_db();
        let auth = AuthService::new(db);

        auth.register("alice", "Alice", "p1").await.unwrap();
        let user = auth.login("alice", "p1").await.unwrap();
        assert_eq!(user.user_id, "alice");
        assert_eq!(user.nickname, "Alice");
        assert!(auth.user_exists("alice").unwrap());
        assert!(!auth.user_exists("bob").unwrap());
    }

    #[tokio::test]
    async fn duplicate_register_rejected() {
        let (_dir, db) = test_db();
        let auth = AuthService::new(db);

        auth.register("alice", "Alice", "p1").await.unwrap();
        assert!(matches!(
            auth.register("alice", "Alice2", "p2").await,
            Err(AuthError::UserExists)
        ));
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user() {
        let (_dir, db) = test_db();
        let auth = AuthService::new(db);

        auth.register("alice", "Alice", "p1").await.unwrap();
        assert!(matches!(
            auth.login("alice", "wrong").await,
            Err(AuthError::BadPassword)
        ));
        assert!(matches!(
            auth.login("nobody", "p1").await,
            Err(AuthError::NotFound)
        ));
    }

    #[tokio::test]
    async fn password_is_stored_hashed() {
        let (_dir, db) = test_db();
        let auth = AuthService::new(db.clone());

        auth.register("alice", "Alice", "secret").await.unwrap();
        let stored: String = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT password_hash FROM users WHERE user_id = 'alice'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_ne!(stored, "secret");
        assert!(stored.starts_with("$argon2"));
    }
}
