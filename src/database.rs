use anyhow::Result;
use sqlx::sqlite::SqlitePool;
use tracing::{debug, info};

use crate::error::DeployError;
use crate::models::Profile;

/// Registry of known profiles.
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        debug!("Opening profile registry at {}", database_url);
        let pool = SqlitePool::connect(database_url).await?;
        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        // one connection, each new connection would see its own empty database
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS profiles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                path TEXT NOT NULL,
                default_env TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Adds a profile, or updates path and default env of an existing one with the same name.
    pub async fn add_profile(&self, profile: &Profile) -> Result<Profile> {
        sqlx::query(
            r#"
            INSERT INTO profiles (name, path, default_env) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET path = excluded.path, default_env = excluded.default_env
            "#,
        )
        .bind(&profile.name)
        .bind(&profile.path)
        .bind(&profile.default_env)
        .execute(&self.pool)
        .await?;

        info!("Saved profile '{}' -> {}", profile.name, profile.path);
        self.get_profile_by_name(&profile.name)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Profile '{}' vanished after insert", profile.name))
    }

    pub async fn get_profile_by_name(&self, name: &str) -> Result<Option<Profile>> {
        let profile = sqlx::query_as::<_, Profile>(
            "SELECT id, name, path, default_env FROM profiles WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(profile)
    }

    pub async fn get_all_profiles(&self) -> Result<Vec<Profile>> {
        let profiles = sqlx::query_as::<_, Profile>(
            "SELECT id, name, path, default_env FROM profiles ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(profiles)
    }

    /// Returns whether a profile was removed.
    pub async fn remove_profile(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM profiles WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Looks a profile up by name; without a name the first registered profile is used.
    pub async fn find_profile(&self, name: Option<&str>) -> Result<Profile> {
        let found = match name {
            Some(name) => self.get_profile_by_name(name).await?,
            None => self.get_all_profiles().await?.into_iter().next(),
        };
        found.ok_or_else(|| {
            DeployError::ProfileNotFound {
                name: name.unwrap_or("<default>").to_string(),
            }
            .into()
        })
    }
}
