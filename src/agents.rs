//! Agent-side collaborators of a chat turn: resolving the target agent, saving
//! what the agent learned, and the disclaimer acceptance lookup.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use crate::db::DbPool;
use crate::types::{AgentsError, Result, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAgent {
    /// Stable id, survives renames.
    pub agent_id: String,
    pub agent_name: String,
    pub display_name: String,
    pub source: String,
    pub message_suffix: Option<String>,
    pub requires_disclaimer: bool,
    pub deleted: bool,
    pub origin: String,
}

impl ResolvedAgent {
    /// Absolute URL of another agent referenced from this one's source.
    pub fn resolve_reference(&self, name: &str) -> String {
        format!(
            "{}/agents/{}",
            self.origin.trim_end_matches('/'),
            name.trim_start_matches('@')
        )
    }
}

#[async_trait]
pub trait AgentResolver: Send + Sync {
    /// Deleted agents still resolve, flagged with `deleted`.
    async fn resolve(&self, agent_name: &str, origin: &str) -> Result<ResolvedAgent>;
}

#[async_trait]
pub trait AgentCollection: Send + Sync {
    async fn update_agent_source(&self, agent_id: &str, source: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisclaimerStatus {
    pub accepted: bool,
}

#[async_trait]
pub trait DisclaimerStore: Send + Sync {
    async fn status(&self, user: &UserId, agent_id: &str) -> Result<DisclaimerStatus>;
}

/// Fields of a new or replaced agent row.
#[derive(Debug, Clone, Default)]
pub struct AgentDefinition {
    pub name: String,
    pub display_name: Option<String>,
    pub source: String,
    pub message_suffix: Option<String>,
    pub requires_disclaimer: bool,
}

pub struct SqliteAgentRegistry {
    pool: DbPool,
}

impl SqliteAgentRegistry {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Inserts the agent or replaces the definition of the one with the same name.
    /// Returns the stable agent id.
    pub async fn upsert(&self, agent: &AgentDefinition) -> Result<String> {
        let now = Utc::now().to_rfc3339();
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO agents (id, name, display_name, source, message_suffix, requires_disclaimer, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET
                display_name = excluded.display_name,
                source = excluded.source,
                message_suffix = excluded.message_suffix,
                requires_disclaimer = excluded.requires_disclaimer,
                deleted_at = NULL,
                updated_at = excluded.updated_at",
        )
        .bind(&id)
        .bind(&agent.name)
        .bind(&agent.display_name)
        .bind(&agent.source)
        .bind(&agent.message_suffix)
        .bind(agent.requires_disclaimer)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let (stored_id,): (String,) = sqlx::query_as("SELECT id FROM agents WHERE name = ?")
            .bind(&agent.name)
            .fetch_one(&self.pool)
            .await?;
        tracing::info!("Registered agent {} ({})", agent.name, stored_id);
        Ok(stored_id)
    }

    /// Soft delete; the agent keeps resolving so callers can answer 410.
    pub async fn mark_deleted(&self, agent_name: &str) -> Result<()> {
        let updated = sqlx::query("UPDATE agents SET deleted_at = ? WHERE name = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(agent_name)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(AgentsError::AgentNotFound(agent_name.to_string()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl AgentResolver for SqliteAgentRegistry {
    async fn resolve(&self, agent_name: &str, origin: &str) -> Result<ResolvedAgent> {
        let row = sqlx::query(
            "SELECT id, name, display_name, source, message_suffix, requires_disclaimer, deleted_at
             FROM agents WHERE name = ?",
        )
        .bind(agent_name)
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(r) => r,
            None => return Err(AgentsError::AgentNotFound(agent_name.to_string()).into()),
        };

        let name: String = row.try_get("name")?;
        let display_name: Option<String> = row.try_get("display_name")?;
        let deleted_at: Option<String> = row.try_get("deleted_at")?;
        Ok(ResolvedAgent {
            agent_id: row.try_get("id")?,
            display_name: display_name.unwrap_or_else(|| name.clone()),
            agent_name: name,
            source: row.try_get("source")?,
            message_suffix: row.try_get("message_suffix")?,
            requires_disclaimer: row.try_get("requires_disclaimer")?,
            deleted: deleted_at.is_some(),
            origin: origin.to_string(),
        })
    }
}

#[async_trait]
impl AgentCollection for SqliteAgentRegistry {
    async fn update_agent_source(&self, agent_id: &str, source: &str) -> Result<()> {
        let updated = sqlx::query("UPDATE agents SET source = ?, updated_at = ? WHERE id = ?")
            .bind(source)
            .bind(Utc::now().to_rfc3339())
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(AgentsError::AgentNotFound(agent_id.to_string()).into());
        }
        tracing::info!("Saved learned source for agent {}", agent_id);
        Ok(())
    }
}

pub struct SqliteDisclaimerStore {
    pool: DbPool,
}

impl SqliteDisclaimerStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn accept(&self, user: &UserId, agent_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO disclaimer_acceptances (user_id, agent_id, accepted_at) VALUES (?, ?, ?)",
        )
        .bind(&user.0)
        .bind(agent_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DisclaimerStore for SqliteDisclaimerStore {
    async fn status(&self, user: &UserId, agent_id: &str) -> Result<DisclaimerStatus> {
        let row = sqlx::query(
            "SELECT 1 FROM disclaimer_acceptances WHERE user_id = ? AND agent_id = ?",
        )
        .bind(&user.0)
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(DisclaimerStatus {
            accepted: row.is_some(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_db;

    fn definition(name: &str) -> AgentDefinition {
        AgentDefinition {
            name: name.into(),
            source: "You are helpful.".into(),
            message_suffix: Some("\n\n---\nPowered by X".into()),
            ..AgentDefinition::default()
        }
    }

    #[tokio::test]
    async fn test_register_resolve_and_update() {
        let pool = init_memory_db().await.unwrap();
        let registry = SqliteAgentRegistry::new(pool);

        let id = registry.upsert(&definition("helper")).await.unwrap();
        let agent = registry.resolve("helper", "https://agents.test/").await.unwrap();
        assert_eq!(agent.agent_id, id);
        assert_eq!(agent.display_name, "helper");
        assert!(!agent.deleted);
        assert_eq!(agent.resolve_reference("@other"), "https://agents.test/agents/other");

        registry.update_agent_source(&id, "Learned.").await.unwrap();
        let again = registry.upsert(&definition("helper")).await.unwrap();
        assert_eq!(again, id, "upsert keeps the stable id");

        registry.mark_deleted("helper").await.unwrap();
        assert!(registry.resolve("helper", "").await.unwrap().deleted);
    }

    #[tokio::test]
    async fn test_unknown_agent_is_not_found() {
        let registry = SqliteAgentRegistry::new(init_memory_db().await.unwrap());
        let err = registry.resolve("ghost", "").await.unwrap_err();
        assert!(matches!(err.inner, AgentsError::AgentNotFound(_)));
    }

    #[tokio::test]
    async fn test_disclaimer_acceptance() {
        let store = SqliteDisclaimerStore::new(init_memory_db().await.unwrap());
        let user = UserId("u1".into());
        assert!(!store.status(&user, "a1").await.unwrap().accepted);
        store.accept(&user, "a1").await.unwrap();
        assert!(store.status(&user, "a1").await.unwrap().accepted);
        assert!(!store.status(&user, "a2").await.unwrap().accepted);
    }
}
