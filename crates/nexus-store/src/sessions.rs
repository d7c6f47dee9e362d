use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::instrument;

use nexus_core::errors::SessionError;
use nexus_core::ids::{AgentId, SessionId};
use nexus_core::session::{HistoryTurn, SessionMetadata, SessionRecord, SessionStore, TurnRole};

use crate::database::Database;
use crate::error::StoreError;

/// Agent session registrations and their conversation turns.
#[derive(Clone)]
pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Registration record for an agent, if any.
    #[instrument(skip(self), fields(agent_id = %agent_id))]
    pub fn metadata(&self, agent_id: &AgentId) -> Result<Option<SessionMetadata>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, display_name, chat_type, created_at, updated_at
                 FROM agent_sessions WHERE agent_id = ?1",
            )?;
            let mut rows = stmt.query([agent_id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(SessionMetadata {
                    session_id: SessionId::from_raw(get::<String>(row, 0, SESSIONS, "session_id")?),
                    display_name: get(row, 1, SESSIONS, "display_name")?,
                    chat_type: get(row, 2, SESSIONS, "chat_type")?,
                    created_at: get_time(row, 3, SESSIONS, "created_at")?,
                    updated_at: get_time(row, 4, SESSIONS, "updated_at")?,
                })),
                None => Ok(None),
            }
        })
    }

    /// Insert or replace the registration record.
    #[instrument(skip(self, metadata), fields(agent_id = %agent_id))]
    pub fn upsert_metadata(
        &self,
        agent_id: &AgentId,
        metadata: &SessionMetadata,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO agent_sessions
                    (agent_id, session_id, display_name, chat_type, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(agent_id) DO UPDATE SET
                    session_id = excluded.session_id,
                    display_name = excluded.display_name,
                    chat_type = excluded.chat_type,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    agent_id.as_str(),
                    metadata.session_id.as_str(),
                    metadata.display_name,
                    metadata.chat_type,
                    metadata.created_at.to_rfc3339(),
                    metadata.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Append one turn. The agent must already be registered.
    #[instrument(skip(self, turn), fields(agent_id = %agent_id, role = %turn.role))]
    pub fn append_turn(&self, agent_id: &AgentId, turn: &HistoryTurn) -> Result<(), StoreError> {
        self.db.with_tx(|tx| {
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM agent_sessions WHERE agent_id = ?1)",
                [agent_id.as_str()],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(StoreError::NotFound(format!("agent session {agent_id}")));
            }
            tx.execute(
                "INSERT INTO turns (agent_id, role, content, timestamp) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    agent_id.as_str(),
                    turn.role.to_string(),
                    turn.content,
                    turn.timestamp.to_rfc3339(),
                ],
            )?;
            tx.execute(
                "UPDATE agent_sessions SET updated_at = ?1 WHERE agent_id = ?2",
                rusqlite::params![Utc::now().to_rfc3339(), agent_id.as_str()],
            )?;
            Ok(())
        })
    }

    /// All turns for an agent in insertion order.
    #[instrument(skip(self), fields(agent_id = %agent_id))]
    pub fn history(&self, agent_id: &AgentId) -> Result<Vec<HistoryTurn>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT role, content, timestamp FROM turns WHERE agent_id = ?1 ORDER BY id ASC",
            )?;
            let mut rows = stmt.query([agent_id.as_str()])?;
            let mut turns = Vec::new();
            while let Some(row) = rows.next()? {
                let raw_role: String = get(row, 0, TURNS, "role")?;
                let role = raw_role.parse::<TurnRole>().map_err(|detail| StoreError::CorruptRow {
                    table: TURNS,
                    column: "role",
                    detail,
                })?;
                turns.push(HistoryTurn {
                    role,
                    content: get(row, 1, TURNS, "content")?,
                    timestamp: get_time(row, 2, TURNS, "timestamp")?,
                });
            }
            Ok(turns)
        })
    }

    /// Registered agent ids, alphabetical.
    pub fn list_agents(&self) -> Result<Vec<AgentId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT agent_id FROM agent_sessions ORDER BY agent_id")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids.into_iter().map(AgentId::from_raw).collect())
        })
    }
}

#[async_trait]
impl SessionStore for SessionRepo {
    async fn load(&self, agent_id: &AgentId) -> Result<Option<SessionRecord>, SessionError> {
        let Some(metadata) = self.metadata(agent_id)? else {
            return Ok(None);
        };
        let history = self.history(agent_id)?;
        Ok(Some(SessionRecord { metadata, history }))
    }

    async fn append(&self, agent_id: &AgentId, turn: HistoryTurn) -> Result<(), SessionError> {
        Ok(self.append_turn(agent_id, &turn)?)
    }

    async fn write_metadata(
        &self,
        agent_id: &AgentId,
        metadata: SessionMetadata,
    ) -> Result<(), SessionError> {
        Ok(self.upsert_metadata(agent_id, &metadata)?)
    }
}

const SESSIONS: &str = "agent_sessions";
const TURNS: &str = "turns";

fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// RFC 3339 text column.
fn get_time(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<DateTime<Utc>, StoreError> {
    let raw: String = get(row, idx, table, column)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table,
            column,
            detail: format!("invalid timestamp {raw:?}: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> SessionRepo {
        SessionRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn unknown_agent_has_no_metadata() {
        let repo = repo();
        assert!(repo.metadata(&AgentId::from_raw("toolbox-ea-x")).unwrap().is_none());
    }

    #[test]
    fn upsert_keeps_created_at() {
        let repo = repo();
        let id = AgentId::from_raw("toolbox-ea-worktrees");
        let meta = SessionMetadata::new("worktrees");
        repo.upsert_metadata(&id, &meta).unwrap();

        let mut updated = meta.clone();
        updated.updated_at = meta.updated_at + chrono::Duration::seconds(5);
        updated.created_at = meta.created_at + chrono::Duration::days(1);
        repo.upsert_metadata(&id, &updated).unwrap();

        let stored = repo.metadata(&id).unwrap().unwrap();
        assert_eq!(stored.display_name, "worktrees");
        assert_eq!(stored.created_at.timestamp(), meta.created_at.timestamp());
        assert_eq!(stored.updated_at.timestamp(), updated.updated_at.timestamp());
    }

    #[test]
    fn append_requires_registration() {
        let repo = repo();
        let id = AgentId::from_raw("toolbox-ea-x");
        let err = repo
            .append_turn(&id, &HistoryTurn::new(TurnRole::User, "hi"))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn history_in_insertion_order() {
        let repo = repo();
        let id = AgentId::from_raw("toolbox-ea-x");
        repo.upsert_metadata(&id, &SessionMetadata::new("x")).unwrap();
        repo.append_turn(&id, &HistoryTurn::new(TurnRole::User, "first")).unwrap();
        repo.append_turn(&id, &HistoryTurn::new(TurnRole::Assistant, "second")).unwrap();

        let history = repo.history(&id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, TurnRole::User);
        assert_eq!(history[0].content, "first");
        assert_eq!(history[1].role, TurnRole::Assistant);
    }

    #[test]
    fn corrupt_role_is_reported() {
        let repo = repo();
        let id = AgentId::from_raw("toolbox-ea-x");
        repo.upsert_metadata(&id, &SessionMetadata::new("x")).unwrap();
        repo.db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO turns (agent_id, role, content, timestamp)
                     VALUES (?1, 'robot', 'x', ?2)",
                    rusqlite::params![id.as_str(), Utc::now().to_rfc3339()],
                )?;
                Ok(())
            })
            .unwrap();
        let err = repo.history(&id).unwrap_err();
        assert!(matches!(err, StoreError::CorruptRow { table: "turns", column: "role", .. }));
    }

    #[test]
    fn list_agents_sorted() {
        let repo = repo();
        for name in ["toolbox-ea-b", "toolbox-ea-a"] {
            repo.upsert_metadata(&AgentId::from_raw(name), &SessionMetadata::new(name)).unwrap();
        }
        let ids: Vec<String> = repo
            .list_agents()
            .unwrap()
            .into_iter()
            .map(|a| a.to_string())
            .collect();
        assert_eq!(ids, vec!["toolbox-ea-a", "toolbox-ea-b"]);
    }

    #[tokio::test]
    async fn session_store_load_combines_metadata_and_history() {
        let repo = repo();
        let id = AgentId::from_raw("toolbox-ea-x");
        assert!(SessionStore::load(&repo, &id).await.unwrap().is_none());

        repo.write_metadata(&id, SessionMetadata::new("x")).await.unwrap();
        repo.append(&id, HistoryTurn::new(TurnRole::User, "task")).await.unwrap();

        let record = SessionStore::load(&repo, &id).await.unwrap().unwrap();
        assert_eq!(record.metadata.display_name, "x");
        assert_eq!(record.history.len(), 1);
    }

    #[tokio::test]
    async fn session_store_append_maps_errors() {
        let repo = repo();
        let err = repo
            .append(&AgentId::from_raw("toolbox-ea-x"), HistoryTurn::new(TurnRole::User, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Backend(_)));
    }
}
