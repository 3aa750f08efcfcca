//! SQLite journal for durable workflow execution.
//!
//! The journal is the engine's source of truth: one row per instance, one
//! row per step. A step row is written *before* control returns from the
//! executor's `run`, which is the whole crash-recovery contract — if the
//! process dies before the write the step replays, if it dies after the
//! write the stored result is returned verbatim.
//!
//! WAL mode is enabled for concurrent instance tasks sharing the file.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use uuid::Uuid;

use relay_sdk::{EngineError, InstanceState, StepRecord, StepStatus, WorkflowInstance};

pub struct Journal {
    conn: Mutex<Connection>,
}

fn db_err(err: rusqlite::Error) -> EngineError {
    EngineError::Journal(err.to_string())
}

impl Journal {
    /// Open (or create) the journal at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| EngineError::Journal(e.to_string()))?;
            }
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(db_err)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(db_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory journal for tests.
    pub fn in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn initialize_schema(&self) -> Result<(), EngineError> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                id TEXT PRIMARY KEY,
                definition_id TEXT NOT NULL,
                correlation_key TEXT NOT NULL,
                state TEXT NOT NULL,
                trigger TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_instances_state ON instances(state);
            CREATE INDEX IF NOT EXISTS idx_instances_correlation
                ON instances(correlation_key);

            CREATE TABLE IF NOT EXISTS steps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                result TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,

                FOREIGN KEY(instance_id) REFERENCES instances(id) ON DELETE CASCADE,
                UNIQUE(instance_id, name)
            );

            CREATE INDEX IF NOT EXISTS idx_steps_instance ON steps(instance_id);

            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );

            INSERT OR IGNORE INTO schema_version (version) VALUES (1);
            "#,
        )
        .map_err(db_err)?;

        Ok(())
    }

    pub fn create_instance(
        &self,
        definition_id: &str,
        correlation_key: &str,
        trigger: &Value,
    ) -> Result<WorkflowInstance, EngineError> {
        let now = Utc::now();
        let instance = WorkflowInstance {
            id: Uuid::new_v4(),
            definition_id: definition_id.to_string(),
            correlation_key: correlation_key.to_string(),
            state: InstanceState::Pending,
            trigger: trigger.clone(),
            created_at: now,
            updated_at: now,
        };

        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO instances (
                id, definition_id, correlation_key, state, trigger, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                instance.id.to_string(),
                instance.definition_id,
                instance.correlation_key,
                instance.state.as_str(),
                trigger.to_string(),
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;

        Ok(instance)
    }

    pub fn instance(&self, id: Uuid) -> Result<Option<WorkflowInstance>, EngineError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            r#"
            SELECT id, definition_id, correlation_key, state, trigger, created_at, updated_at
            FROM instances
            WHERE id = ?1
            "#,
            params![id.to_string()],
            map_instance_row,
        )
        .optional()
        .map_err(db_err)
    }

    pub fn instance_state(&self, id: Uuid) -> Result<Option<InstanceState>, EngineError> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row(
                "SELECT state FROM instances WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(raw.as_deref().and_then(InstanceState::parse))
    }

    /// Apply a lifecycle transition, rejecting invalid ones.
    pub fn set_instance_state(&self, id: Uuid, next: InstanceState) -> Result<(), EngineError> {
        let current = self
            .instance_state(id)?
            .ok_or_else(|| EngineError::Journal(format!("unknown instance {id}")))?;

        if current == next {
            return Ok(());
        }
        if !current.can_transition_to(next) {
            return Err(EngineError::Journal(format!(
                "invalid state transition {current} -> {next} for instance {id}"
            )));
        }

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE instances SET state = ?1, updated_at = ?2 WHERE id = ?3",
            params![next.as_str(), Utc::now().to_rfc3339(), id.to_string()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Instances left in a non-terminal state, oldest first. Consulted on
    /// startup to resume executions interrupted by a crash.
    pub fn non_terminal_instances(&self) -> Result<Vec<WorkflowInstance>, EngineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, definition_id, correlation_key, state, trigger, created_at, updated_at
                FROM instances
                WHERE state IN ('pending', 'running', 'sleeping', 'cancelling')
                ORDER BY created_at ASC
                "#,
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map([], map_instance_row)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    /// The stored result of a step, if (and only if) it completed.
    pub fn completed_result(
        &self,
        instance_id: Uuid,
        name: &str,
    ) -> Result<Option<Value>, EngineError> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<Option<String>> = conn
            .query_row(
                "SELECT result FROM steps WHERE instance_id = ?1 AND name = ?2 AND status = 'completed'",
                params![instance_id.to_string(), name],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        match raw.flatten() {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    /// Persist a completed step. A row that already completed is left
    /// untouched: completed results are immutable.
    pub fn record_step_completed(
        &self,
        instance_id: Uuid,
        name: &str,
        result: &Value,
        attempts: u32,
    ) -> Result<(), EngineError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO steps (instance_id, name, status, result, attempts, last_error, created_at, updated_at)
            VALUES (?1, ?2, 'completed', ?3, ?4, NULL, ?5, ?5)
            ON CONFLICT(instance_id, name) DO UPDATE SET
                status = 'completed',
                result = excluded.result,
                attempts = excluded.attempts,
                last_error = NULL,
                updated_at = excluded.updated_at
            WHERE steps.status != 'completed'
            "#,
            params![
                instance_id.to_string(),
                name,
                result.to_string(),
                attempts,
                now,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Record a failed attempt that will be retried.
    pub fn record_step_attempt(
        &self,
        instance_id: Uuid,
        name: &str,
        attempts: u32,
        error: &str,
    ) -> Result<(), EngineError> {
        self.upsert_step(instance_id, name, StepStatus::Pending, attempts, Some(error))
    }

    /// Record a terminally failed step.
    pub fn record_step_failed(
        &self,
        instance_id: Uuid,
        name: &str,
        attempts: u32,
        error: &str,
    ) -> Result<(), EngineError> {
        self.upsert_step(instance_id, name, StepStatus::Failed, attempts, Some(error))
    }

    fn upsert_step(
        &self,
        instance_id: Uuid,
        name: &str,
        status: StepStatus,
        attempts: u32,
        error: Option<&str>,
    ) -> Result<(), EngineError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO steps (instance_id, name, status, result, attempts, last_error, created_at, updated_at)
            VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, ?6)
            ON CONFLICT(instance_id, name) DO UPDATE SET
                status = excluded.status,
                attempts = excluded.attempts,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            WHERE steps.status != 'completed'
            "#,
            params![
                instance_id.to_string(),
                name,
                status.as_str(),
                attempts,
                error,
                now,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// All step records of an instance in creation order.
    pub fn steps(&self, instance_id: Uuid) -> Result<Vec<StepRecord>, EngineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT name, status, result, attempts, last_error
                FROM steps
                WHERE instance_id = ?1
                ORDER BY id ASC
                "#,
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![instance_id.to_string()], |row| {
                let status: String = row.get(1)?;
                let result: Option<String> = row.get(2)?;
                Ok((
                    row.get::<_, String>(0)?,
                    status,
                    result,
                    row.get::<_, u32>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        let mut records = Vec::with_capacity(rows.len());
        for (name, status, result, attempts, last_error) in rows {
            let status = StepStatus::parse(&status)
                .ok_or_else(|| EngineError::Journal(format!("unknown step status '{status}'")))?;
            let result = match result {
                Some(text) => Some(serde_json::from_str(&text)?),
                None => None,
            };
            records.push(StepRecord {
                name,
                status,
                result,
                attempts,
                last_error,
            });
        }
        Ok(records)
    }
}

fn map_instance_row(row: &Row<'_>) -> rusqlite::Result<WorkflowInstance> {
    let id: String = row.get(0)?;
    let state: String = row.get(3)?;
    let trigger: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;

    let parse_err = |message: String| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            message.into(),
        )
    };

    Ok(WorkflowInstance {
        id: Uuid::parse_str(&id).map_err(|e| parse_err(e.to_string()))?,
        definition_id: row.get(1)?,
        correlation_key: row.get(2)?,
        state: InstanceState::parse(&state)
            .ok_or_else(|| parse_err(format!("unknown instance state '{state}'")))?,
        trigger: serde_json::from_str(&trigger).map_err(|e| parse_err(e.to_string()))?,
        created_at: created_at
            .parse()
            .map_err(|e: chrono::ParseError| parse_err(e.to_string()))?,
        updated_at: updated_at
            .parse()
            .map_err(|e: chrono::ParseError| parse_err(e.to_string()))?,
    })
}
