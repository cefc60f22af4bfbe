//! SQLite-backed Store.
//!
//! Each record is stored as a JSON payload next to the columns it is queried
//! by. Several crewloop processes (the loop controller, spawn drivers, CLI
//! commands run by agents) share one database file per project, so writes
//! use immediate transactions and a busy timeout.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Params, TransactionBehavior, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

use super::Store;
use crate::domain::{LoopMessage, LoopRun, SpawnRecord, Turn};
use crate::error::{CrewError, Result};
use crate::id::now_ms;

const DB_FILE: &str = "crewloop.db";

pub struct SqliteStore {
    path: PathBuf,
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Open the store for a project under `store_dir/<project-hash>/`.
    pub fn open(store_dir: &Path, project_dir: &Path) -> Result<Self> {
        let project_hash = compute_project_hash(project_dir)?;
        Self::open_at(&store_dir.join(project_hash))
    }

    /// Open or create a store in the given directory.
    pub fn open_at(base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir)?;
        let path = base_dir.join(DB_FILE);
        let db = Connection::open(&path)?;
        db.busy_timeout(Duration::from_secs(10))?;
        Self::init_schema(&db)?;
        Ok(Self {
            path,
            db: Mutex::new(db),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_schema(db: &Connection) -> Result<()> {
        let _mode: String = db.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS loop_runs (
                id TEXT PRIMARY KEY,
                loop_name TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                json_data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_runs_created ON loop_runs(created_at);

            CREATE TABLE IF NOT EXISTS turns (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                run_id TEXT,
                scope_id TEXT NOT NULL,
                json_data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_turns_run ON turns(run_id);

            CREATE TABLE IF NOT EXISTS spawns (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                parent_turn_id TEXT NOT NULL,
                scope_id TEXT NOT NULL,
                status TEXT NOT NULL,
                json_data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_spawns_parent ON spawns(parent_turn_id);
            CREATE INDEX IF NOT EXISTS idx_spawns_scope ON spawns(scope_id);

            CREATE TABLE IF NOT EXISTS loop_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                step_index INTEGER NOT NULL,
                author TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_run ON loop_messages(run_id, id);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| CrewError::Storage("sqlite connection lock poisoned".to_string()))
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn query_json<T: DeserializeOwned, P: Params>(db: &Connection, sql: &str, params: P) -> Result<Vec<T>> {
    let mut stmt = db.prepare(sql)?;
    let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
    let mut records = Vec::new();
    for row in rows {
        records.push(serde_json::from_str(&row?)?);
    }
    Ok(records)
}

fn get_json<T: DeserializeOwned, P: Params>(db: &Connection, sql: &str, params: P) -> Result<Option<T>> {
    let json: Option<String> = db.query_row(sql, params, |row| row.get(0)).optional()?;
    json.map(|j| serde_json::from_str(&j).map_err(CrewError::from)).transpose()
}

fn write_run(db: &Connection, run: &LoopRun) -> Result<usize> {
    Ok(db.execute(
        "UPDATE loop_runs SET status = ?2, updated_at = ?3, json_data = ?4 WHERE id = ?1",
        params![run.id, run.status.as_str(), run.updated_at, to_json(run)?],
    )?)
}

fn write_turn(db: &Connection, turn: &Turn) -> Result<usize> {
    Ok(db.execute(
        "UPDATE turns SET json_data = ?2 WHERE id = ?1",
        params![turn.id, to_json(turn)?],
    )?)
}

fn write_spawn(db: &Connection, spawn: &SpawnRecord) -> Result<usize> {
    Ok(db.execute(
        "UPDATE spawns SET parent_turn_id = ?2, status = ?3, json_data = ?4 WHERE id = ?1",
        params![spawn.id, spawn.parent_turn_id, spawn.status.as_str(), to_json(spawn)?],
    )?)
}

fn expect_row(changed: usize, kind: &str, id: &str) -> Result<()> {
    if changed == 0 {
        return Err(CrewError::NotFound(format!("{kind} {id}")));
    }
    Ok(())
}

impl Store for SqliteStore {
    fn create_loop_run(&self, run: &LoopRun) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO loop_runs (id, loop_name, status, created_at, updated_at, json_data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![run.id, run.loop_name, run.status.as_str(), run.created_at, run.updated_at, to_json(run)?],
        )?;
        Ok(())
    }

    fn update_loop_run(&self, run: &LoopRun) -> Result<()> {
        let changed = write_run(&*self.conn()?, run)?;
        expect_row(changed, "loop run", &run.id)
    }

    fn get_loop_run(&self, id: &str) -> Result<Option<LoopRun>> {
        get_json(&*self.conn()?, "SELECT json_data FROM loop_runs WHERE id = ?1", [id])
    }

    fn list_loop_runs(&self) -> Result<Vec<LoopRun>> {
        query_json(&*self.conn()?, "SELECT json_data FROM loop_runs ORDER BY created_at, id", [])
    }

    fn modify_loop_run(&self, id: &str, f: &mut dyn FnMut(&mut LoopRun)) -> Result<LoopRun> {
        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut run: LoopRun = get_json(&tx, "SELECT json_data FROM loop_runs WHERE id = ?1", [id])?
            .ok_or_else(|| CrewError::NotFound(format!("loop run {id}")))?;
        f(&mut run);
        run.updated_at = now_ms();
        write_run(&tx, &run)?;
        tx.commit()?;
        Ok(run)
    }

    fn create_turn(&self, turn: &Turn) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO turns (id, run_id, scope_id, json_data) VALUES (?1, ?2, ?3, ?4)",
            params![turn.id, turn.run_id(), turn.scope_id, to_json(turn)?],
        )?;
        Ok(())
    }

    fn update_turn(&self, turn: &Turn) -> Result<()> {
        let changed = write_turn(&*self.conn()?, turn)?;
        expect_row(changed, "turn", &turn.id)
    }

    fn get_turn(&self, id: &str) -> Result<Option<Turn>> {
        get_json(&*self.conn()?, "SELECT json_data FROM turns WHERE id = ?1", [id])
    }

    fn list_turns(&self, run_id: &str) -> Result<Vec<Turn>> {
        query_json(&*self.conn()?, "SELECT json_data FROM turns WHERE run_id = ?1 ORDER BY seq", [run_id])
    }

    fn modify_turn(&self, id: &str, f: &mut dyn FnMut(&mut Turn)) -> Result<Turn> {
        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut turn: Turn = get_json(&tx, "SELECT json_data FROM turns WHERE id = ?1", [id])?
            .ok_or_else(|| CrewError::NotFound(format!("turn {id}")))?;
        f(&mut turn);
        write_turn(&tx, &turn)?;
        tx.commit()?;
        Ok(turn)
    }

    fn create_spawn(&self, spawn: &SpawnRecord) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO spawns (id, parent_turn_id, scope_id, status, json_data) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![spawn.id, spawn.parent_turn_id, spawn.scope_id, spawn.status.as_str(), to_json(spawn)?],
        )?;
        Ok(())
    }

    fn update_spawn(&self, spawn: &SpawnRecord) -> Result<()> {
        let changed = write_spawn(&*self.conn()?, spawn)?;
        expect_row(changed, "spawn", &spawn.id)
    }

    fn get_spawn(&self, id: &str) -> Result<Option<SpawnRecord>> {
        get_json(&*self.conn()?, "SELECT json_data FROM spawns WHERE id = ?1", [id])
    }

    fn spawns_by_parent(&self, turn_id: &str) -> Result<Vec<SpawnRecord>> {
        query_json(
            &*self.conn()?,
            "SELECT json_data FROM spawns WHERE parent_turn_id = ?1 ORDER BY seq",
            [turn_id],
        )
    }

    fn spawns_in_scope(&self, scope_id: &str) -> Result<Vec<SpawnRecord>> {
        query_json(&*self.conn()?, "SELECT json_data FROM spawns WHERE scope_id = ?1 ORDER BY seq", [scope_id])
    }

    fn modify_spawn(&self, id: &str, f: &mut dyn FnMut(&mut SpawnRecord) -> Result<()>) -> Result<SpawnRecord> {
        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut spawn: SpawnRecord = get_json(&tx, "SELECT json_data FROM spawns WHERE id = ?1", [id])?
            .ok_or_else(|| CrewError::NotFound(format!("spawn {id}")))?;
        // Dropping the transaction on error rolls it back.
        f(&mut spawn)?;
        write_spawn(&tx, &spawn)?;
        tx.commit()?;
        Ok(spawn)
    }

    fn list_loop_messages(&self, run_id: &str, after_id: i64) -> Result<Vec<LoopMessage>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT id, run_id, step_index, author, body, created_at FROM loop_messages
             WHERE run_id = ?1 AND id > ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![run_id, after_id], |row| {
            Ok(LoopMessage {
                id: row.get(0)?,
                run_id: row.get(1)?,
                step_index: row.get::<_, i64>(2)? as usize,
                author: row.get(3)?,
                body: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    fn post_loop_message(&self, run_id: &str, step_index: usize, author: &str, body: &str) -> Result<LoopMessage> {
        let db = self.conn()?;
        let created_at = now_ms();
        db.execute(
            "INSERT INTO loop_messages (run_id, step_index, author, body, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, step_index as i64, author, body, created_at],
        )?;
        Ok(LoopMessage {
            id: db.last_insert_rowid(),
            run_id: run_id.to_string(),
            step_index,
            author: author.to_string(),
            body: body.to_string(),
            created_at,
        })
    }
}

/// Compute a hash of the project directory path for storage isolation.
pub fn compute_project_hash(project_dir: &Path) -> Result<String> {
    let canonical = project_dir.canonicalize()?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    let result = hasher.finalize();

    // First 16 hex chars
    Ok(hex::encode(&result[..8]))
}
