use std::sync::Mutex;

use chrono::NaiveDateTime;
use rusqlite::Connection;

use metronome_core::{Job, JobName, JobState, Schedule};

use crate::error::{Result, StorageError};
use crate::Storage;

/// Naive UTC timestamps are stored in this fixed format.
const DT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

const LAST_EXECUTION_KEY: &str = "last_execution_date";
/// Present once the catalog has been written at least once, so a restart can
/// tell an empty catalog from a never-used store.
const SEEDED_KEY: &str = "seeded";

/// SQLite adapter behind a single mutex-guarded connection.
///
/// A mutex (rather than a pool) is enough here: both stages issue short
/// serial statements and the schema is two small tables.
pub struct SqliteStorage {
    db: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) the database at `path` and initialise the schema.
    pub fn open(path: &str) -> Result<Self> {
        Self::new(Connection::open(path)?)
    }

    /// Wrap an already-open connection (e.g. in-memory for tests).
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }
}

/// Initialise the scheduler schema in `conn` (idempotent).
fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            name     TEXT    NOT NULL PRIMARY KEY,
            schedule TEXT    NOT NULL,   -- cron source text ('@reboot' included)
            timezone TEXT    NOT NULL,
            state    TEXT    NOT NULL,
            task     TEXT    NOT NULL,   -- opaque JSON payload
            overlap  INTEGER NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS scheduler_meta (
            key   TEXT NOT NULL PRIMARY KEY,
            value TEXT NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}

fn mark_seeded(conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO scheduler_meta (key, value) VALUES (?1, '1')",
        [SEEDED_KEY],
    )?;
    Ok(())
}

fn meta_value(conn: &Connection, key: &str) -> Result<Option<String>> {
    match conn.query_row(
        "SELECT value FROM scheduler_meta WHERE key = ?1",
        [key],
        |row| row.get::<_, String>(0),
    ) {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(StorageError::Database(e)),
    }
}

/// Map a SQLite row to a `Job`.
fn row_to_job(row: &rusqlite::Row<'_>) -> Result<Job> {
    let name: String = row.get(0).map_err(StorageError::Database)?;
    let schedule_src: String = row.get(1).map_err(StorageError::Database)?;
    let timezone: String = row.get(2).map_err(StorageError::Database)?;
    let state_str: String = row.get(3).map_err(StorageError::Database)?;
    let task_json: String = row.get(4).map_err(StorageError::Database)?;
    let overlap: bool = row.get(5).map_err(StorageError::Database)?;

    let corrupt = |reason: String| StorageError::Corrupt {
        entry: name.clone(),
        reason,
    };
    let schedule = Schedule::parse(&schedule_src).map_err(|e| corrupt(e.to_string()))?;
    let state: JobState = state_str.parse().map_err(|e| corrupt(e))?;
    let task = serde_json::from_str(&task_json).map_err(|e| corrupt(e.to_string()))?;

    Ok(Job {
        name: JobName(name),
        schedule,
        timezone,
        state,
        task,
        overlap,
    })
}

impl Storage for SqliteStorage {
    fn jobs(&self) -> Result<Option<Vec<Job>>> {
        let db = self.db.lock().unwrap();
        if meta_value(&db, SEEDED_KEY)?.is_none() {
            return Ok(None);
        }

        let mut stmt = db.prepare(
            "SELECT name, schedule, timezone, state, task, overlap FROM jobs ORDER BY name",
        )?;
        let mut rows = stmt.query([])?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next()? {
            jobs.push(row_to_job(row)?);
        }
        Ok(Some(jobs))
    }

    fn add_job(&self, job: &Job) -> Result<()> {
        let task_json = serde_json::to_string(&job.task).map_err(|e| StorageError::Corrupt {
            entry: job.name.to_string(),
            reason: e.to_string(),
        })?;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO jobs (name, schedule, timezone, state, task, overlap)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                job.name.as_str(),
                job.schedule.source(),
                job.timezone,
                job.state.to_string(),
                task_json,
                job.overlap,
            ],
        )?;
        mark_seeded(&db)
    }

    fn delete_job(&self, name: &JobName) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute("DELETE FROM jobs WHERE name = ?1", [name.as_str()])?;
        mark_seeded(&db)
    }

    fn update_job_state(&self, name: &JobName, state: JobState) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE jobs SET state = ?1 WHERE name = ?2",
            rusqlite::params![state.to_string(), name.as_str()],
        )?;
        mark_seeded(&db)
    }

    fn purge(&self) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute("DELETE FROM jobs", [])?;
        mark_seeded(&db)
    }

    fn last_execution_date(&self) -> Result<Option<NaiveDateTime>> {
        let db = self.db.lock().unwrap();
        match meta_value(&db, LAST_EXECUTION_KEY)? {
            Some(raw) => {
                let dt = NaiveDateTime::parse_from_str(&raw, DT_FORMAT).map_err(|e| {
                    StorageError::Corrupt {
                        entry: LAST_EXECUTION_KEY.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                Ok(Some(dt))
            }
            None => Ok(None),
        }
    }

    fn update_last_execution_date(&self, dt: NaiveDateTime) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO scheduler_meta (key, value) VALUES (?1, ?2)",
            rusqlite::params![LAST_EXECUTION_KEY, dt.format(DT_FORMAT).to_string()],
        )?;
        Ok(())
    }
}
