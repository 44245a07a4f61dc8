use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow, bail};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::create_timestamp;
use crate::sandbox::Verdict;
use crate::store::{ResultStore, STATE_FINISHED, STATE_PENDING, SubmissionRecord};

const DATABASE_NAME: &str = "grader.sqlite3";

pub fn get_db_path() -> Result<PathBuf> {
    use directories::ProjectDirs;

    let proj_dirs = ProjectDirs::from("", "", "grader")
        .ok_or_else(|| anyhow!("Unable to find user directory"))?;
    let data_dir = proj_dirs.data_local_dir();

    fs::create_dir_all(data_dir)?;

    Ok(data_dir.join(DATABASE_NAME))
}

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display()); // rwc = read/write/create
    let db_pool = SqlitePoolOptions::new()
        .max_connections(4)
        .min_connections(0)
        .connect(&db_url)
        .await?;

    // PRAGMA statements cannot be run inside a transaction
    for pragma_sql in &[
        "PRAGMA busy_timeout = 2000;", // 2 seconds timeout for lock contention
        "PRAGMA journal_mode = WAL;",
        "PRAGMA synchronous = NORMAL;",
    ] {
        sqlx::query(pragma_sql).execute(&db_pool).await?;
    }

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS submissions (
            id            TEXT     PRIMARY KEY,
            created_time  TEXT     NOT NULL,
            updated_time  TEXT     NOT NULL,
            state         TEXT     NOT NULL,
            verdict       TEXT,
            elapsed_time  INTEGER
        );",
    )
    .execute(&db_pool)
    .await?;

    log::info!("Initialized result store at {}", db_path.as_ref().display());

    Ok(db_pool)
}

pub fn remove_db(db_path: impl AsRef<Path>) {
    // Remove WAL and SHM files (ignore errors as they might not exist)
    let wal_path = format!("{}-wal", db_path.as_ref().display());
    let shm_path = format!("{}-shm", db_path.as_ref().display());
    let _ = fs::remove_file(wal_path);
    let _ = fs::remove_file(shm_path);

    if let Err(e) = fs::remove_file(&db_path) {
        log::warn!(
            "Unable to remove result store at {}: {e}",
            db_path.as_ref().display()
        );
    } else {
        log::info!("Removed result store at {}", db_path.as_ref().display());
    }
}

/// Result store backed by a SQLite database
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(db_path: impl AsRef<Path>) -> sqlx::Result<Self> {
        Ok(Self::new(init_db(db_path).await?))
    }

    /// Registers a submission as accepted for grading
    ///
    /// # Errors
    ///
    /// Fails if a record with the same id already exists or the insert fails.
    pub async fn insert_pending(&self, submission_id: &str) -> sqlx::Result<()> {
        let now = create_timestamp();
        sqlx::query(
            r#"
            INSERT INTO submissions (id, created_time, updated_time, state)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(submission_id)
        .bind(&now)
        .bind(&now)
        .bind(STATE_PENDING)
        .execute(&self.pool)
        .await?;

        log::debug!("Inserted pending submission {submission_id}");
        Ok(())
    }

    pub async fn fetch(&self, submission_id: &str) -> sqlx::Result<Option<SubmissionRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, created_time, updated_time, state, verdict, elapsed_time
            FROM submissions
            WHERE id = ?
            "#,
        )
        .bind(submission_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let elapsed_time: Option<i64> = row.try_get("elapsed_time")?;
            Ok::<_, sqlx::Error>(SubmissionRecord {
                id: row.try_get("id")?,
                created_time: row.try_get("created_time")?,
                updated_time: row.try_get("updated_time")?,
                state: row.try_get("state")?,
                verdict: row.try_get("verdict")?,
                elapsed_time: elapsed_time.map(|t| t as u64),
            })
        })
        .transpose()
    }
}

impl ResultStore for SqliteStore {
    async fn record_verdict(
        &self,
        submission_id: &str,
        verdict: &Verdict,
        elapsed_time: u64,
    ) -> Result<()> {
        let now = create_timestamp();

        // Inserts the row if the collaborator never registered it, but never
        // overwrites a finished one
        let result = sqlx::query(
            r#"
            INSERT INTO submissions (id, created_time, updated_time, state, verdict, elapsed_time)
            VALUES (?1, ?2, ?2, ?3, ?4, ?5)
            ON CONFLICT (id) DO UPDATE
            SET state = excluded.state,
                verdict = excluded.verdict,
                elapsed_time = excluded.elapsed_time,
                updated_time = excluded.updated_time
            WHERE submissions.state = ?6
            "#,
        )
        .bind(submission_id)
        .bind(&now)
        .bind(STATE_FINISHED)
        .bind(verdict.to_string())
        .bind(elapsed_time as i64)
        .bind(STATE_PENDING)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("Verdict of submission {submission_id} was already recorded");
        }

        log::debug!("Recorded verdict of submission {submission_id}");
        Ok(())
    }
}
