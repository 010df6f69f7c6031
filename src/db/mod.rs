//! Database layer: durable tasks, checkpoints, audit history, and outbox.

pub mod checkpoints;
pub mod history;
pub mod lifecycle;
pub mod outbox;
pub mod tasks;

use crate::error::{TaskError, TaskResult};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

/// Bounded retry count for transactions aborted by a busy database.
const CONFLICT_RETRIES: u32 = 3;

/// Database handle wrapping a SQLite connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> TaskResult<Self> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for concurrent access
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout=5000;",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> TaskResult<Self> {
        let conn = Connection::open_in_memory()?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        Ok(db)
    }

    /// Run database migrations.
    fn run_migrations(&self) -> TaskResult<()> {
        let mut conn = self.conn.lock().unwrap();
        embedded::migrations::runner().run(&mut *conn)?;
        Ok(())
    }

    /// Execute a function with exclusive access to the connection.
    pub fn with_conn<F, T>(&self, f: F) -> TaskResult<T>
    where
        F: FnOnce(&Connection) -> TaskResult<T>,
    {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }

    /// Run `f` inside an immediate transaction, committing on success.
    ///
    /// The write lock is taken up front so every command serializes on the
    /// task rows it touches. A transaction aborted because the database is
    /// busy is retried a bounded number of times before `StorageConflict`
    /// reaches the caller.
    pub fn transaction<F, T>(&self, f: F) -> TaskResult<T>
    where
        F: Fn(&Transaction) -> TaskResult<T>,
    {
        let mut conn = self.conn.lock().unwrap();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = Self::try_transaction(&mut conn, &f);
            match result {
                Err(TaskError::StorageConflict) if attempt < CONFLICT_RETRIES => continue,
                other => return other,
            }
        }
    }

    fn try_transaction<F, T>(conn: &mut Connection, f: &F) -> TaskResult<T>
    where
        F: Fn(&Transaction) -> TaskResult<T>,
    {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

/// Get the current timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
