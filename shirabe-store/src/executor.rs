//! Streaming execution of generated SQL.
//!
//! Each cursor runs its statement on a dedicated connection in a worker
//! thread and hands rows over through a bounded channel, so large result sets
//! are never materialized. Dropping or closing the cursor stops the worker,
//! which releases the statement and the connection.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use tracing::{debug, error};

use crate::error::{Result, StoreError};
use crate::sql::GeneratedSql;

const ROW_BUFFER: usize = 256;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Forward-only stream of the first column of each row
pub trait RowCursor: Send {
    fn next_row(&mut self) -> Result<Option<i64>>;

    /// Release the statement and connection; safe to call more than once
    fn close(&mut self);
}

pub trait RawRowExecutor: Send + Sync {
    /// Start executing `sql`; at most `max_rows` rows are produced
    fn execute(&self, sql: &GeneratedSql, max_rows: Option<usize>) -> Result<Box<dyn RowCursor>>;
}

/// Executor over a SQLite database file
#[derive(Debug, Clone)]
pub struct SqliteRowExecutor {
    path: PathBuf,
}

impl SqliteRowExecutor {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl RawRowExecutor for SqliteRowExecutor {
    fn execute(&self, sql: &GeneratedSql, max_rows: Option<usize>) -> Result<Box<dyn RowCursor>> {
        if sql.match_nothing {
            return Ok(Box::new(EmptyCursor));
        }
        let (sender, receiver) = mpsc::sync_channel(ROW_BUFFER);
        let path = self.path.clone();
        let statement = sql.clone();
        let handle = thread::Builder::new()
            .name("shirabe-cursor".to_string())
            .spawn(move || {
                if let Err(e) = stream_rows(&path, &statement, &sender) {
                    error!("Failed to execute search query: {}", e);
                    let _ = sender.send(Err(e));
                }
            })
            .map_err(|e| StoreError::Other(format!("Failed to start cursor thread: {e}")))?;
        Ok(Box::new(SqliteRowCursor {
            receiver: Some(receiver),
            handle: Some(handle),
            remaining: max_rows,
        }))
    }
}

fn open_read_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

fn stream_rows(path: &Path, sql: &GeneratedSql, sender: &SyncSender<Result<i64>>) -> Result<()> {
    let conn = open_read_connection(path)?;
    let mut stmt = conn.prepare(&sql.sql)?;
    for (idx, value) in sql.bind_variables.iter().enumerate() {
        stmt.raw_bind_parameter(idx + 1, value)?;
    }
    let mut rows = stmt.raw_query();
    while let Some(row) = rows.next()? {
        let pid: i64 = row.get(0)?;
        if sender.send(Ok(pid)).is_err() {
            debug!("Cursor closed before the result set was exhausted");
            break;
        }
    }
    Ok(())
}

struct SqliteRowCursor {
    receiver: Option<Receiver<Result<i64>>>,
    handle: Option<JoinHandle<()>>,
    remaining: Option<usize>,
}

impl RowCursor for SqliteRowCursor {
    fn next_row(&mut self) -> Result<Option<i64>> {
        if self.remaining == Some(0) {
            self.close();
            return Ok(None);
        }
        let Some(receiver) = &self.receiver else {
            return Ok(None);
        };
        match receiver.recv() {
            Ok(Ok(pid)) => {
                if let Some(remaining) = &mut self.remaining {
                    *remaining -= 1;
                }
                Ok(Some(pid))
            }
            Ok(Err(e)) => {
                self.close();
                Err(e)
            }
            // worker finished and dropped its sender
            Err(_) => {
                self.close();
                Ok(None)
            }
        }
    }

    fn close(&mut self) {
        self.receiver.take();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("Cursor thread panicked");
        }
    }
}

impl Drop for SqliteRowCursor {
    fn drop(&mut self) {
        self.close();
    }
}

/// Cursor for statements known to match nothing
pub struct EmptyCursor;

impl RowCursor for EmptyCursor {
    fn next_row(&mut self) -> Result<Option<i64>> {
        Ok(None)
    }

    fn close(&mut self) {}
}
