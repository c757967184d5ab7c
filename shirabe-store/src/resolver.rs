//! Business id -> persistent id resolution.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension};
use shirabe_core::{RequestPartitionId, ResourcePid, SearchError};
use tracing::debug;

use crate::error::{Result, StoreError};

/// A business id, typed when the resource type is known
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypedId {
    pub resource_type: Option<String>,
    pub id: String,
}

impl TypedId {
    pub fn new(resource_type: &str, id: &str) -> Self {
        Self {
            resource_type: Some(resource_type.to_string()),
            id: id.to_string(),
        }
    }

    pub fn untyped(id: &str) -> Self {
        Self {
            resource_type: None,
            id: id.to_string(),
        }
    }
}

pub trait IdentifierResolver: Send + Sync {
    /// Fails with [`SearchError::NotFound`] when no live resource has this id
    fn resolve(&self, scope: &RequestPartitionId, resource_type: &str, id: &str) -> Result<ResourcePid>;

    /// Resolve several ids; ids that do not exist are left out
    fn resolve_many(&self, scope: &RequestPartitionId, ids: &[TypedId]) -> Result<Vec<ResourcePid>>;
}

/// Whether an error only says "no such resource"
pub fn is_not_found(err: &StoreError) -> bool {
    matches!(err, StoreError::Search(e) if e.is_not_found())
}

/// Resolver reading `hfj_resource`
pub struct SqliteIdentifierResolver {
    conn: Mutex<Connection>,
}

impl SqliteIdentifierResolver {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Other("Identifier resolver connection poisoned".to_string()))
    }

    fn lookup(&self, scope: &RequestPartitionId, resource_type: Option<&str>, id: &str) -> Result<Vec<i64>> {
        let mut sql = String::from(
            "SELECT res_id FROM hfj_resource WHERE fhir_id = ?1 AND res_deleted_at IS NULL",
        );
        if resource_type.is_some() {
            sql.push_str(" AND res_type = ?2");
        }
        match scope {
            RequestPartitionId::AllPartitions => {}
            RequestPartitionId::Default => sql.push_str(" AND partition_id IS NULL"),
            RequestPartitionId::Partition(p) => sql.push_str(&format!(" AND partition_id = {p}")),
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&sql)?;
        let pids = match resource_type {
            Some(resource_type) => stmt
                .query_map(rusqlite::params![id, resource_type], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?,
            None => stmt
                .query_map(rusqlite::params![id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?,
        };
        Ok(pids)
    }

    /// Business id of a pid, for diagnostics
    pub fn fhir_id(&self, pid: ResourcePid) -> Result<Option<(String, String)>> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT res_type, fhir_id FROM hfj_resource WHERE res_id = ?1",
                [pid.id()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(found)
    }
}

impl IdentifierResolver for SqliteIdentifierResolver {
    fn resolve(&self, scope: &RequestPartitionId, resource_type: &str, id: &str) -> Result<ResourcePid> {
        self.lookup(scope, Some(resource_type), id)?
            .first()
            .map(|pid| ResourcePid(*pid))
            .ok_or_else(|| SearchError::not_found(resource_type, id).into())
    }

    fn resolve_many(&self, scope: &RequestPartitionId, ids: &[TypedId]) -> Result<Vec<ResourcePid>> {
        let mut pids = Vec::new();
        for typed in ids {
            let found = self.lookup(scope, typed.resource_type.as_deref(), &typed.id)?;
            if found.is_empty() {
                debug!(
                    "Reference target {}/{} not found",
                    typed.resource_type.as_deref().unwrap_or("*"),
                    typed.id
                );
            }
            for pid in found {
                let pid = ResourcePid(pid);
                if !pids.contains(&pid) {
                    pids.push(pid);
                }
            }
        }
        Ok(pids)
    }
}
