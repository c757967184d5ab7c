//! Index database schema and the writer that fills it.
//!
//! The writer computes hashes and normalized values with exactly the
//! functions the predicate builders use, so anything written here can be
//! found by a search.

use std::path::Path;

use rusqlite::{params, Connection};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use shirabe_core::{DateRange, PartitionSettings, RequestPartitionId, ResourcePid, SearchError};
use tracing::debug;

use crate::error::Result;
use crate::hash::{hash_identity, hash_presence, hash_search_param, norm_prefix, normalize_string, truncate};

/// Tables keyed by `res_id` that hold per-resource index rows
const INDEX_TABLES: [&str; 10] = [
    "hfj_spidx_string",
    "hfj_spidx_token",
    "hfj_spidx_number",
    "hfj_spidx_quantity",
    "hfj_spidx_date",
    "hfj_spidx_uri",
    "hfj_spidx_coords",
    "hfj_res_tag",
    "hfj_res_param_present",
    "hfj_idx_cmp_string_uniq",
];

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS hfj_resource (
    res_id INTEGER PRIMARY KEY AUTOINCREMENT,
    partition_id INTEGER,
    res_type TEXT NOT NULL,
    fhir_id TEXT NOT NULL,
    res_updated INTEGER NOT NULL,
    res_deleted_at INTEGER,
    res_language TEXT
);
CREATE INDEX IF NOT EXISTS idx_resource_type_id ON hfj_resource(res_type, fhir_id);

CREATE TABLE IF NOT EXISTS hfj_spidx_string (
    res_id INTEGER NOT NULL,
    partition_id INTEGER,
    hash_identity INTEGER NOT NULL,
    hash_norm_prefix INTEGER NOT NULL,
    hash_exact INTEGER NOT NULL,
    sp_value_normalized TEXT NOT NULL,
    sp_value_exact TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sp_string_prefix ON hfj_spidx_string(hash_norm_prefix, sp_value_normalized);
CREATE INDEX IF NOT EXISTS idx_sp_string_exact ON hfj_spidx_string(hash_exact);

CREATE TABLE IF NOT EXISTS hfj_spidx_token (
    res_id INTEGER NOT NULL,
    partition_id INTEGER,
    hash_identity INTEGER NOT NULL,
    hash_sys INTEGER NOT NULL,
    hash_sys_and_value INTEGER NOT NULL,
    hash_value INTEGER NOT NULL,
    sp_system TEXT,
    sp_value TEXT
);
CREATE INDEX IF NOT EXISTS idx_sp_token_value ON hfj_spidx_token(hash_value);
CREATE INDEX IF NOT EXISTS idx_sp_token_sys_value ON hfj_spidx_token(hash_sys_and_value);

CREATE TABLE IF NOT EXISTS hfj_spidx_number (
    res_id INTEGER NOT NULL,
    partition_id INTEGER,
    hash_identity INTEGER NOT NULL,
    sp_value REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS hfj_spidx_quantity (
    res_id INTEGER NOT NULL,
    partition_id INTEGER,
    hash_identity INTEGER NOT NULL,
    hash_identity_and_units INTEGER NOT NULL,
    hash_identity_sys_units INTEGER NOT NULL,
    sp_value REAL NOT NULL,
    sp_system TEXT,
    sp_units TEXT
);

CREATE TABLE IF NOT EXISTS hfj_spidx_date (
    res_id INTEGER NOT NULL,
    partition_id INTEGER,
    hash_identity INTEGER NOT NULL,
    sp_value_low INTEGER NOT NULL,
    sp_value_high INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sp_date ON hfj_spidx_date(hash_identity, sp_value_low, sp_value_high);

CREATE TABLE IF NOT EXISTS hfj_spidx_uri (
    res_id INTEGER NOT NULL,
    partition_id INTEGER,
    hash_identity INTEGER NOT NULL,
    hash_uri INTEGER NOT NULL,
    sp_uri TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS hfj_spidx_coords (
    res_id INTEGER NOT NULL,
    partition_id INTEGER,
    hash_identity INTEGER NOT NULL,
    sp_latitude REAL NOT NULL,
    sp_longitude REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS hfj_res_link (
    pid INTEGER PRIMARY KEY AUTOINCREMENT,
    partition_id INTEGER,
    src_resource_id INTEGER NOT NULL,
    source_resource_type TEXT NOT NULL,
    src_path TEXT NOT NULL,
    target_resource_id INTEGER,
    target_resource_type TEXT,
    target_resource_url TEXT,
    sp_updated INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_link_src ON hfj_res_link(src_resource_id, src_path);
CREATE INDEX IF NOT EXISTS idx_link_target ON hfj_res_link(target_resource_id, src_path);

CREATE TABLE IF NOT EXISTS hfj_res_tag (
    res_id INTEGER NOT NULL,
    partition_id INTEGER,
    tag_type INTEGER NOT NULL,
    tag_system TEXT,
    tag_code TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS hfj_res_ver_prov (
    res_pid INTEGER NOT NULL,
    partition_id INTEGER,
    source_uri TEXT,
    request_id TEXT
);

CREATE TABLE IF NOT EXISTS hfj_res_param_present (
    res_id INTEGER NOT NULL,
    partition_id INTEGER,
    hash_presence INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS hfj_idx_cmp_string_uniq (
    res_id INTEGER NOT NULL,
    partition_id INTEGER,
    idx_string TEXT NOT NULL UNIQUE
);
";

/// Create all index tables (idempotent)
pub fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Meta tag kinds stored in `hfj_res_tag.tag_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagType {
    Tag = 0,
    Profile = 1,
    SecurityLabel = 2,
}

/// Target of an outgoing reference
#[derive(Debug, Clone, PartialEq)]
pub enum LinkTarget {
    Local(IndexedResource),
    Url(String),
}

/// A resource row written by [`IndexWriter::create_resource`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedResource {
    pub pid: ResourcePid,
    pub resource_type: String,
    pub fhir_id: String,
    pub partition_id: Option<i32>,
}

/// Writes resource, index, link and meta rows
pub struct IndexWriter {
    conn: Connection,
    partitioning: PartitionSettings,
}

#[allow(clippy::result_large_err)]
impl IndexWriter {
    /// Open (or create) the index database
    pub fn open(path: impl AsRef<Path>, partitioning: PartitionSettings) -> Result<Self> {
        let conn = Connection::open(path)?;
        // Enable WAL mode so cursors can read while the writer is open
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        create_schema(&conn)?;
        Ok(Self { conn, partitioning })
    }

    fn hash_partition(&self, resource: &IndexedResource) -> Option<i32> {
        let scope = match resource.partition_id {
            Some(id) => RequestPartitionId::Partition(id),
            None => RequestPartitionId::Default,
        };
        self.partitioning.hash_partition(&scope)
    }

    pub fn create_resource(
        &self,
        resource_type: &str,
        fhir_id: &str,
        partition_id: Option<i32>,
        updated_ms: i64,
    ) -> Result<IndexedResource> {
        self.conn.execute(
            "INSERT INTO hfj_resource (partition_id, res_type, fhir_id, res_updated) VALUES (?1, ?2, ?3, ?4)",
            params![partition_id, resource_type, fhir_id, updated_ms],
        )?;
        let pid = ResourcePid(self.conn.last_insert_rowid());
        debug!("Indexed {}/{} as pid {}", resource_type, fhir_id, pid);
        Ok(IndexedResource {
            pid,
            resource_type: resource_type.to_string(),
            fhir_id: fhir_id.to_string(),
            partition_id,
        })
    }

    /// Mark a resource deleted and drop every index row it owns
    pub fn delete_resource(&self, resource: &IndexedResource, deleted_ms: i64) -> Result<()> {
        let pid = resource.pid.id();
        self.conn.execute(
            "UPDATE hfj_resource SET res_deleted_at = ?1 WHERE res_id = ?2",
            params![deleted_ms, pid],
        )?;
        for table in INDEX_TABLES {
            self.conn
                .execute(&format!("DELETE FROM {table} WHERE res_id = ?1"), params![pid])?;
        }
        self.conn
            .execute("DELETE FROM hfj_res_link WHERE src_resource_id = ?1", params![pid])?;
        self.conn
            .execute("DELETE FROM hfj_res_ver_prov WHERE res_pid = ?1", params![pid])?;
        Ok(())
    }

    pub fn set_language(&self, resource: &IndexedResource, language: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE hfj_resource SET res_language = ?1 WHERE res_id = ?2",
            params![language, resource.pid.id()],
        )?;
        Ok(())
    }

    pub fn add_string(&self, resource: &IndexedResource, param: &str, value: &str) -> Result<()> {
        let partition = self.hash_partition(resource);
        let rt = resource.resource_type.as_str();
        let normalized = normalize_string(value);
        let exact = truncate(value);
        self.conn.execute(
            "INSERT INTO hfj_spidx_string (res_id, partition_id, hash_identity, hash_norm_prefix, hash_exact, sp_value_normalized, sp_value_exact)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                resource.pid.id(),
                resource.partition_id,
                hash_identity(partition, rt, param),
                hash_search_param(partition, rt, param, &[&norm_prefix(&normalized)]),
                hash_search_param(partition, rt, param, &[&exact]),
                normalized,
                exact,
            ],
        )?;
        Ok(())
    }

    /// A token; `None` system is stored as the empty system
    pub fn add_token(&self, resource: &IndexedResource, param: &str, system: Option<&str>, value: &str) -> Result<()> {
        let partition = self.hash_partition(resource);
        let rt = resource.resource_type.as_str();
        let system = system.unwrap_or_default();
        self.conn.execute(
            "INSERT INTO hfj_spidx_token (res_id, partition_id, hash_identity, hash_sys, hash_sys_and_value, hash_value, sp_system, sp_value)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                resource.pid.id(),
                resource.partition_id,
                hash_identity(partition, rt, param),
                hash_search_param(partition, rt, param, &[system]),
                hash_search_param(partition, rt, param, &[system, value]),
                hash_search_param(partition, rt, param, &[value]),
                system,
                value,
            ],
        )?;
        Ok(())
    }

    pub fn add_number(&self, resource: &IndexedResource, param: &str, value: Decimal) -> Result<()> {
        let partition = self.hash_partition(resource);
        self.conn.execute(
            "INSERT INTO hfj_spidx_number (res_id, partition_id, hash_identity, sp_value) VALUES (?1, ?2, ?3, ?4)",
            params![
                resource.pid.id(),
                resource.partition_id,
                hash_identity(partition, &resource.resource_type, param),
                to_f64(value)?,
            ],
        )?;
        Ok(())
    }

    pub fn add_quantity(
        &self,
        resource: &IndexedResource,
        param: &str,
        value: Decimal,
        system: Option<&str>,
        units: Option<&str>,
    ) -> Result<()> {
        let partition = self.hash_partition(resource);
        let rt = resource.resource_type.as_str();
        let units_value = units.unwrap_or_default();
        self.conn.execute(
            "INSERT INTO hfj_spidx_quantity (res_id, partition_id, hash_identity, hash_identity_and_units, hash_identity_sys_units, sp_value, sp_system, sp_units)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                resource.pid.id(),
                resource.partition_id,
                hash_identity(partition, rt, param),
                hash_search_param(partition, rt, param, &[units_value]),
                hash_search_param(partition, rt, param, &[system.unwrap_or_default(), units_value]),
                to_f64(value)?,
                system,
                units,
            ],
        )?;
        Ok(())
    }

    /// A date or period; the stored range spans the precision of `value`
    pub fn add_date(&self, resource: &IndexedResource, param: &str, value: &str) -> Result<()> {
        let range = DateRange::parse(value)?;
        self.add_date_range(resource, param, range.low, range.high)
    }

    pub fn add_date_range(&self, resource: &IndexedResource, param: &str, low: i64, high: i64) -> Result<()> {
        let partition = self.hash_partition(resource);
        self.conn.execute(
            "INSERT INTO hfj_spidx_date (res_id, partition_id, hash_identity, sp_value_low, sp_value_high) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                resource.pid.id(),
                resource.partition_id,
                hash_identity(partition, &resource.resource_type, param),
                low,
                high,
            ],
        )?;
        Ok(())
    }

    pub fn add_uri(&self, resource: &IndexedResource, param: &str, uri: &str) -> Result<()> {
        let partition = self.hash_partition(resource);
        let rt = resource.resource_type.as_str();
        self.conn.execute(
            "INSERT INTO hfj_spidx_uri (res_id, partition_id, hash_identity, hash_uri, sp_uri) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                resource.pid.id(),
                resource.partition_id,
                hash_identity(partition, rt, param),
                hash_search_param(partition, rt, param, &[uri]),
                uri,
            ],
        )?;
        Ok(())
    }

    pub fn add_coords(&self, resource: &IndexedResource, param: &str, latitude: f64, longitude: f64) -> Result<()> {
        let partition = self.hash_partition(resource);
        self.conn.execute(
            "INSERT INTO hfj_spidx_coords (res_id, partition_id, hash_identity, sp_latitude, sp_longitude) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                resource.pid.id(),
                resource.partition_id,
                hash_identity(partition, &resource.resource_type, param),
                latitude,
                longitude,
            ],
        )?;
        Ok(())
    }

    /// An outgoing reference found at `path` (`Observation.subject`)
    pub fn add_link(&self, resource: &IndexedResource, path: &str, target: &LinkTarget, updated_ms: i64) -> Result<()> {
        let (target_id, target_type, target_url) = match target {
            LinkTarget::Local(t) => (Some(t.pid.id()), Some(t.resource_type.as_str()), None),
            LinkTarget::Url(url) => (None, None, Some(url.as_str())),
        };
        self.conn.execute(
            "INSERT INTO hfj_res_link (partition_id, src_resource_id, source_resource_type, src_path, target_resource_id, target_resource_type, target_resource_url, sp_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                resource.partition_id,
                resource.pid.id(),
                resource.resource_type,
                path,
                target_id,
                target_type,
                target_url,
                updated_ms,
            ],
        )?;
        Ok(())
    }

    pub fn add_tag(&self, resource: &IndexedResource, tag_type: TagType, system: Option<&str>, code: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO hfj_res_tag (res_id, partition_id, tag_type, tag_system, tag_code) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![resource.pid.id(), resource.partition_id, tag_type as i32, system, code],
        )?;
        Ok(())
    }

    pub fn add_source(&self, resource: &IndexedResource, source_uri: Option<&str>, request_id: Option<&str>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO hfj_res_ver_prov (res_pid, partition_id, source_uri, request_id) VALUES (?1, ?2, ?3, ?4)",
            params![resource.pid.id(), resource.partition_id, source_uri, request_id],
        )?;
        Ok(())
    }

    /// Record whether a reference parameter has any value
    pub fn add_param_present(&self, resource: &IndexedResource, param: &str, present: bool) -> Result<()> {
        let partition = self.hash_partition(resource);
        self.conn.execute(
            "INSERT INTO hfj_res_param_present (res_id, partition_id, hash_presence) VALUES (?1, ?2, ?3)",
            params![
                resource.pid.id(),
                resource.partition_id,
                hash_presence(partition, &resource.resource_type, param, present),
            ],
        )?;
        Ok(())
    }

    /// See [`crate::query_stack::combo_unique_index_string`] for the format of `index_string`
    pub fn add_combo_unique(&self, resource: &IndexedResource, index_string: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO hfj_idx_cmp_string_uniq (res_id, partition_id, idx_string) VALUES (?1, ?2, ?3)",
            params![resource.pid.id(), resource.partition_id, index_string],
        )?;
        Ok(())
    }
}

fn to_f64(value: Decimal) -> Result<f64> {
    value
        .to_f64()
        .ok_or_else(|| SearchError::internal(format!("Decimal {value} is not representable")).into())
}
