//! shirabe-explain - show the SQL a search turns into, and what it finds

pub mod cli;
pub mod config;

use std::fmt;
use std::sync::Arc;

use shirabe_core::{InMemorySearchParamRegistry, RequestPartitionId, ResourcePid, SearchParameterMap};
use shirabe_store::{
    GeneratedSql, IndexWriter, RecordingInterceptor, SearchBuilder, SearchContext, SqliteIdentifierResolver,
    SqliteRowExecutor, StoreError,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{ExplainConfig, LogFormat, LogSettings};

/// Everything one search run produced
#[derive(Debug, Clone, Default)]
pub struct ExplainReport {
    pub resource_type: String,
    /// Primary statements, as generated before execution
    pub statements: Vec<GeneratedSql>,
    /// Every statement actually executed, includes rounds among them
    pub executed: Vec<String>,
    pub pids: Vec<ResourcePid>,
    pub skipped: usize,
}

impl fmt::Display for ExplainReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, statement) in self.statements.iter().enumerate() {
            writeln!(f, "-- query {} for {}", i + 1, self.resource_type)?;
            if statement.match_nothing {
                writeln!(f, "-- (matches nothing, not executed)")?;
            }
            writeln!(f, "{}", statement.sql)?;
            for (n, value) in statement.bind_variables.iter().enumerate() {
                writeln!(f, "--   ?{} = {}", n + 1, value)?;
            }
        }
        writeln!(f, "-- {} statement(s) executed", self.executed.len())?;
        let pids: Vec<String> = self.pids.iter().map(|pid| pid.0.to_string()).collect();
        writeln!(f, "-- {} pid(s): [{}]", self.pids.len(), pids.join(", "))?;
        if self.skipped > 0 {
            writeln!(f, "-- {} duplicate row(s) skipped", self.skipped)?;
        }
        Ok(())
    }
}

/// Initialise the global subscriber; `RUST_LOG` wins over the configured level
pub fn init_tracing(log: &LogSettings) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log.level));
    let registry = tracing_subscriber::registry().with(filter);
    match log.format {
        LogFormat::Plain => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

/// Split `Patient?name=x` or a separate type and query into both parts
pub fn split_request<'a>(first: &'a str, rest: Option<&'a str>) -> (&'a str, &'a str) {
    match rest {
        Some(query) => (first.trim_matches('/'), query.trim_start_matches('?')),
        None => match first.split_once('?') {
            Some((resource_type, query)) => (resource_type.trim_matches('/'), query),
            None => (first.trim_matches('/'), ""),
        },
    }
}

/// Parse `query`, run it against the configured database and collect the results
pub fn explain(
    config: &ExplainConfig,
    resource_type: &str,
    query: &str,
    partition: RequestPartitionId,
) -> Result<ExplainReport, StoreError> {
    let registry = Arc::new(InMemorySearchParamRegistry::new());
    let params = SearchParameterMap::parse(resource_type, query, registry.as_ref())?;

    let db_path = &config.storage.db_path;
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::Other(format!("{}: {}", parent.display(), e)))?;
    }
    // Creates the schema on a fresh file
    drop(IndexWriter::open(db_path, config.search.partitioning.clone())?);

    let recorder = Arc::new(RecordingInterceptor::new());
    let ctx = SearchContext::new(
        config.search.clone(),
        registry,
        Arc::new(SqliteIdentifierResolver::open(db_path)?),
        Arc::new(SqliteRowExecutor::new(db_path)),
    )
    .with_interceptor(recorder.clone());

    let mut builder = SearchBuilder::new(&ctx, resource_type, partition);
    let limit = params.count.unwrap_or(config.search.fetch_size_default_maximum);
    let statements = builder.create_query(&params, Some(limit))?;
    // Statements generated above are reported, not executed
    let before = recorder.raw_sql_statements().len();

    let mut iterator = builder.search(params);
    let mut pids = Vec::new();
    while iterator.has_next()? {
        pids.push(iterator.next()?);
    }
    let skipped = iterator.skipped_count();
    iterator.close();
    drop(iterator);

    let executed = recorder.raw_sql_statements().split_off(before);
    tracing::info!("{} search found {} pid(s)", resource_type, pids.len());

    Ok(ExplainReport {
        resource_type: resource_type.to_string(),
        statements,
        executed,
        pids,
        skipped,
    })
}
