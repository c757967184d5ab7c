//! shirabe-explain - print the SQL, bind variables and pids of one search
//!
//! `shirabe-explain 'Patient?name=smith'` or `shirabe-explain Patient name=smith`.

use clap::Parser;
use shirabe_core::OperationOutcome;
use shirabe_explain::cli::Args;
use shirabe_explain::config::ExplainConfig;
use shirabe_explain::{explain, init_tracing, split_request};
use std::path::PathBuf;

fn main() {
    let args = Args::parse();
    let (resource_type, query) = split_request(&args.request, args.query.as_deref());

    // Load configuration
    let config_path = args.config.clone().or_else(|| {
        let fallback = PathBuf::from("config.yaml");
        fallback.exists().then_some(fallback)
    });
    let config = ExplainConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {e}");
        ExplainConfig::default()
    });

    init_tracing(&config.log);
    tracing::debug!("Using search index at {}", config.storage.db_path.display());

    match explain(&config, resource_type, query, args.partition()) {
        Ok(report) => print!("{report}"),
        Err(e) => {
            let error = e.into_search_error();
            let outcome = OperationOutcome::from_error(&error);
            match serde_json::to_string_pretty(&outcome) {
                Ok(json) => eprintln!("{json}"),
                Err(_) => eprintln!("{error}"),
            }
            std::process::exit(1);
        }
    }
}
