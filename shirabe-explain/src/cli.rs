//! Command line arguments

use clap::Parser;
use shirabe_core::RequestPartitionId;
use std::path::PathBuf;

/// Print the SQL, bind variables and pids of one search
#[derive(Parser, Debug)]
#[command(name = "shirabe-explain")]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file, `config.yaml` is used when present
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Partition to search, a numeric id or `default`
    #[arg(long, value_parser = parse_partition)]
    pub partition: Option<RequestPartitionId>,

    /// Resource type, optionally with the query attached (`Patient?name=smith`)
    pub request: String,

    /// Query string when not attached to the resource type
    pub query: Option<String>,
}

impl Args {
    pub fn partition(&self) -> RequestPartitionId {
        self.partition.clone().unwrap_or(RequestPartitionId::AllPartitions)
    }
}

pub fn parse_partition(raw: &str) -> Result<RequestPartitionId, String> {
    if raw == "default" {
        return Ok(RequestPartitionId::Default);
    }
    raw.parse()
        .map(RequestPartitionId::Partition)
        .map_err(|_| format!("expected a partition id or \"default\", got \"{raw}\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attached_query() {
        let args = Args::try_parse_from(["shirabe-explain", "Patient?name=smith"]).unwrap();
        assert_eq!(args.request, "Patient?name=smith");
        assert_eq!(args.query, None);
        assert_eq!(args.config, None);
        assert_eq!(args.partition(), RequestPartitionId::AllPartitions);
    }

    #[test]
    fn test_options_and_separate_query() {
        let args = Args::try_parse_from([
            "shirabe-explain",
            "--config",
            "explain.yaml",
            "--partition",
            "3",
            "Observation",
            "code=1234",
        ])
        .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("explain.yaml")));
        assert_eq!(args.partition(), RequestPartitionId::Partition(3));
        assert_eq!(args.request, "Observation");
        assert_eq!(args.query.as_deref(), Some("code=1234"));
    }

    #[test]
    fn test_default_partition() {
        assert_eq!(parse_partition("default"), Ok(RequestPartitionId::Default));
        assert!(parse_partition("north").is_err());
    }

    #[test]
    fn test_config_without_value_is_rejected() {
        assert!(Args::try_parse_from(["shirabe-explain", "Patient", "--config"]).is_err());
        assert!(Args::try_parse_from(["shirabe-explain", "--partition", "x", "Patient"]).is_err());
        assert!(Args::try_parse_from(["shirabe-explain"]).is_err());
    }
}
