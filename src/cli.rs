//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Harvest OAI-PMH repositories and search bibliographic databases.
#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(author, version, about)]
pub struct Cli {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: $XDG_CONFIG_HOME/harvester/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Database file, overriding `database_path` from the config
    #[arg(long, global = true, value_name = "PATH")]
    pub database: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage harvest sources
    #[command(subcommand)]
    Source(SourceCommand),

    /// Harvest one source now
    Harvest {
        /// Source id
        source_id: i64,
    },

    /// Show run logs for a source, newest first
    Logs(LogsArgs),

    /// Run the scheduler until interrupted
    Serve(ServeArgs),

    /// Search every enabled database
    Search(SearchArgs),

    /// List providers with active record counts
    Providers {
        /// Only sources of this institution
        #[arg(long)]
        institution: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum SourceCommand {
    /// Register a new source
    Add(SourceAddArgs),
    /// List registered sources
    List,
    /// Delete a source and cancel its schedule
    Remove {
        /// Source id
        source_id: i64,
    },
    /// Stop scheduled harvests of a source
    Pause {
        /// Source id
        source_id: i64,
    },
    /// Re-enable scheduled harvests of a source
    Resume {
        /// Source id
        source_id: i64,
    },
}

#[derive(Args, Debug)]
pub struct SourceAddArgs {
    /// Display name
    #[arg(long)]
    pub name: String,

    /// OAI-PMH base URL
    #[arg(long)]
    pub endpoint: String,

    /// Metadata prefix (oai_dc, marcxml, ...)
    #[arg(long, default_value = "oai_dc")]
    pub metadata_prefix: String,

    /// Restrict to one OAI-PMH set
    #[arg(long)]
    pub set: Option<String>,

    /// Accepted provider; repeat for several (default: all)
    #[arg(long = "provider", value_name = "PROVIDER")]
    pub providers: Vec<String>,

    /// Cron expression, 5 or 6 fields
    #[arg(long, default_value = "0 3 * * *")]
    pub schedule: String,

    /// Owning institution
    #[arg(long)]
    pub institution: Option<String>,
}

#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Source id
    pub source_id: i64,

    /// Page number (1-indexed)
    #[arg(long, default_value_t = 1)]
    pub page: u32,

    /// Rows per page (1-100)
    #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u32).range(1..=100))]
    pub limit: u32,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Seconds to wait for in-flight runs on shutdown
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(0..=3600))]
    pub grace_secs: u64,
}

#[derive(Args, Debug)]
pub struct SearchArgs {
    /// Search term
    pub term: String,

    /// Only these databases (local, crossref, openalex); repeat for several
    #[arg(long = "db", value_name = "ID")]
    pub databases: Vec<String>,

    /// Lower publication date bound (YYYY[-MM[-DD]])
    #[arg(long)]
    pub from: Option<String>,

    /// Upper publication date bound (YYYY[-MM[-DD]])
    #[arg(long)]
    pub until: Option<String>,

    /// Author name fragment; repeat for several
    #[arg(long = "author")]
    pub authors: Vec<String>,

    /// Journal title; repeat for several
    #[arg(long = "journal")]
    pub journals: Vec<String>,

    /// Page number (1-indexed)
    #[arg(long, default_value_t = 1)]
    pub page: u32,

    /// Results per page
    #[arg(long, default_value_t = 20)]
    pub limit: u32,

    /// Caller identity for per-database access lists
    #[arg(long)]
    pub user: Option<String>,

    /// Print the response as JSON
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let cli = Cli::try_parse_from(["harvester", "-vv", "source", "list"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(!cli.quiet);
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let cli =
            Cli::try_parse_from(["harvester", "providers", "-q", "--database", "x.db"]).unwrap();
        assert!(cli.quiet);
        assert_eq!(cli.database, Some(PathBuf::from("x.db")));
    }

    #[test]
    fn test_cli_source_add_defaults() {
        let cli = Cli::try_parse_from([
            "harvester",
            "source",
            "add",
            "--name",
            "Repo",
            "--endpoint",
            "https://example.org/oai",
            "--provider",
            "jstor",
            "--provider",
            "proquest",
        ])
        .unwrap();
        let Command::Source(SourceCommand::Add(args)) = cli.command else {
            panic!("expected source add");
        };
        assert_eq!(args.metadata_prefix, "oai_dc");
        assert_eq!(args.schedule, "0 3 * * *");
        assert_eq!(args.providers, vec!["jstor", "proquest"]);
    }

    #[test]
    fn test_cli_search_filters() {
        let cli = Cli::try_parse_from([
            "harvester", "search", "rivers", "--from", "2019", "--author", "Doe", "--db", "local",
            "--page", "2",
        ])
        .unwrap();
        let Command::Search(args) = cli.command else {
            panic!("expected search");
        };
        assert_eq!(args.term, "rivers");
        assert_eq!(args.from.as_deref(), Some("2019"));
        assert_eq!(args.authors, vec!["Doe"]);
        assert_eq!(args.databases, vec!["local"]);
        assert_eq!(args.page, 2);
    }

    #[test]
    fn test_cli_logs_limit_range() {
        assert!(Cli::try_parse_from(["harvester", "logs", "1", "--limit", "0"]).is_err());
        let cli = Cli::try_parse_from(["harvester", "logs", "1"]).unwrap();
        let Command::Logs(args) = cli.command else {
            panic!("expected logs");
        };
        assert_eq!(args.limit, 20);
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["harvester"]).is_err());
    }
}
