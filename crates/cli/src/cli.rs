use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use config::Backend;
use std::path::{Path, PathBuf};

/// memwatch: watch memory regions for mutations
///
/// memwatch write-protects registered memory and logs every write as a JSON
/// line carrying the changed bytes, the writing thread and code location.
#[derive(Debug, Parser, Clone)]
#[command(about, long_about, version)]
pub struct Cli {
    /// Path to configuration file.
    ///
    /// If not provided, the default locations are checked. They are
    /// `/etc/memwatch/config.toml` and `/etc/memwatch/config.d/*.toml`,
    /// where the latter being a glob pattern. If they don't exist, the default
    /// configuration is used. `MEMWATCH_`-prefixed environment variables
    /// override an explicitly given file.
    #[arg(short, long, global = true, value_parser = validate_file)]
    pub conffile: Option<PathBuf>,

    #[command(flatten)]
    pub verbosity: Verbosity<WarnLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a demo workload of counters under the watcher.
    Watch(WatchArgs),

    /// Summarize an event log as JSON.
    Summarize {
        /// The `events.jsonl` file to read.
        #[arg(value_parser = validate_file)]
        log: PathBuf,
    },
}

#[derive(Debug, Args, Clone)]
pub struct WatchArgs {
    /// Number of one-page counter regions.
    #[arg(long, default_value_t = 1, value_parser = validate_regions)]
    pub regions: usize,

    /// Increments per region. Runs until interrupted when omitted.
    #[arg(long)]
    pub iterations: Option<u64>,

    /// Pause between increments. **Measured in milliseconds**.
    #[arg(long, default_value_t = 100)]
    pub interval: u64,

    /// Interception backend; overrides the configuration.
    #[arg(long, value_enum)]
    pub backend: Option<BackendArg>,

    /// Shell command used as an event filter. It receives one JSON record
    /// per line on stdin and answers one JSON action per line on stdout.
    #[arg(long)]
    pub filter_cmd: Option<String>,

    /// Log a one-line summary of every mutation at info level.
    #[arg(long, conflicts_with = "filter_cmd")]
    pub log_events: bool,

    /// Directory receiving the event log; overrides the configuration.
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    Manual,
    Userfaultfd,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Manual => Backend::Manual,
            BackendArg::Userfaultfd => Backend::Userfaultfd,
        }
    }
}

/// Check if the file exists.
#[inline(always)]
fn validate_file(file: &str) -> Result<PathBuf, String> {
    let path = Path::new(file);
    if path.exists() {
        Ok(path.to_owned())
    } else {
        Err(format!("File not found: {:?}", path))
    }
}

/// Validate the number of demo regions
#[inline(always)]
fn validate_regions(regions: &str) -> Result<usize, String> {
    let regions: usize = regions
        .parse()
        .map_err(|_| format!("`{regions}` is not a valid region count"))?;
    if (1..=1024).contains(&regions) {
        Ok(regions)
    } else {
        Err("Region count must be between 1 and 1024".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn region_candidates() -> impl Strategy<Value = String> {
        prop_oneof![
            2 => (0..2000).prop_map(|i| format!("{}", i)),
            1 => (-1000..0).prop_map(|i| format!("{}", i)),
            1 => ".*",
        ]
    }

    proptest! {
        #[test]
        fn test_validate_regions(regions in region_candidates()) {
            match validate_regions(&regions) {
                Ok(n) => prop_assert!((1..=1024).contains(&n)),
                Err(err) => {
                    let error_msg = format!("`{}` is not a valid region count", regions);
                    prop_assert!(
                        err == error_msg || err == "Region count must be between 1 and 1024"
                    );
                },
            }
        }
    }

    #[test]
    fn parses_watch_flags() {
        let cli = Cli::parse_from([
            "memwatch",
            "watch",
            "--regions",
            "4",
            "--iterations",
            "10",
            "--backend",
            "manual",
            "-o",
            "/tmp/out",
        ]);
        let Command::Watch(args) = cli.command else {
            panic!("expected watch");
        };
        assert_eq!(args.regions, 4);
        assert_eq!(args.iterations, Some(10));
        assert_eq!(args.interval, 100);
        assert_eq!(args.backend.map(Backend::from), Some(Backend::Manual));
        assert_eq!(args.output, Some(PathBuf::from("/tmp/out")));
    }
}
