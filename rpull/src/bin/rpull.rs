use anyhow::Result;
use clap::Parser;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rpull",
    version,
    about = "Pull a batch of files from an FTP/FTPS server into local destination and backup directories",
    long_about = "`rpull` downloads files from a remote FTP or FTPS directory, verifies their size, deletes the
remote originals and copies each file into a destination and a backup directory.

EXAMPLE:
    # Run one batch described by a config file and print a summary
    rpull --config /etc/rpull/pull.json --summary

Note: remote files are deleted once downloaded and verified."
)]
struct Args {
    // Run options
    /// Path to the JSON run configuration
    #[arg(short = 'c', long, value_name = "PATH", help_heading = "Run options")]
    config: std::path::PathBuf,

    /// Override the number of parallel downloads
    #[arg(long, value_name = "N", help_heading = "Run options")]
    max_parallel: Option<usize>,

    /// Override the maximum number of files downloaded in one run
    #[arg(long, value_name = "N", help_heading = "Run options")]
    max_batch: Option<usize>,

    /// Override the file name suffix filter, e.g. ".csv"; an empty value disables filtering
    #[arg(long, value_name = "SUFFIX", help_heading = "Run options")]
    filter: Option<String>,

    /// Override the pause before and after each commit copy
    ///
    /// This option accepts a human readable duration, e.g. "0s", "500ms", "5s" etc.
    #[arg(long, value_name = "DELAY", value_parser = humantime::parse_duration, help_heading = "Run options")]
    commit_delay: Option<std::time::Duration>,

    // Security
    /// Accept any TLS certificate the server presents
    ///
    /// The connection is still encrypted but the server is not authenticated. A warning is
    /// logged on every connect.
    #[arg(long, help_heading = "Security")]
    tls_skip_verify: bool,

    // Progress & output
    /// Log file prefix; the current date and ".txt" are appended, e.g. pull_20240307.txt
    #[arg(long, value_name = "PATH", help_heading = "Progress & output")]
    log_file: Option<std::path::PathBuf>,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,
}

fn load_config(args: &Args) -> Result<common::RunConfig> {
    let mut config = common::RunConfig::load(&args.config)?;
    if let Some(max_parallel) = args.max_parallel {
        config.max_parallel_downloads = max_parallel;
    }
    if let Some(max_batch) = args.max_batch {
        config.max_batch_size = max_batch;
    }
    if let Some(filter) = &args.filter {
        config.name_filter = filter.clone();
    }
    if let Some(delay) = args.commit_delay {
        config.commit_delay = delay;
    }
    if args.tls_skip_verify {
        config.tls_skip_verify = true;
    }
    if let Some(log_file) = &args.log_file {
        config.log_file = Some(log_file.clone());
    }
    config.validate()?;
    Ok(config)
}

#[instrument(skip_all)]
async fn async_main(config: common::RunConfig) -> Result<common::Summary> {
    tracing::debug!("{:?}", &config);
    rpull::run(config).await
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(error) => {
            if !args.quiet {
                eprintln!("{error:#}");
            }
            std::process::exit(1);
        }
    };
    let title = config.title.as_deref().unwrap_or_default();
    if !args.quiet && !title.is_empty() {
        println!("{title}");
    }
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let tracing = common::TracingConfig {
        log_file: config.log_target().map(std::path::Path::to_path_buf),
    };
    let func = || async_main(config);
    match common::run(output, runtime, tracing, func) {
        Some(summary) if summary.failures() == 0 => Ok(()),
        Some(summary) => {
            if !args.quiet {
                eprintln!("rpull encountered {} error(s)", summary.failures());
            }
            std::process::exit(1);
        }
        None => std::process::exit(1),
    }
}
