//! lms-dl command-line interface

use clap::{Parser, Subcommand};
use lms_dl::{
    Config, DataSource, Downloader, HttpDataSource, Lister, Login, Node, ProgressEvent, Report,
    Reuse, RetryPolicy, SilentReport, Vfs,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lms-dl", about = "Course platform data download tool", version)]
struct Cli {
    /// Configuration profile to use
    #[arg(short, long, global = true, default_value = "default")]
    profile: String,

    /// Message level to log (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Shorthand for --log-level info
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Call the platform API directly
    Api {
        /// Query fields in name=value form
        fields: Vec<String>,
    },
    /// Print file contents
    Cat {
        /// Files to print
        paths: Vec<String>,
    },
    /// Download files
    Get {
        /// Number of automatic retries
        #[arg(short = 't', long, default_value_t = 3)]
        retry: u32,
        /// Do not draw progress lines
        #[arg(short = 's', long)]
        no_progress: bool,
        /// Paths to download (defaults to the whole tree)
        paths: Vec<String>,
    },
    /// List downloadable files
    Ls {
        /// Show kind details and link targets
        #[arg(short, long)]
        long: bool,
        /// Descend into subdirectories
        #[arg(short, long)]
        recursive: bool,
        /// Directories to list
        paths: Vec<String>,
    },
    /// Acquire a platform session through a login helper
    Login {
        /// Do not write the acquired session to the profile
        #[arg(short = 'n', long)]
        dry_run: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);
    let ok = match run(cli) {
        Ok(ok) => ok,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            false
        }
    };
    std::process::exit(if ok { 0 } else { 1 });
}

fn init_logging(cli: &Cli) {
    let level = if cli.verbose && cli.log_level == "warn" {
        "info"
    } else {
        cli.log_level.as_str()
    };
    let filter = EnvFilter::try_from_env("LMS_DL_LOG").unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> lms_dl::Result<bool> {
    let mut config = Config::load(&cli.profile)?;
    match cli.command {
        Command::Api { fields } => run_api(&config, &fields),
        Command::Cat { paths } => run_cat(config, &paths),
        Command::Get {
            retry,
            no_progress,
            paths,
        } => run_get(config, retry, no_progress, paths),
        Command::Ls {
            long,
            recursive,
            paths,
        } => run_ls(config, long, recursive, paths),
        Command::Login { dry_run } => Login::new(&mut config, &cli.profile, !dry_run).run(),
    }
}

fn build_source(config: &Config) -> lms_dl::Result<Rc<RefCell<HttpDataSource>>> {
    Ok(Rc::new(RefCell::new(HttpDataSource::new(
        &config.endpoints,
        &config.api_cookies,
        &config.web_cookies,
    )?)))
}

fn build_vfs(config: Config) -> lms_dl::Result<Vfs> {
    let source = build_source(&config)?;
    Vfs::new(source, config.labels, config.edit)
}

fn run_api(config: &Config, fields: &[String]) -> lms_dl::Result<bool> {
    let source = build_source(config)?;
    let fields: Vec<(String, String)> = fields
        .iter()
        .map(|field| match field.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (field.clone(), String::new()),
        })
        .collect();
    match source.borrow_mut().api(&fields, Reuse::Fresh) {
        Ok(Some(value)) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(true)
        }
        Ok(None) => Ok(true),
        Err(e) => {
            tracing::error!(error = %e, "API request failed");
            Ok(false)
        }
    }
}

fn run_cat(config: Config, paths: &[String]) -> lms_dl::Result<bool> {
    if paths.is_empty() {
        return Ok(true);
    }
    let vfs = build_vfs(config)?;
    let stdout = std::io::stdout();
    let mut failed = false;
    for path in paths {
        let mut progress = ConsoleProgress::new();
        let result = vfs.open(path).and_then(|node| {
            let mut out = stdout.lock();
            Node::read(&node, &mut out, &mut |event| progress.update(path, event))
        });
        progress.end_line();
        if let Err(e) = result {
            failed = true;
            tracing::error!(path, error = %e, "cat failed");
        }
    }
    Ok(!failed)
}

fn run_get(
    config: Config,
    retry: u32,
    no_progress: bool,
    mut paths: Vec<String>,
) -> lms_dl::Result<bool> {
    if paths.is_empty() {
        paths.push("/".to_string());
    }
    let vfs = build_vfs(config)?;
    let downloader = Downloader::new(&vfs, RetryPolicy::from_retry_count(retry));
    let ok = if no_progress {
        downloader.run_all(&paths, &mut SilentReport)
    } else {
        downloader.run_all(&paths, &mut ConsoleReport::new())
    };
    Ok(ok)
}

fn run_ls(config: Config, long: bool, recursive: bool, mut paths: Vec<String>) -> lms_dl::Result<bool> {
    if paths.is_empty() {
        paths.push("/".to_string());
    }
    let vfs = build_vfs(config)?;
    let lister = Lister::new(&vfs, long, recursive);
    let stdout = std::io::stdout();
    let mut failed = false;
    for path in &paths {
        if let Err(e) = lister.run(&mut stdout.lock(), path) {
            failed = true;
            tracing::error!(path, error = %e, "ls failed");
        }
    }
    Ok(!failed)
}

/// Carriage-return progress lines on stderr, throttled to 10 updates a
/// second.
struct ConsoleProgress {
    last_update: Option<Instant>,
    active: bool,
}

impl ConsoleProgress {
    fn new() -> Self {
        ConsoleProgress {
            last_update: None,
            active: false,
        }
    }

    fn update(&mut self, path: &str, event: ProgressEvent) {
        match event {
            ProgressEvent::Begin => {
                self.active = true;
                eprint!("\r{path}: 0%");
            }
            ProgressEvent::Transfer { total, done } => {
                let now = Instant::now();
                let complete = total == Some(done);
                if !complete
                    && let Some(last) = self.last_update
                    && now.duration_since(last) < Duration::from_millis(100)
                {
                    return;
                }
                self.last_update = Some(now);
                self.active = true;
                match total {
                    Some(total) if total > 0 => eprint!(
                        "\r{path}: {}% ({:.2}/{:.2} MiB)",
                        done * 100 / total,
                        mib(done),
                        mib(total)
                    ),
                    _ => eprint!("\r{path}: {:.2} MiB", mib(done)),
                }
            }
            ProgressEvent::End => {
                if self.active {
                    eprint!("\r{path}: 100%");
                }
            }
        }
    }

    fn end_line(&mut self) {
        if self.active {
            eprintln!();
            self.active = false;
            self.last_update = None;
        }
    }
}

fn mib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

struct ConsoleReport {
    progress: ConsoleProgress,
}

impl ConsoleReport {
    fn new() -> Self {
        ConsoleReport {
            progress: ConsoleProgress::new(),
        }
    }
}

impl Report for ConsoleReport {
    fn progress(&mut self, path: &str, event: ProgressEvent) {
        self.progress.update(path, event);
    }

    fn finished(&mut self, _path: &str) {
        self.progress.end_line();
    }
}
