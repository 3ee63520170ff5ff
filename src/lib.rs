// src/lib.rs

pub mod dispatcher {
use clap::Parser;
use glob::{glob, Pattern};
use log::{info, warn, LevelFilter};
use serde::{Deserialize, Serialize};
use simplelog::{ConfigBuilder, WriteLogger};
use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus},
    str::FromStr,
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;

/// Parser binary used when nothing else is configured.
pub const DEFAULT_PARSER_PATH: &str = "/home/beams/RWOODS/Germanium/GSD_Scripts/gsd_parse.out_64";
/// Raw data directory used when nothing else is configured.
pub const DEFAULT_INPUT_DIR: &str =
    "/local/home/dplocal/mounts/nickel/1BM_Testing/Data/6bm_gsd64-Dec2016";
pub const DEFAULT_PATTERN: &str = "*.dat";
pub const DEFAULT_SUFFIX: &str = ".dat";

const SCHEMA_VERSION: &str = "1.0";
const POLL_INTERVAL: Duration = Duration::from_millis(50);

// -------------- Error type --------------

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Failed to launch {program}: {source}")]
    Launch { program: String, source: io::Error },

    #[error("Report error: {0}")]
    Report(String),

    #[error("Logger error: {0}")]
    Logger(String),
}

// -------------- Work items --------------

/// One input file paired with the output path handed to the parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkItem {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
}

impl WorkItem {
    pub fn new(input_path: PathBuf, suffix: &str) -> Self {
        let output_path = derive_output_path(&input_path, suffix);
        WorkItem {
            input_path,
            output_path,
        }
    }

    /// True when the parser would be told to write over its own input.
    pub fn collides(&self) -> bool {
        self.input_path == self.output_path
    }
}

/// Strips every trailing `suffix` from `input_path`, or returns it unchanged.
pub fn derive_output(input_path: &str, suffix: &str) -> String {
    let mut out = input_path;
    if !suffix.is_empty() {
        while let Some(rest) = out.strip_suffix(suffix) {
            out = rest;
        }
    }
    out.to_string()
}

/// Same rule as [`derive_output`], applied to the raw bytes of the path.
#[cfg(unix)]
pub fn derive_output_path(input_path: &Path, suffix: &str) -> PathBuf {
    use std::{ffi::OsStr, os::unix::ffi::OsStrExt};

    let mut out = input_path.as_os_str().as_bytes();
    if !suffix.is_empty() {
        while let Some(rest) = out.strip_suffix(suffix.as_bytes()) {
            out = rest;
        }
    }
    PathBuf::from(OsStr::from_bytes(out))
}

#[cfg(not(unix))]
pub fn derive_output_path(input_path: &Path, suffix: &str) -> PathBuf {
    // non UTF-8 paths keep their name and end up skipped as collisions
    match input_path.to_str() {
        Some(s) => PathBuf::from(derive_output(s, suffix)),
        None => input_path.to_path_buf(),
    }
}

// -------------- Outcomes and report --------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    /// `code` is `None` when the child was terminated by a signal.
    Failed { code: Option<i32> },
    TimedOut { after_ms: u64 },
    Skipped { reason: String },
}

impl Outcome {
    pub fn is_problem(&self) -> bool {
        matches!(self, Outcome::Failed { .. } | Outcome::TimedOut { .. })
    }
}

impl From<ExitStatus> for Outcome {
    fn from(status: ExitStatus) -> Self {
        if status.success() {
            Outcome::Succeeded
        } else {
            Outcome::Failed {
                code: status.code(),
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemResult {
    #[serde(flatten)]
    pub item: WorkItem,
    pub outcome: Outcome,
}

#[derive(Debug, Default, Serialize)]
pub struct BatchReport {
    succeeded: usize,
    failed: usize,
    timed_out: usize,
    skipped: usize,
    results: Vec<ItemResult>,
}

impl BatchReport {
    pub fn record(&mut self, item: WorkItem, outcome: Outcome) {
        match outcome {
            Outcome::Succeeded => self.succeeded += 1,
            Outcome::Failed { .. } => self.failed += 1,
            Outcome::TimedOut { .. } => self.timed_out += 1,
            Outcome::Skipped { .. } => self.skipped += 1,
        }
        self.results.push(ItemResult { item, outcome });
    }

    pub fn results(&self) -> &[ItemResult] {
        &self.results
    }

    pub fn succeeded(&self) -> usize {
        self.succeeded
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    pub fn timed_out(&self) -> usize {
        self.timed_out
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Items that failed or timed out, in processing order.
    pub fn problems(&self) -> impl Iterator<Item = &ItemResult> {
        self.results.iter().filter(|r| r.outcome.is_problem())
    }

    pub fn exit_code(&self) -> i32 {
        if self.failed + self.timed_out > 0 { 2 } else { 0 }
    }

    pub fn write_json(&self, path: &Path) -> Result<(), BatchError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| BatchError::Report(e.to_string()))?;
        let mut f = File::create(path)?;
        f.write_all(json.as_bytes())?;
        f.write_all(b"\n")?;
        Ok(())
    }
}

// -------------- Launcher trait --------------

pub trait Launcher {
    /// Runs the parser for one item and blocks until it is done.
    fn launch(&self, item: &WorkItem) -> Result<Outcome, BatchError>;
}

/// Spawns the external parser as `<program> <input> <output>`.
pub struct ProcessLauncher {
    program: PathBuf,
    timeout: Option<Duration>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, timeout: Option<Duration>) -> Self {
        ProcessLauncher {
            program: program.into(),
            timeout,
        }
    }

    /// Returns `None` if the child had to be killed.
    fn wait_bounded(child: &mut Child, limit: Duration) -> io::Result<Option<ExitStatus>> {
        let Some(deadline) = Instant::now().checked_add(limit) else {
            // a deadline past what Instant can represent never fires
            return child.wait().map(Some);
        };
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status));
            }
            let now = Instant::now();
            if now >= deadline {
                // kill fails if the child exited in between; wait still reaps it
                let _ = child.kill();
                child.wait()?;
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, item: &WorkItem) -> Result<Outcome, BatchError> {
        info!(
            "Running {} {} {}",
            self.program.display(),
            item.input_path.display(),
            item.output_path.display()
        );
        let mut child = Command::new(&self.program)
            .arg(&item.input_path)
            .arg(&item.output_path)
            .spawn()
            .map_err(|source| BatchError::Launch {
                program: self.program.display().to_string(),
                source,
            })?;

        let status = match self.timeout {
            None => child.wait()?,
            Some(limit) => match Self::wait_bounded(&mut child, limit)? {
                Some(status) => status,
                None => {
                    warn!(
                        "Parser timed out after {:?} on {}",
                        limit,
                        item.input_path.display()
                    );
                    return Ok(Outcome::TimedOut {
                        after_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            },
        };

        let outcome = Outcome::from(status);
        if let Outcome::Failed { code } = &outcome {
            warn!(
                "Parser failed on {} (exit code {:?})",
                item.input_path.display(),
                code
            );
        }
        Ok(outcome)
    }
}

// -------------- Config structures --------------

#[derive(Deserialize)]
struct RawConfig {
    schema_version: Option<String>,

    parser_path: Option<String>,
    input_dir: Option<String>,
    pattern: Option<String>,
    suffix: Option<String>,
    timeout_secs: Option<u64>,
    dry_run: Option<bool>,
    report_file: Option<String>,

    log_enabled: Option<bool>,
    log_level: Option<String>,
    log_file: Option<String>,
    log_append: Option<bool>,
}

impl Default for RawConfig {
    fn default() -> Self {
        RawConfig {
            schema_version: Some(SCHEMA_VERSION.into()),

            parser_path: Some(DEFAULT_PARSER_PATH.into()),
            input_dir: Some(DEFAULT_INPUT_DIR.into()),
            pattern: Some(DEFAULT_PATTERN.into()),
            suffix: Some(DEFAULT_SUFFIX.into()),
            timeout_secs: None,
            dry_run: Some(false),
            report_file: None,

            log_enabled: Some(true),
            log_level: Some("info".into()),
            log_file: Some("batchparse.log".into()),
            log_append: Some(true),
        }
    }
}

impl RawConfig {
    /// Values present in `file` win over `self`.
    fn overlay(self, file: RawConfig) -> RawConfig {
        RawConfig {
            schema_version: file.schema_version.or(self.schema_version),
            parser_path: file.parser_path.or(self.parser_path),
            input_dir: file.input_dir.or(self.input_dir),
            pattern: file.pattern.or(self.pattern),
            suffix: file.suffix.or(self.suffix),
            timeout_secs: file.timeout_secs.or(self.timeout_secs),
            dry_run: file.dry_run.or(self.dry_run),
            report_file: file.report_file.or(self.report_file),
            log_enabled: file.log_enabled.or(self.log_enabled),
            log_level: file.log_level.or(self.log_level),
            log_file: file.log_file.or(self.log_file),
            log_append: file.log_append.or(self.log_append),
        }
    }
}

#[derive(Parser)]
#[command(name = "batchparse", about = "Run an external parser over every raw data file in a directory")]
pub struct Cli {
    /// Path to config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Parser executable, invoked as `<parser> <input> <output>`
    #[arg(long)]
    parser: Option<String>,
    /// Directory holding the raw data files
    #[arg(long)]
    input_dir: Option<String>,
    /// Glob matched against file names inside the input directory
    #[arg(long)]
    pattern: Option<String>,
    /// Suffix stripped from each input to form the output path
    #[arg(long)]
    suffix: Option<String>,
    /// Kill a parser run after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// List the work items without launching the parser
    #[arg(long)]
    dry_run: Option<bool>,
    /// Write a JSON summary of the batch here
    #[arg(long)]
    report: Option<String>,

    #[arg(long)] log_enabled: Option<bool>,
    #[arg(long)] log_level: Option<String>,
    #[arg(long)] log_file: Option<String>,
    #[arg(long)] log_append: Option<bool>,
}

#[derive(Debug)]
pub struct Config {
    parser_path: PathBuf,
    input_dir: String,
    pattern: String,
    suffix: String,
    timeout: Option<Duration>,
    dry_run: bool,
    report_file: Option<PathBuf>,

    log_enabled: bool,
    log_level: String,
    log_file: String,
    log_append: bool,
}

impl Config {
    pub fn from(cli: Cli) -> Result<Self, BatchError> {
        // 1) Determine config file path
        let path = if let Some(cfg) = cli.config.clone() {
            cfg
        } else if let Ok(env) = std::env::var("BATCHPARSE_CONFIG") {
            PathBuf::from(env)
        } else {
            PathBuf::from("batchparse.json")
        };

        // 2) Load JSON
        let mut raw = RawConfig::default();
        if let Ok(f) = File::open(&path) {
            let mut s = String::new();
            io::BufReader::new(f).read_to_string(&mut s)?;
            let file_cfg: RawConfig = serde_json::from_str(&s).map_err(|e| {
                BatchError::InvalidConfiguration(format!("{}: {}", path.display(), e))
            })?;
            raw = raw.overlay(file_cfg);
        }

        // 3) Override with CLI
        let defaults = RawConfig::default();
        let pick = |cli: Option<String>, raw: Option<String>, default: Option<String>| {
            cli.or(raw).or(default).unwrap_or_default()
        };

        let schema_version = raw.schema_version.unwrap_or_else(|| SCHEMA_VERSION.into());
        let parser_path = pick(cli.parser, raw.parser_path, defaults.parser_path);
        let input_dir = pick(cli.input_dir, raw.input_dir, defaults.input_dir);
        let pattern = pick(cli.pattern, raw.pattern, defaults.pattern);
        let suffix = pick(cli.suffix, raw.suffix, defaults.suffix);
        let timeout_secs = cli.timeout_secs.or(raw.timeout_secs);
        let dry_run = cli.dry_run.or(raw.dry_run).unwrap_or(false);
        let report_file = cli.report.or(raw.report_file).map(PathBuf::from);

        let log_enabled = cli.log_enabled.or(raw.log_enabled).unwrap_or(true);
        let log_level = pick(cli.log_level, raw.log_level, defaults.log_level);
        let log_file = pick(cli.log_file, raw.log_file, defaults.log_file);
        let log_append = cli.log_append.or(raw.log_append).unwrap_or(true);

        // 4) Validate
        if schema_version != SCHEMA_VERSION {
            return Err(BatchError::InvalidConfiguration(format!(
                "unsupported schema_version {}, expected {}",
                schema_version, SCHEMA_VERSION
            )));
        }
        if parser_path.trim().is_empty() {
            return Err(BatchError::InvalidConfiguration(
                "parser_path cannot be empty".into(),
            ));
        }
        if input_dir.is_empty() {
            return Err(BatchError::InvalidConfiguration(
                "input_dir cannot be empty".into(),
            ));
        }
        if suffix.is_empty() {
            return Err(BatchError::InvalidConfiguration(
                "suffix cannot be empty".into(),
            ));
        }
        Pattern::new(&pattern)?;
        if timeout_secs == Some(0) {
            return Err(BatchError::InvalidConfiguration(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if log_enabled && LevelFilter::from_str(&log_level).is_err() {
            return Err(BatchError::InvalidConfiguration(format!(
                "unknown log_level {}",
                log_level
            )));
        }

        Ok(Config {
            parser_path: PathBuf::from(parser_path),
            input_dir,
            pattern,
            suffix,
            timeout: timeout_secs.map(Duration::from_secs),
            dry_run,
            report_file,
            log_enabled,
            log_level,
            log_file,
            log_append,
        })
    }

    pub fn parser_path(&self) -> &Path {
        &self.parser_path
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn report_file(&self) -> Option<&Path> {
        self.report_file.as_deref()
    }

    /// Full glob: the input directory, escaped, joined with the file pattern.
    pub fn glob_pattern(&self) -> String {
        Path::new(&Pattern::escape(&self.input_dir))
            .join(&self.pattern)
            .to_string_lossy()
            .into_owned()
    }
}

// -------------- Dispatcher --------------

pub struct Dispatcher<L: Launcher> {
    pattern: String,
    suffix: String,
    dry_run: bool,
    launcher: L,
}

impl Dispatcher<ProcessLauncher> {
    pub fn new(cfg: &Config) -> Self {
        let launcher = ProcessLauncher::new(cfg.parser_path.clone(), cfg.timeout);
        Dispatcher::with_launcher(cfg, launcher)
    }
}

impl<L: Launcher> Dispatcher<L> {
    pub fn with_launcher(cfg: &Config, launcher: L) -> Self {
        Dispatcher {
            pattern: cfg.glob_pattern(),
            suffix: cfg.suffix.clone(),
            dry_run: cfg.dry_run,
            launcher,
        }
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Work items for every path the glob matches, in glob order.
    pub fn discover(&self) -> Result<Vec<WorkItem>, BatchError> {
        let mut items = Vec::new();
        for entry in glob(&self.pattern)? {
            match entry {
                Ok(path) => items.push(WorkItem::new(path, &self.suffix)),
                Err(e) => warn!(
                    "Skipping unreadable entry {}: {}",
                    e.path().display(),
                    e.error()
                ),
            }
        }
        info!("Discovered {} file(s) matching {}", items.len(), self.pattern);
        Ok(items)
    }

    pub fn dispatch(&self, item: &WorkItem) -> Result<Outcome, BatchError> {
        if item.collides() {
            warn!(
                "Skipping {}: name does not end in {}",
                item.input_path.display(),
                self.suffix
            );
            return Ok(Outcome::Skipped {
                reason: format!("input does not end in {}", self.suffix),
            });
        }
        if self.dry_run {
            info!(
                "Dry run: {} -> {}",
                item.input_path.display(),
                item.output_path.display()
            );
            return Ok(Outcome::Skipped {
                reason: "dry run".into(),
            });
        }
        self.launcher.launch(item)
    }

    /// Processes every discovered item, printing progress to `out`.
    ///
    /// A launch failure aborts the batch before the completion message.
    pub fn run<W: Write>(&self, out: &mut W) -> Result<BatchReport, BatchError> {
        let items = self.discover()?;
        let mut report = BatchReport::default();

        for (count, item) in items.into_iter().enumerate() {
            writeln!(out, "...Parsing {}", count)?;
            // the child shares the terminal
            out.flush()?;
            let outcome = self.dispatch(&item)?;
            report.record(item, outcome);
        }

        writeln!(out, "\nFinished!\n")?;
        out.flush()?;

        info!(
            "Batch complete: {} succeeded, {} failed, {} timed out, {} skipped",
            report.succeeded(),
            report.failed(),
            report.timed_out(),
            report.skipped()
        );
        Ok(report)
    }
}

// -------------- Main --------------

fn init_logging(cfg: &Config) -> Result<(), BatchError> {
    let level = LevelFilter::from_str(&cfg.log_level).unwrap_or(LevelFilter::Info);
    let file = OpenOptions::new()
        .write(true)
        .append(cfg.log_append)
        .truncate(!cfg.log_append)
        .create(true)
        .open(&cfg.log_file)?;
    let log_cfg = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .build();
    WriteLogger::init(level, log_cfg, file).map_err(|e| BatchError::Logger(e.to_string()))
}

pub(crate) fn main_internal(cfg: Config) -> Result<BatchReport, Box<dyn std::error::Error>> {
    if cfg.log_enabled {
        init_logging(&cfg)?;
    }
    info!("Starting batch with {:?}", cfg);

    let dispatcher = Dispatcher::new(&cfg);
    let report = {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        dispatcher.run(&mut out)?
    };

    if let Some(path) = cfg.report_file() {
        report.write_json(path)?;
        info!("Report written to {}", path.display());
    }

    for r in report.problems() {
        match &r.outcome {
            Outcome::Failed { code: Some(code) } => {
                eprintln!("Failed: {} (exit code {})", r.item.input_path.display(), code)
            }
            Outcome::Failed { code: None } => {
                eprintln!("Failed: {} (terminated by signal)", r.item.input_path.display())
            }
            Outcome::TimedOut { after_ms } => eprintln!(
                "Timed out: {} (after {} ms)",
                r.item.input_path.display(),
                after_ms
            ),
            _ => {}
        }
    }

    Ok(report)
}

}

use clap::Parser;

/// Entrypoint for the binary. Returns the process exit code of a completed batch.
pub fn run_app() -> Result<i32, Box<dyn std::error::Error>> {
    let cli = crate::dispatcher::Cli::parse();
    let cfg = crate::dispatcher::Config::from(cli)?;

    let report = crate::dispatcher::main_internal(cfg)?;
    Ok(report.exit_code())
}
