//! Inspect and manage a conteggi counter directory.
//!
//! ```text
//! conteggi show <FILE>                 print metadata and counts of a counter file
//! conteggi list                        list counter files with their expiry
//! conteggi mode [off|local|on]         print or set the telemetry mode
//! conteggi report <PROGRAM> <VERSION> report expired files of a program locally
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::SystemTime;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::Level;

use conteggi::config::{default_dir, Config, Mode};
use conteggi::file::{self, CounterFile};
use conteggi::observers::table::{TableObserver, TableStyle};
use conteggi::session::Session;
use conteggi::upload::{run_worker, LocalReporter};

/// Output format for counter files.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    /// Metadata and counts as tables
    #[default]
    Table,
    /// Counts as a compact multi-column grid
    Compact,
    /// The decoded file as JSON
    Json,
}

/// Table style selection.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum StyleChoice {
    Ascii,
    #[default]
    Rounded,
    Sharp,
    Modern,
    Markdown,
    Blank,
}

impl From<StyleChoice> for TableStyle {
    fn from(choice: StyleChoice) -> Self {
        match choice {
            StyleChoice::Ascii => TableStyle::Ascii,
            StyleChoice::Rounded => TableStyle::Rounded,
            StyleChoice::Sharp => TableStyle::Sharp,
            StyleChoice::Modern => TableStyle::Modern,
            StyleChoice::Markdown => TableStyle::Markdown,
            StyleChoice::Blank => TableStyle::Blank,
        }
    }
}

/// Telemetry mode as accepted on the command line.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeChoice {
    Off,
    Local,
    On,
}

impl From<ModeChoice> for Mode {
    fn from(choice: ModeChoice) -> Self {
        match choice {
            ModeChoice::Off => Mode::Off,
            ModeChoice::Local => Mode::Local,
            ModeChoice::On => Mode::On,
        }
    }
}

/// Inspect and manage local usage counters.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Counter directory (defaults to $CONTEGGI_DIR or the user config dir)
    #[arg(short, long, global = true)]
    dir: Option<PathBuf>,

    /// Log what is being done to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the metadata and counts of a counter file
    Show {
        /// Counter file to decode
        file: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value = "table")]
        format: OutputFormat,

        /// Table style
        #[arg(short, long, value_enum, default_value = "rounded")]
        style: StyleChoice,

        /// Number of columns in compact format
        #[arg(short, long, default_value = "2")]
        columns: usize,

        /// Hide the header row
        #[arg(long)]
        no_header: bool,
    },
    /// List the counter files in the directory
    List,
    /// Print the telemetry mode, or set it
    Mode {
        /// New mode
        #[arg(value_enum)]
        value: Option<ModeChoice>,
    },
    /// Report the expired counter files of a program into <dir>/local
    Report {
        /// Program name
        program: String,

        /// Program version
        version: String,
    },
}

fn show(
    path: &Path,
    format: OutputFormat,
    style: StyleChoice,
    columns: usize,
    no_header: bool,
) -> conteggi::Result<String> {
    let counts = file::read_counter_file(path)?;
    let observer = TableObserver::new()
        .with_style(style.into())
        .with_header(!no_header);

    Ok(match format {
        OutputFormat::Table => format!(
            "{}\n{}",
            observer.render_meta(&counts),
            observer.render_file(&counts)
        ),
        OutputFormat::Compact => observer.compact(true).columns(columns).render_file(&counts),
        OutputFormat::Json => render_json(&counts),
    })
}

fn render_json(counts: &CounterFile) -> String {
    serde_json::to_string_pretty(counts).unwrap_or_else(|e| format!("Error: {e}"))
}

fn list(dir: &Path) -> conteggi::Result<String> {
    let entries = std::fs::read_dir(dir).map_err(|err| conteggi::Error::Io {
        path: dir.to_path_buf(),
        source: err,
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| file::is_counter_file(path))
        .collect();
    paths.sort();

    let now = SystemTime::now();
    let mut out = String::new();
    for path in paths {
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        let line = match file::read_counter_file(&path) {
            Ok(counts) => {
                let status = match counts.time_end() {
                    Some(end) if end <= now => "expired",
                    Some(_) => "active",
                    None => "no expiry",
                };
                let end = counts
                    .meta(file::format::META_TIME_END)
                    .unwrap_or("-")
                    .to_string();
                format!("{name}  {status:<9} {end}  {} counters", counts.counts.len())
            }
            Err(err) => format!("{name}  unreadable: {err}"),
        };
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

fn run(args: Args) -> conteggi::Result<String> {
    let dir = args.dir.unwrap_or_else(default_dir);
    match args.command {
        Command::Show {
            file,
            format,
            style,
            columns,
            no_header,
        } => show(&file, format, style, columns, no_header),
        Command::List => list(&dir),
        Command::Mode { value: None } => Ok(Mode::load(&dir).to_string()),
        Command::Mode { value: Some(value) } => {
            let mode = Mode::from(value);
            mode.store(&dir)?;
            Ok(format!("mode set to {mode}"))
        }
        Command::Report { program, version } => {
            let session = Session::new(Config::new(program).with_version(version).with_dir(&dir));
            let reporter = LocalReporter::for_session(&session);
            let summary = run_worker(&session, &reporter, SystemTime::now());
            Ok(format!(
                "{} reported, {} failed, reports in {}",
                summary.reported,
                summary.failed,
                reporter.dir().display()
            ))
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::WARN };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match run(args) {
        Ok(output) => {
            println!("{}", output.trim_end());
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("conteggi: {err}");
            ExitCode::FAILURE
        }
    }
}
