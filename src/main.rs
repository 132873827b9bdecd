//! Purpose: `ringq` CLI entry point and command dispatch.
//! Role: Binary crate root; parses args, runs commands against queue files.
//! Invariants: Structured output is stable JSON on stdout; diagnostics and
//! errors go to stderr.
//! Invariants: Process exit code is derived from `core::error::to_exit_code`.
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use ringq::core::error::{to_exit_code, Error, ErrorKind};
use ringq::core::queue::{Queue, QueueOptions};

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    let exit_code = match run(cli.command) {
        Ok(()) => 0,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

#[derive(Parser)]
#[command(
    name = "ringq",
    version,
    about = "Persistent single-process message queues backed by fixed-size ring files"
)]
struct Cli {
    /// Raise diagnostic verbosity (repeat up to -vvvv for trace output).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Silence all diagnostics, including errors.
    #[arg(long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a queue file of the given size (or checkpoint an existing one).
    Create {
        path: PathBuf,
        /// Total file size in bytes, header included.
        #[arg(long)]
        size: u64,
    },
    /// Print queue occupancy as JSON, leaving the file untouched.
    Info { path: PathBuf },
    /// Append one message per argument, or one raw message from stdin.
    Push {
        path: PathBuf,
        #[arg(required_unless_present = "stdin")]
        messages: Vec<String>,
        /// Read a single raw payload from stdin instead of arguments.
        #[arg(long, conflicts_with = "messages")]
        stdin: bool,
    },
    /// Print messages from the front of the queue.
    Cat {
        path: PathBuf,
        /// Maximum number of messages to print.
        #[arg(long, default_value_t = 10)]
        max: u64,
        /// Per-message read buffer capacity in bytes.
        #[arg(long, default_value_t = 1 << 20)]
        buffer: usize,
        /// Remove the printed messages instead of leaving them queued.
        #[arg(long)]
        extract: bool,
    },
    /// Remove messages from the front of the queue.
    Pop {
        path: PathBuf,
        /// How many to remove; over-requesting empties the queue.
        #[arg(long, default_value_t = 1)]
        count: u64,
    },
    /// Drop every queued message and checkpoint the empty queue.
    Clear { path: PathBuf },
    /// Generate shell completions.
    Completion { shell: Shell },
}

fn run(command: Command) -> Result<(), Error> {
    match command {
        Command::Create { path, size } => {
            let mut queue = Queue::open(&path, QueueOptions::new(size))?;
            queue.close()?;
            emit_json(json!({ "created": path.display().to_string(), "file_size": size }));
            Ok(())
        }
        Command::Info { path } => {
            let mut queue = open_existing(&path)?;
            emit_json(queue_info_json(&queue));
            queue.discard();
            Ok(())
        }
        Command::Push {
            path,
            messages,
            stdin,
        } => {
            let payloads = if stdin {
                let mut payload = Vec::new();
                io::stdin().read_to_end(&mut payload).map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to read payload from stdin")
                        .with_source(err)
                })?;
                vec![payload]
            } else {
                messages.into_iter().map(String::into_bytes).collect()
            };

            let mut queue = open_existing(&path)?;
            let mut pushed = 0u64;
            for payload in &payloads {
                queue.push(payload)?;
                pushed += 1;
            }
            queue.close()?;
            emit_json(json!({ "pushed": pushed }));
            Ok(())
        }
        Command::Cat {
            path,
            max,
            buffer,
            extract,
        } => {
            let mut queue = open_existing(&path)?;
            let mut printed = 0u64;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            while printed < max && !queue.is_empty() {
                let payload = queue.get(buffer)?;
                writeln!(out, "{}", format_payload(&payload)).map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write to stdout")
                        .with_source(err)
                })?;
                queue.pop()?;
                printed += 1;
            }
            // Without --extract the pops above stay in memory only.
            if extract {
                queue.close()?;
            } else {
                queue.discard();
            }
            Ok(())
        }
        Command::Pop { path, count } => {
            let mut queue = open_existing(&path)?;
            let popped = queue.pop_n(count)?;
            queue.close()?;
            emit_json(json!({ "popped": popped }));
            Ok(())
        }
        Command::Clear { path } => {
            let mut queue = open_existing(&path)?;
            queue.clear()?;
            queue.close()?;
            emit_json(json!({ "cleared": path.display().to_string() }));
            Ok(())
        }
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "ringq", &mut io::stdout());
            Ok(())
        }
    }
}

/// Opens a queue that must already exist, adopting its current file size so
/// inspection never resizes or reinitializes the file.
fn open_existing(path: &Path) -> Result<Queue, Error> {
    let metadata = std::fs::metadata(path).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("queue file not found (run `ringq create` first)")
            .with_path(path)
            .with_source(err)
    })?;
    Queue::open(path, QueueOptions::new(metadata.len()))
}

fn queue_info_json(queue: &Queue) -> serde_json::Value {
    json!({
        "path": queue.path().display().to_string(),
        "file_size": queue.file_size(),
        "messages": queue.messages_available(),
        "payload_bytes": queue.bytes_available(),
        "free_bytes": queue.bytes_free(),
        "empty": queue.is_empty(),
    })
}

/// Clean UTF-8 prints as text; anything else prints as hex pairs.
fn format_payload(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text)
            if !text
                .chars()
                .any(|ch| ch.is_control() && ch != '\n' && ch != '\t') =>
        {
            text.to_string()
        }
        _ => payload
            .iter()
            .map(|byte| format!("{byte:02X}"))
            .collect::<Vec<_>>()
            .join(" "),
    }
}

fn emit_json(value: serde_json::Value) {
    println!("{value}");
}

fn emit_error(err: &Error) {
    let body = json!({
        "error": {
            "kind": format!("{:?}", err.kind()),
            "message": err.to_string(),
        }
    });
    eprintln!("{body}");
}

fn init_tracing(verbose: u8, quiet: bool) {
    let fallback = if quiet {
        "off"
    } else {
        match verbose {
            0 => "error",
            1 => "warn",
            2 => "info",
            3 => "debug",
            _ => "trace",
        }
    };
    let env_filter =
        EnvFilter::try_from_env("RINGQ_LOG").unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}
