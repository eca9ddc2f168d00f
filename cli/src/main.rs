//! chainsink CLI: run a sink and manage its cursor.
//!
//! # Commands
//! ```text
//! chainsink sink   <endpoint> [block_range] --topic <name>... [--module <name>]
//! chainsink cursor show  --cursor-path <path>
//! chainsink cursor set   <cursor> --cursor-path <path>
//! chainsink cursor reset --cursor-path <path>
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};

use chainsink_observability::{init_tracing, LogConfig};

mod cmd_cursor;
mod cmd_sink;

#[derive(Parser)]
#[command(
    name = "chainsink",
    about = "Publish block-scoped stream output to pub/sub topics",
    long_about = "
chainsink: decode each block's publish operations, publish them, and save the
stream cursor only once every message is acknowledged.

Every flag can also be set through a CHAINSINK_* environment variable,
e.g. CHAINSINK_CURSOR_PATH or CHAINSINK_TOPICS=transfers,swaps.
",
    version
)]
struct Cli {
    /// Global log level: trace | debug | info | warn | error
    #[arg(long, global = true, env = "CHAINSINK_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit JSON logs
    #[arg(long, global = true, env = "CHAINSINK_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream block events and publish them
    Sink(cmd_sink::SinkArgs),

    /// Inspect or change the saved cursor
    Cursor {
        #[command(subcommand)]
        action: cmd_cursor::CursorAction,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log = LogConfig::default()
        .with_level(cli.log_level)
        .with_json(cli.json_logs);
    init_tracing(&log)?;

    match cli.command {
        Commands::Sink(args) => cmd_sink::run(args).await,
        Commands::Cursor { action } => cmd_cursor::run(action).await,
    }
}
