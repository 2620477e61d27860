//! foothold command line
//!
//! Usage:
//!   foothold run <module> [key=value...]   run a module against this machine
//!   foothold modules [glob]                 list modules
//!   foothold facts [type]                   show stored facts
//!   foothold tamper list|revert <id>        inspect or undo changes
//!   foothold version                        show version

use clap::Parser;
use foothold::cli::{execute, init_tracing, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config();
    let _guard = init_tracing(&config.logging)?;

    let mut stdout = std::io::stdout();
    execute(&cli, config, &mut stdout).await
}
