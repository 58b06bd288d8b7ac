mod cmd_client;
mod cmd_serve;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pyrelay_core::config::Config;

use crate::cmd_client::Action;

#[derive(Parser)]
#[command(
    name = "pyrelay",
    version,
    about = "Relay Python files to an LLM for analysis and sandboxed execution"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Option<Command>,

    /// Relay URL (overrides config and PYRELAY_SERVER)
    #[arg(long)]
    server: Option<String>,
    /// User id sent with every request (overrides config and PYRELAY_USER)
    #[arg(long)]
    user: Option<String>,
    /// Upload one file for analysis and exit
    #[arg(long, value_name = "PATH", group = "action")]
    upload: Option<PathBuf>,
    /// Analyze and execute one file, wait for the result, and exit
    #[arg(long, value_name = "PATH", group = "action")]
    run: Option<PathBuf>,
    /// Watch a directory until interrupted
    #[arg(long, value_name = "DIR", group = "action")]
    watch: Option<PathBuf>,
    /// Config file (default: <config dir>/pyrelay/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// More log output (repeatable); RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay server
    Serve {
        /// Address to bind (default from config: 0.0.0.0)
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on (default from config: 5000)
        #[arg(long)]
        port: Option<u16>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.cmd {
        Some(Command::Serve { bind, port }) => cmd_serve::execute(config.relay, bind, port),
        None => {
            if let Some(server) = cli.server {
                config.client.server_url = server;
            }
            if let Some(user) = cli.user {
                config.client.user_id = user;
            }
            let action = match (cli.upload, cli.run, cli.watch) {
                (Some(path), _, _) => Action::Upload(path),
                (_, Some(path), _) => Action::Run(path),
                (_, _, Some(dir)) => Action::Watch(dir),
                _ => Action::Interactive,
            };
            cmd_client::execute(&config.client, action)
        }
    }
}
