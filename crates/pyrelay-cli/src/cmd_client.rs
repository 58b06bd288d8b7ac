use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pyrelay_client::{watch_directory, DispatchClient, WatchOptions};
use pyrelay_core::config::ClientConfig;
use pyrelay_core::Trigger;
use tokio_util::sync::CancellationToken;

/// What a client invocation should do.
pub enum Action {
    Upload(PathBuf),
    Run(PathBuf),
    Watch(PathBuf),
    Interactive,
}

pub fn execute(config: &ClientConfig, action: Action) -> anyhow::Result<()> {
    let client = Arc::new(DispatchClient::new(config));
    println!("pyrelay client: server {}  user {}", client.server_url(), client.user_id());

    // SIGINT/SIGTERM: tell the relay we are gone, then leave quietly.
    let cancel = CancellationToken::new();
    {
        let client = Arc::clone(&client);
        let cancel = cancel.clone();
        let _ = ctrlc::set_handler(move || {
            cancel.cancel();
            println!("\nstopping");
            client.disconnect();
            std::process::exit(0);
        });
    }

    match action {
        Action::Upload(path) => {
            client.connect(None, false);
            client.upload_file(&path, Trigger::Upload);
            client.wait_background();
        }
        Action::Run(path) => {
            client.connect(None, false);
            client.run_file(&path);
            client.wait_background();
        }
        Action::Watch(root) => {
            let root = std::fs::canonicalize(&root).unwrap_or(root);
            client.connect(Some(&root), false);
            let options = WatchOptions::from(&config.watch);
            let result = watch_directory(Arc::clone(&client), &root, options, cancel);
            client.wait_background();
            client.disconnect();
            result?;
            return Ok(());
        }
        Action::Interactive => {
            client.check_health().ok();
            client.connect(None, false);
            interactive(&client)?;
            client.wait_background();
        }
    }
    client.disconnect();
    Ok(())
}

const HELP: &str = "\
commands:
  u <file>   upload a file for analysis
  r <file>   analyze and run a file
  c          check the relay
  h          show this help
  q          quit";

enum Command<'a> {
    Upload(&'a str),
    Run(&'a str),
    Check,
    Help,
    Quit,
    Empty,
    Unknown(&'a str),
}

fn parse(line: &str) -> Command<'_> {
    let line = line.trim();
    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };
    match head {
        "" => Command::Empty,
        "u" | "upload" => Command::Upload(rest),
        "r" | "run" => Command::Run(rest),
        "c" | "check" => Command::Check,
        "h" | "help" | "?" => Command::Help,
        "q" | "quit" | "exit" => Command::Quit,
        other => Command::Unknown(other),
    }
}

fn interactive(client: &DispatchClient) -> anyhow::Result<()> {
    println!("{HELP}");
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("pyrelay> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next() else {
            return Ok(());
        };
        match parse(&line?) {
            Command::Upload(path) => match require_path(path) {
                Some(path) => {
                    client.upload_file(path, Trigger::Upload);
                }
                None => println!("usage: u <file>"),
            },
            Command::Run(path) => match require_path(path) {
                Some(path) => {
                    client.run_file(path);
                }
                None => println!("usage: r <file>"),
            },
            Command::Check => {
                client.check_health().ok();
            }
            Command::Help => println!("{HELP}"),
            Command::Quit => return Ok(()),
            Command::Empty => {}
            Command::Unknown(cmd) => println!("unknown command `{cmd}` (h for help)"),
        }
    }
}

fn require_path(arg: &str) -> Option<&Path> {
    let arg = arg.trim_matches(|c| c == '"' || c == '\'');
    (!arg.is_empty()).then(|| Path::new(arg))
}
