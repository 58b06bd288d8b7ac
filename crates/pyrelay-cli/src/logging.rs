use tracing_subscriber::EnvFilter;

/// Level used when `RUST_LOG` is unset.
fn default_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

fn log_filter(rust_log: Option<String>, verbose: u8) -> EnvFilter {
    let level = rust_log
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default_level(verbose).to_string());
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Logs go to stderr so stdout stays
/// reserved for results.
pub fn init(verbose: u8) {
    let filter = log_filter(std::env::var("RUST_LOG").ok(), verbose);
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
