use pyrelay_core::config::RelayConfig;
use tokio_util::sync::CancellationToken;

pub fn execute(mut config: RelayConfig, bind: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    if let Some(bind) = bind {
        config.bind = bind;
    }
    if let Some(port) = port {
        config.port = port;
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let _ = ctrlc::set_handler(move || {
        signal.cancel();
    });
    tokio::runtime::Runtime::new()?.block_on(pyrelay_serve::serve(config, shutdown))
}
