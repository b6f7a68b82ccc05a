use clap::Parser;
use tracing::info;
use webqueue::config::ServerConfig;
use webqueue::echo::EchoRouter;
use webqueue::logging::{init_logging, LogConfig};
use webqueue::runtime_config::RuntimeConfig;
use webqueue::server::Server;

fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();

    if let Err(e) = init_logging(&LogConfig::from_env()) {
        eprintln!("Failed to initialize logging: {e:#}");
    }

    // Must run before the first coroutine is spawned
    RuntimeConfig {
        stack_size: config.stack_size(),
        scheduler_threads: config.scheduler_threads(),
    }
    .apply();

    let server = Server::new(config, EchoRouter::new())?;
    let handle = server.start()?;
    info!(addr = %handle.addr(), "Ready");

    wait_for_shutdown(handle)
}

/// SIGTERM / SIGINT drain the pool and close the listener.
#[cfg(unix)]
fn wait_for_shutdown(handle: webqueue::server::ServerHandle) -> anyhow::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    if let Some(sig) = signals.forever().next() {
        info!(signal = sig, "Shutdown requested");
    }
    handle.stop();
    info!("Shutdown complete");
    Ok(())
}

#[cfg(not(unix))]
fn wait_for_shutdown(handle: webqueue::server::ServerHandle) -> anyhow::Result<()> {
    handle
        .join()
        .map_err(|_| anyhow::anyhow!("listener terminated abnormally"))
}
