//! Entry point: config load, tracing setup, bind, serve until SIGINT/SIGTERM.
//!
//! Grounded on `main.go`: `go net.Start()` plus a signal-wait channel
//! becomes a single async task tree rooted here, with the port-in-use
//! fatal exit preserved (`Server.go`'s `Start` prints a message and exits
//! nonzero on bind failure).

use tracing_subscriber::EnvFilter;

use ironcore_proxy::config::Config;
use ironcore_proxy::server::Server;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let server = match Server::bind(&config).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("端口 {} 已被占用: {e}", config.port);
            eprintln!("端口被占用，请检查配置或关闭占用该端口的程序");
            std::process::exit(1);
        }
    };

    tracing::info!(port = config.port, "server starting");
    server.serve(shutdown_signal()).await;
    tracing::info!("shutdown complete");
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => tracing::info!("received SIGINT"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
    }
}
