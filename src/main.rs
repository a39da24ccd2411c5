#[macro_use]
extern crate tracing;

use crate::{
    components::api::{self, ApiContext},
    configs::MonitorConfig,
    monitor::Monitor,
};
use std::env;
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
};

mod certificate_interceptor;
mod components;
mod configs;
mod error;
mod monitor;
mod store;
mod types;

fn main() {
    // Load environment variables from the `.env` file
    dotenvy::dotenv().ok();
    // Initialize the logger after loading the environment variables
    tracing_subscriber::fmt::init();

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| configs::DEFAULT_CONFIG_FILE.to_owned());
    let config = MonitorConfig::load_config(&config_path)
        .expect("Failed to parse the configuration file");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to bootstrap the Tokio runtime")
        .block_on(server_loop(config, config_path))
}

async fn server_loop(config: MonitorConfig, config_path: String) {
    info!(prefix = %config.log_prefix, "Starting the certificate monitor");
    let listen = config.listen.clone();

    let monitor = Monitor::start(config, config_path)
        .await
        .expect("Failed to start the monitor");

    let listener = TcpListener::bind(&listen)
        .await
        .expect("Failed to bind the API listener");
    info!("Listening on {}", listen);

    let context = ApiContext {
        store: monitor.store().clone(),
        prober: monitor.prober().await,
    };
    let api_task = tokio::spawn(api::serve(listener, context, monitor.cancel_token()));

    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
    let mut sigusr2 =
        signal(SignalKind::user_defined2()).expect("Failed to install SIGUSR2 handler");

    loop {
        tokio::select! {
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
            _ = sigusr2.recv() => monitor.reload().await,
        }
    }

    info!("Shutting down");
    monitor.shutdown().await;
    if let Ok(Err(e)) = api_task.await {
        error!("API server terminated with an error: {}", e);
    }
}
