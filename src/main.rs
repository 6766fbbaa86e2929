use std::{process::ExitCode, sync::Arc};

use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::docker::DockerRuntime;
use crate::engine::Engine;
use crate::output::StdoutSink;

mod checkpoint;
mod cli;
mod config;
mod docker;
mod engine;
mod event;
mod filter;
#[cfg(test)]
mod mock_runtime;
mod output;
mod pool;
mod runtime;
mod signals;
mod tail;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize the logger
    env_logger::init();

    let args = cli::get_cli_args();

    let config = match Config::try_init(&args.config) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            log::error!("Unable to load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let filter = match config.name_filter() {
        Ok(filter) => filter,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let store = match CheckpointStore::open(&config.checkpoint_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if args.check {
        log::info!(
            "Configuration and checkpoint file {} are valid",
            store.path().display()
        );
        return ExitCode::SUCCESS;
    }

    let runtime = match DockerRuntime::connect(&config.runtime_endpoint) {
        Ok(runtime) => Arc::new(runtime),
        Err(e) => {
            log::error!("Unable to connect to the container runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    if let Err(e) = signals::handle_shutdown(cancel.clone()) {
        log::error!("Unable to install signal handlers: {e}");
        return ExitCode::FAILURE;
    }

    let (tx, rx) = tokio::sync::mpsc::channel(config.channel_capacity);
    let sink = tokio::spawn(StdoutSink::stdout(rx).run());

    let engine = Engine::new(Arc::clone(&config), runtime, filter, store, tx);

    let result = engine
        .run(cancel, || {
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);
        })
        .await;

    // Dropping the engine drops the last sender so the sink can drain
    drop(engine);
    if let Err(e) = sink.await {
        log::error!("Output sink panicked: {e}");
    }

    match result {
        Ok(()) => {
            log::info!("Shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
