// SPDX-License-Identifier: MIT

use std::path::PathBuf;
use std::process::ExitCode;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use zb_daemon::{Config, Handler, Realizer, Server, StoreFs};

#[tokio::main]
async fn main() -> ExitCode {
    let config_files = match parse_args() {
        Ok(Some(files)) => files,
        Ok(None) => return ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("zb-daemon: {msg}");
            return ExitCode::FAILURE;
        }
    };

    let config = match Config::load(&config_files) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("zb-daemon: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn parse_args() -> Result<Option<Vec<PathBuf>>, String> {
    let mut config_files = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--config requires a file argument".to_string())?;
                config_files.push(PathBuf::from(value));
            }
            "--help" | "-h" => {
                println!("usage: zb-daemon [--config FILE]...");
                return Ok(None);
            }
            other => return Err(format!("unknown argument {other:?}")),
        }
    }
    Ok(Some(config_files))
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::EnvFilter;

    let default = if config.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("ZB_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(config: Config) -> zb_daemon::Result<()> {
    info!(
        store = %config.store_directory,
        socket = %config.store_socket.display(),
        db = %config.db_path().display(),
        "starting zb-daemon"
    );

    std::fs::create_dir_all(&config.var_directory)
        .map_err(|e| zb_daemon::DaemonError::io("creating var directory", e))?;

    let db = zb_store_db::Db::open(&config.db_path(), config.db_writers, config.db_readers)
        .map_err(zb_daemon::DaemonError::from)?;
    let fs = StoreFs::new(config.store_directory.clone(), db);
    fs.init().await?;

    let realizer = Realizer::new(fs.clone(), &config)?;
    let shutdown = CancellationToken::new();
    let server = Server::new(
        Handler {
            fs,
            realizer: realizer.clone(),
        },
        config.store_socket.clone(),
        shutdown.clone(),
    );

    // Signals cancel the token; the server drains its connections and
    // returns.
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("received shutdown signal");
            shutdown.cancel();
        }
    });

    server
        .serve()
        .await
        .map_err(|e| zb_daemon::DaemonError::io("server", e))?;

    realizer.shutdown().await;
    if config.store_socket.exists() {
        let _ = std::fs::remove_file(&config.store_socket);
    }

    info!("zb-daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
