use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

mod api;
mod config;
mod db;
mod docker;
mod monitor;
mod notify;
mod store;

use crate::api::{Broadcaster, Server};
use crate::config::Config;
use crate::db::Db;
use crate::docker::DockerEngine;
use crate::monitor::Monitor;
use crate::store::Store;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = Config::load();

    let mut database = match Db::open(&cfg.db_path) {
        Ok(db) => db,
        Err(err) => {
            log::error!("open db {}: {}", cfg.db_path, err);
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = database.migrate() {
        log::error!("migrate db: {}", err);
        return ExitCode::FAILURE;
    }

    let store = Arc::new(Store::new(database.into_connection()));
    if let Err(err) = store.load() {
        log::error!("load store: {}", err);
        return ExitCode::FAILURE;
    }

    let engine = match DockerEngine::connect(&cfg.engine_host) {
        Ok(engine) => Arc::new(engine),
        Err(err) => {
            log::error!("connect engine {}: {}", cfg.engine_host, err);
            return ExitCode::FAILURE;
        }
    };

    let token = CancellationToken::new();
    let broadcaster = Arc::new(Broadcaster::new());
    let server = Arc::new(Server::new(
        Arc::clone(&store),
        Arc::clone(&broadcaster),
        cfg.ws_origins.clone(),
        token.clone(),
    ));
    let monitor = Arc::new(Monitor::new(
        &cfg,
        Arc::clone(&store),
        Arc::clone(&server),
        engine,
    ));

    spawn_signal_handler(token.clone());

    // Any monitor failure (including an engine-stream error) cancels the
    // root token so the HTTP server winds down too.
    let monitor_task = {
        let monitor = Arc::clone(&monitor);
        let token = token.clone();
        tokio::spawn(async move {
            let result = monitor.run(token.clone()).await;
            if let Err(err) = &result {
                log::error!("monitor stopped: {}", err);
            }
            token.cancel();
            result
        })
    };

    let addr = cfg.listen_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            log::error!("bind {}: {}", addr, err);
            return ExitCode::FAILURE;
        }
    };
    log::info!("healthmon listening on {}", addr);

    let serve = axum::serve(listener, server.router())
        .with_graceful_shutdown(token.clone().cancelled_owned());
    if let Err(err) = serve.await {
        log::error!("http server: {}", err);
    }

    token.cancel();
    match monitor_task.await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(_)) => ExitCode::FAILURE,
        Err(err) => {
            log::error!("monitor task join: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(err) => {
                        log::error!("install SIGTERM handler: {}", err);
                        token.cancel();
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        log::info!("shutdown signal received");
        token.cancel();
    });
}
