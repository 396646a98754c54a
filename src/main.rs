mod backend;
mod collectors;
mod config;
mod http;
mod metrics;
mod record;
mod scheduler;
mod sink;

use axum::serve;
use clap::Parser;
use collectors::host::SysinfoHost;
use config::Config;
use metrics::Metrics;
use scheduler::{Scheduler, TokioSleeper};
use sink::{LineSink, Publisher};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gpumond")]
#[command(version)]
struct Cli {
    /// Serve gpu_util / gpu_vram gauges for scraping.
    #[arg(long)]
    prometheus: bool,
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    listen: Option<String>,
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match &cli.config {
        Some(path) => match Config::load_from_file(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                error!(error = %err, "не удалось загрузить конфигурацию");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if cli.prometheus {
        cfg.prometheus = true;
    }
    if let Some(listen) = cli.listen {
        cfg.listen = listen;
    }
    if let Err(err) = cfg.validate() {
        error!(error = %err, "некорректная конфигурация");
        std::process::exit(1);
    }

    info!(
        prometheus = cfg.prometheus,
        interval = %humantime::format_duration(cfg.interval),
        disk_mount = %cfg.disk_mount,
        "запуск gpumond"
    );

    let backend = backend::detect();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics = if cfg.prometheus {
        match Metrics::new() {
            Ok(m) => {
                m.set_backend(backend.label());
                Some(m)
            }
            Err(err) => {
                error!(error = %err, "не удалось инициализировать метрики");
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let http_task = metrics.clone().map(|metrics| {
        let listen = cfg.listen.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(metrics);
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "некорректный адрес listen");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "не удалось запустить HTTP-сервер");
                    return;
                }
            };
            info!(listen = %addr, "HTTP-сервер метрик запущен");

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "ошибка HTTP-сервера");
            }
        })
    });

    let mut collector_task = {
        let host = SysinfoHost::new(&cfg.disk_mount);
        let publisher = Publisher::new(LineSink::new(std::io::stdout()), metrics);
        let scheduler = Scheduler::new(backend, host, publisher, TokioSleeper, cfg.cadence());
        tokio::spawn(scheduler.run(shutdown_rx))
    };

    let finished_early = tokio::select! {
        _ = wait_for_signal() => None,
        res = &mut collector_task => Some(res),
    };
    let result = match finished_early {
        Some(res) => res,
        None => {
            info!("получен сигнал завершения, выполняется остановка");
            let _ = shutdown_tx.send(true);
            collector_task.await
        }
    };
    let _ = shutdown_tx.send(true);

    let exit_code = match result {
        Ok(Ok(())) => 0,
        Ok(Err(err)) => {
            error!(error = %err, "поток вывода недоступен, завершение");
            1
        }
        Err(err) => {
            error!(error = %err, "задача сбора аварийно завершилась");
            1
        }
    };

    if let Some(task) = http_task {
        let _ = task.await;
    }
    std::process::exit(exit_code);
}

/// Logs go to stderr: stdout carries the record stream.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        if let Err(err) = res {
                            error!(error = %err, "не удалось дождаться Ctrl+C");
                        }
                    }
                    _ = term.recv() => {}
                }
                return;
            }
            Err(err) => {
                error!(error = %err, "не удалось подписаться на SIGTERM");
            }
        }
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
}
