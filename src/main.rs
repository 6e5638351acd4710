mod ai;
mod app_service;
mod app_state;
mod backtest;
mod commands;
mod config;
mod dataset;
mod generate;
mod run;
mod storage;
#[cfg(test)]
mod testing;

use chrono::Local;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::ai::AnyProvider;
use crate::app_service::{format_detail, format_runs, parse_batch_file, send_detail, send_runs};
use crate::app_state::AppEvent;
use crate::backtest::{ExecutionPool, ProcessSandbox};
use crate::commands::app_command::HELP;
use crate::commands::AppCommand;
use crate::config::ForgeConfig;
use crate::dataset::{BinanceSource, CsvSource, DatasetProvider, PriceSource};
use crate::generate::{CodeGenerator, LlmCodeGenerator, PromptBuilder, UnconfiguredGenerator};
use crate::run::RunOrchestrator;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let env_file = dotenv::dotenv();
    let ts = Local::now().format("%Y%m%d-%H%M%S").to_string();
    let log_dir = std::path::PathBuf::from("logs");
    std::fs::create_dir_all(&log_dir)?;
    let log_path = log_dir.join(format!("app-{}.log", ts));
    let log_file = std::fs::File::create(&log_path)?;
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .filter_level(log::LevelFilter::Warn)
        .filter_module("stratforge", log::LevelFilter::Info)
        .filter_module("sqlx", log::LevelFilter::Error)
        .filter_module("sea_orm", log::LevelFilter::Error)
        .init();

    match env_file {
        Ok(path) => info!("loaded {}", path.display()),
        Err(_) => warn!("⚠ no .env found, reading process environment only"),
    }

    let cfg = ForgeConfig::from_env()?;
    info!(
        "config: provider={} model={} datasets={} workers={} max_debug={}",
        cfg.llm_provider,
        cfg.llm_model,
        cfg.datasets.len(),
        cfg.worker_budget,
        cfg.max_debug_iterations
    );

    let db = match storage::establish_connection(&cfg.database_url).await {
        Ok(connection) => Arc::new(connection),
        Err(e) => {
            eprintln!("cannot open database {}: {}", cfg.database_url, e);
            return Err(e.into());
        }
    };

    let generator: Arc<dyn CodeGenerator> =
        match AnyProvider::from_env(&cfg.llm_provider, cfg.llm_timeout) {
            Ok(provider) => Arc::new(LlmCodeGenerator::new(
                provider,
                cfg.llm_model.clone(),
                cfg.llm_temperature,
                cfg.llm_max_tokens,
            )),
            Err(e) => {
                eprintln!("⚠ LLM provider {} not usable: {}", cfg.llm_provider, e);
                error!("LLM provider {} not usable: {}", cfg.llm_provider, e);
                Arc::new(UnconfiguredGenerator::new(e.to_string()))
            }
        };

    let mut datasets = DatasetProvider::new(cfg.data_cache_dir.clone()).with_source(
        "csv",
        Arc::new(CsvSource::new(cfg.csv_data_dir.clone())) as Arc<dyn PriceSource>,
    );
    match BinanceSource::from_env(cfg.sandbox.timeout) {
        Ok(src) => datasets = datasets.with_source("binance", Arc::new(src)),
        Err(e) => warn!("⚠ binance source disabled: {}", e),
    }

    let pool = Arc::new(ExecutionPool::new(
        Arc::new(ProcessSandbox::new(cfg.sandbox.clone())),
        Arc::new(datasets),
        cfg.params,
        cfg.worker_budget,
    ));

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<AppCommand>();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<AppEvent>();

    let orch = Arc::new(RunOrchestrator::new(
        db,
        generator,
        pool,
        PromptBuilder::new(PromptBuilder::language_for_extension(&cfg.sandbox.extension))
            .with_deadline(cfg.sandbox.timeout),
        cfg.run_config(),
        Some(evt_tx.clone()),
    ));
    match orch.recover().await {
        Ok(0) => {}
        Ok(n) => println!("closed {} runs interrupted by the previous shutdown", n),
        Err(e) => error!("❌ recovery failed: {}", e),
    }

    let orch_bg = orch.clone();
    let evt_tx_bg = evt_tx.clone();
    let actor = tokio::spawn(async move {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                AppCommand::Idea { text } => match orch_bg.submit(&text).await {
                    Ok(handle) => {
                        let _ = evt_tx_bg.send(AppEvent::Message(format!(
                            "submitted {}",
                            handle.run_id
                        )));
                    }
                    Err(e) => {
                        let _ = evt_tx_bg.send(AppEvent::Error(format!("submit failed: {}", e)));
                    }
                },
                AppCommand::Batch { path } => match tokio::fs::read_to_string(&path).await {
                    Ok(text) => {
                        let ideas = parse_batch_file(&text);
                        let results = orch_bg.submit_batch(&ideas).await;
                        let failed = results.iter().filter(|r| r.is_err()).count();
                        for err in results.iter().filter_map(|r| r.as_ref().err()) {
                            let _ = evt_tx_bg.send(AppEvent::Error(format!("submit failed: {}", err)));
                        }
                        let _ = evt_tx_bg.send(AppEvent::Message(format!(
                            "batch {}: {} submitted, {} failed",
                            path,
                            results.len() - failed,
                            failed
                        )));
                    }
                    Err(e) => {
                        let _ = evt_tx_bg.send(AppEvent::Error(format!("cannot read {}: {}", path, e)));
                    }
                },
                AppCommand::Runs { limit } => send_runs(&orch_bg, &evt_tx_bg, limit).await,
                AppCommand::Show { run_id } => send_detail(&orch_bg, &evt_tx_bg, &run_id).await,
                AppCommand::Cancel { run_id } => {
                    let msg = if orch_bg.cancel(&run_id) {
                        AppEvent::Message(format!("cancelling {}", run_id))
                    } else {
                        AppEvent::Error(format!("{} is not running", run_id))
                    };
                    let _ = evt_tx_bg.send(msg);
                }
                AppCommand::Active => {
                    let active = orch_bg.active_runs();
                    let _ = evt_tx_bg.send(AppEvent::Message(if active.is_empty() {
                        "no runs in progress".to_string()
                    } else {
                        format!("in progress: {}", active.join(", "))
                    }));
                }
                AppCommand::Help => {
                    let _ = evt_tx_bg.send(AppEvent::Message(HELP.to_string()));
                }
                AppCommand::Quit => {
                    let cancelled = orch_bg.cancel_all();
                    let _ = evt_tx_bg.send(AppEvent::Message(format!(
                        "quitting, {} runs cancelled",
                        cancelled.len()
                    )));
                }
                AppCommand::Unknown(msg) => {
                    if !msg.is_empty() {
                        let _ = evt_tx_bg.send(AppEvent::Error(msg));
                    }
                }
            }
        }
    });

    println!("stratforge ready, log at {} (type `help`)", log_path.display());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut cmd_tx = Some(cmd_tx);
    let mut stdin_open = true;
    let mut tick = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let cmd: AppCommand = match line.parse() {
                        Ok(cmd) => cmd,
                        Err(()) => continue,
                    };
                    let quit = cmd == AppCommand::Quit;
                    let Some(tx) = cmd_tx.as_ref() else { break };
                    if tx.send(cmd).is_err() {
                        break;
                    }
                    if quit {
                        // cancelled runs still record their outcome before we exit
                        println!("waiting for in-flight runs to stop");
                        stdin_open = false;
                        cmd_tx = None;
                    }
                }
                Ok(None) | Err(_) => {
                    // stdin closed (piped input): stay until submitted runs end
                    stdin_open = false;
                    cmd_tx = None;
                }
            },
            Some(evt) = evt_rx.recv() => print_event(evt),
            _ = tick.tick(), if !stdin_open => {
                if actor.is_finished() && orch.active_runs().is_empty() {
                    drain(&mut evt_rx);
                    break;
                }
            }
        }
    }
    info!("shutting down");
    Ok(())
}

fn drain(rx: &mut mpsc::UnboundedReceiver<AppEvent>) {
    while let Ok(evt) = rx.try_recv() {
        print_event(evt);
    }
}

fn print_event(evt: AppEvent) {
    match evt {
        AppEvent::Log(msg) | AppEvent::Message(msg) => println!("{}", msg),
        AppEvent::Error(msg) => eprintln!("✗ {}", msg),
        AppEvent::Runs(list) => println!("{}", format_runs(&list)),
        AppEvent::Detail(detail) => println!("{}", format_detail(&detail)),
    }
}
