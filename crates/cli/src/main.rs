mod cli;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sqlbatch_core::{load_dotenv, ConnectionConfig};
use sqlbatch_executer::{Executer, TableSelectObserver};

use crate::cli::CliArgs;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    load_dotenv();
    let args = CliArgs::parse();

    let vars = match args.template_vars() {
        Ok(vars) => vars,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(1);
        }
    };

    let config = ConnectionConfig::from_env().with_overrides(&args.overrides());
    config.log_summary();

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let mut executer = match Executer::connect(&config, &cancel).await {
        Ok(executer) => executer,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(2);
        }
    };
    configure(&mut executer, &args);

    let outcome = executer.execute_reader(&cancel, tokio::io::stdin(), &vars).await;
    if let Err(e) = executer.close().await {
        warn!(error = %e, "close failed");
    }

    match outcome {
        Ok(result) => {
            if !args.silent {
                info!("DB time when the last SQL was executed: {}", result.last_execute_time);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::from(1)
        }
    }
}

fn configure(executer: &mut Executer, args: &CliArgs) {
    executer.set_sql_dump(args.dump_rendered_sql);
    if args.silent {
        return;
    }

    executer.set_select_observer(TableSelectObserver::new(|query: &str, table: &str| {
        info!("{query}\n{table}\n");
    }));
    if args.detail {
        executer.set_execute_observer(|query: &str, rows_affected: u64, last_insert_id: u64| {
            info!("{query}\nQuery OK, {rows_affected} rows affected, last inserted id = {last_insert_id}");
        });
    }
}

/// Cancel `token` on the first SIGINT, SIGTERM or SIGHUP.
async fn cancel_on_signal(token: CancellationToken) {
    if let Err(e) = wait_for_signal().await {
        warn!(error = %e, "signal handler unavailable");
        return;
    }
    warn!("signal received, cancelling batch");
    token.cancel();
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut hup = signal(SignalKind::hangup())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = term.recv() => {}
        _ = hup.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
