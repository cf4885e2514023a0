use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use ugc_etl::{
    bus::kafka::KafkaBus,
    ingester::{Ingester, IngesterConfig},
    settings::{Log, Settings},
    sink::{clickhouse::ClickHouseAdapter, AnalyticSink},
};

#[doc(hidden)]
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let settings = match Settings::new(args.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("cannot load config: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&settings.log);

    match run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(log: &Log) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,ugc_etl=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if log.json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    let sink = ClickHouseAdapter::new(&settings.clickhouse_url, &settings.clickhouse_database)
        .context("creating clickhouse client")?
        .with_credentials(settings.clickhouse_user.clone(), settings.clickhouse_password.clone());
    sink.health_check().await;
    sink.init().await.context("creating clickhouse tables")?;

    let bus = KafkaBus::new(&settings).context("creating kafka consumer")?;
    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    info!("starting ETL process");
    let mut ingester = Ingester::new(bus, sink, IngesterConfig::from(&settings));
    ingester.run(cancel).await?;
    Ok(())
}

async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                info!("shutdown requested");
                cancel.cancel();
                return;
            }
            Err(e) => warn!(error = %e, "cannot listen for SIGTERM"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c");
        return;
    }
    info!("shutdown requested");
    cancel.cancel();
}
