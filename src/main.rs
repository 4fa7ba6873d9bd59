use std::path::PathBuf;
use std::process;

use chrono::Utc;
use clap::Parser;
use slog::{debug, info, Logger};
use tokio_util::sync::CancellationToken;

use cw2mkr::{
    cloudwatch::{CloudWatchClient, MetricDataQuery},
    config::{self, AwsConfig, MackerelConfig, Options, TimeWindow},
    logging::{self, LogLevel},
    mackerel::MackerelClient,
    metrics, relay, Result,
};

/// Fetches CloudWatch metrics by MetricDataQuery and posts them to Mackerel.
#[derive(Parser)]
#[command(name = "cw2mkr", version, about)]
struct Cli {
    /// Start time in unix seconds, or seconds relative to now when negative.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    start_time: i64,

    /// End time in unix seconds, or seconds relative to now when negative.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    end_time: i64,

    /// Log level (debug, info, warn, error).
    #[arg(long, default_value = "warn")]
    log_level: LogLevel,

    /// Mackerel API key.
    #[arg(long, env = "MACKEREL_APIKEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Mackerel API base URL.
    #[arg(long, env = "MACKEREL_APIBASE")]
    api_base: Option<String>,

    /// MetricDataQuery JSON file.
    query: PathBuf,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            process::exit(code);
        }
    };

    if let Err(e) = start(cli) {
        eprintln!("{}", e);
        process::exit(1);
    }
}

fn start(cli: Cli) -> Result<()> {
    let log = logging::setup_logger(cli.log_level);
    logging::init_tracing(cli.log_level)?;

    let window = TimeWindow::resolve(cli.start_time, cli.end_time, Utc::now())?;
    let mackerel = MackerelConfig::new(cli.api_key, cli.api_base)?;
    let queries = config::load_queries(&cli.query)?;
    debug!(log, "loaded queries";
        "count" => queries.len(), "file" => %cli.query.display());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let options = Options {
            window,
            mackerel,
            aws: AwsConfig::load().await?,
        };
        debug!(log, "resolved AWS configuration";
            "region" => &options.aws.region, "endpoint" => options.aws.endpoint());
        run(options, queries, log).await
    })
}

async fn run(options: Options, queries: Vec<MetricDataQuery>, log: Logger) -> Result<()> {
    let source = CloudWatchClient::new(&options.aws)?;
    let sink = MackerelClient::new(&options.mackerel)?;

    let cancel = CancellationToken::new();
    tokio::spawn(watch_signals(cancel.clone(), log.clone()));

    let summary = relay::run(&options.window, &queries, &source, &sink, &log, &cancel).await?;
    if summary.publish.failed > 0 {
        info!(log, "some chunks were not accepted"; "failed" => summary.publish.failed);
    }
    debug!(log, "run metrics\n{}", metrics::render());
    Ok(())
}

async fn watch_signals(cancel: CancellationToken, log: Logger) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                slog::warn!(log, "failed to register SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                cancel.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!(log, "received SIGINT, cancelling"),
            _ = sigterm.recv() => info!(log, "received SIGTERM, cancelling"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!(log, "received Ctrl-C, cancelling");
    }
    cancel.cancel();
}
