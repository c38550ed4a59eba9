use anyhow::Context;
use cb_capture::config::Overrides;
use cb_capture::{Config, Forwarder};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "cb-capture")]
#[command(about = "Couchbase DCP to Kafka change forwarder", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Bucket to stream changes from")]
    bucket: Option<String>,

    #[arg(long, value_name = "LIST", help = "Comma separated Couchbase nodes")]
    couchbase_nodes: Option<String>,

    #[arg(long, value_name = "LIST", help = "Comma separated Kafka brokers")]
    kafka_nodes: Option<String>,

    #[arg(short, long, help = "Destination Kafka topic")]
    topic: Option<String>,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting cb-capture");

    let overrides = Overrides {
        bucket: args.bucket,
        couchbase_nodes: args.couchbase_nodes,
        kafka_nodes: args.kafka_nodes,
        topic: args.topic,
    };
    let config = Config::load(args.config.as_deref(), &overrides)
        .context("Failed to load configuration")?;

    info!(
        couchbase_nodes = ?config.couchbase.nodes,
        bucket = %config.couchbase.bucket,
        start_from = ?config.couchbase.start_from,
        kafka_brokers = ?config.kafka.brokers,
        kafka_topic = %config.kafka.topic,
        dead_letter_topic = ?config.kafka.dead_letter_topic,
        "Configuration summary"
    );

    let mut forwarder = Forwarder::from_config(config).context("Failed to create forwarder")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    match forwarder.run(shutdown).await {
        Ok(summary) => {
            info!(
                state = ?summary.state,
                published = summary.stats.published,
                skipped_partitions = ?summary.failed_partitions,
                runtime_secs = (summary.finished_at - summary.started_at).num_seconds(),
                "Forwarding finished"
            );
            Ok(())
        }
        Err(e) => {
            error!("Forwarding failed: {}", e);
            Err(e).context("Forwarder failed")
        }
    }
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
                    _ = terminate.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C");
    }

    shutdown.cancel();
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("cb_capture=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cb_capture=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
