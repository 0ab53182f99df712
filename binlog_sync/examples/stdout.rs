use std::{error::Error, path::PathBuf};

use binlog_sync::{
    config::{Settings, SinkConfig, SinkKind},
    pipeline::{data_pipeline::DataPipeline, sources::json_lines::JsonLinesSource},
};
use clap::Parser;
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Replays newline-delimited JSON change events from stdin into the
/// configured sinks, printing to stdout when no settings file is given.
#[derive(Debug, Parser)]
#[command(name = "stdout", version, about)]
struct AppArgs {
    /// Settings file (TOML, YAML or JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Name of the position record
    #[arg(long)]
    pos_key: Option<String>,

    /// Source id used for GTID resume tokens
    #[arg(long)]
    offset_prefix: Option<String>,

    /// Directory holding position records
    #[arg(long)]
    store_root: Option<PathBuf>,

    /// Events per stdout batch when no settings file is given
    #[arg(long, default_value_t = 1)]
    buffer_size: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    if let Err(e) = main_impl().await {
        error!("{e}");
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn settings(args: &AppArgs) -> Result<Settings, Box<dyn Error>> {
    let mut settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => {
            let mut settings = Settings::default();
            settings.source.host = "stdin".to_string();
            let mut sink = SinkConfig::new("stdout", SinkKind::Stdout);
            sink.buffer_size = args.buffer_size;
            settings.sinks.push(sink);
            settings
        }
    };

    if let Some(pos_key) = &args.pos_key {
        settings.source.pos_key.clone_from(pos_key);
    }
    if let Some(prefix) = &args.offset_prefix {
        settings.source.offset_prefix = Some(prefix.clone());
    }
    if let Some(root) = &args.store_root {
        settings.store.root.clone_from(root);
    }
    Ok(settings)
}

async fn main_impl() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let args = AppArgs::parse();
    let settings = settings(&args)?;

    let source = JsonLinesSource::new(
        BufReader::new(tokio::io::stdin()),
        settings.source.offset_scheme,
    );
    let mut pipeline = DataPipeline::from_settings(&settings, source).await?;

    let shutdown = pipeline.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c");
            shutdown.cancel();
        }
    });

    pipeline.run().await?;

    Ok(())
}
