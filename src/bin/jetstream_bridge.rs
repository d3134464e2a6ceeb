//! jetstream-bridge: JetStream source/destination runner
//!
//! ## Modes
//! ```text
//! jetstream-bridge source        [stream] --(durable push consumer)--> stdout
//! jetstream-bridge destination   stdin --(publish)--> [subject]
//! ```
//!
//! `source` writes one JSON object per record (`position`, `created_at`,
//! base64 `payload`) and acks each record once it is written.
//! `destination` publishes every stdin line as one message.
//!
//! ## Configuration
//! - jetstream-bridge.yaml in the working directory
//! - JETSTREAM_BRIDGE_CONFIG: path to a YAML config file
//! - JETSTREAM_BRIDGE__*: overrides, e.g. JETSTREAM_BRIDGE__SOURCE__STREAM
//! - JETSTREAM_BRIDGE_LOG: tracing filter (default: info)

use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{error, info};

use jetstream_bridge::broker::connect;
use jetstream_bridge::config::{Config, ConfigError};
use jetstream_bridge::source::IteratorError;
use jetstream_bridge::utils::bootstrap::init_tracing;
use jetstream_bridge::{ReadIterator, Record, Writer};

const USAGE: &str = "usage: jetstream-bridge <source|destination> [config.yaml]";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let mode = args.next().unwrap_or_default();
    let config_path = args.next();

    let config = Config::load(config_path.as_deref())?;
    config.validate()?;

    let cancel = shutdown_signal();

    match mode.as_str() {
        "source" => run_source(config, cancel).await,
        "destination" => run_destination(config, cancel).await,
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }
}

/// Watch channel that flips to `true` on Ctrl-C.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            let _ = tx.send(true);
        }
    });
    rx
}

async fn run_source(
    config: Config,
    mut cancel: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let source = config
        .source
        .ok_or_else(|| ConfigError::Invalid("source section is required".to_string()))?;

    let connection = connect(&config.connection).await?;
    let iterator = ReadIterator::new(Box::new(connection), source.iterator_params()).await?;

    info!(stream = %source.stream, subject = %source.subject, "jetstream-bridge source started");

    let result = stream_records(&iterator, &mut cancel).await;
    if let Err(ref e) = result {
        error!(error = %e, "Source stopped on error");
    }

    iterator.stop().await?;
    result
}

async fn stream_records(
    iterator: &ReadIterator,
    cancel: &mut watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = base64::engine::general_purpose::STANDARD;
    let mut stdout = tokio::io::stdout();

    loop {
        let record = match iterator.next(cancel).await {
            Ok(record) => record,
            Err(IteratorError::Cancelled) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let line = serde_json::json!({
            "position": record.position.to_string(),
            "created_at": record.created_at,
            "payload": engine.encode(&record.payload.after),
        });

        stdout.write_all(line.to_string().as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;

        iterator.ack(&record.position).await?;
    }
}

async fn run_destination(
    config: Config,
    mut cancel: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let destination = config
        .destination
        .ok_or_else(|| ConfigError::Invalid("destination section is required".to_string()))?;

    let connection = connect(&config.connection).await?;
    let writer = Writer::new(Box::new(connection), destination.writer_params())?;

    info!(subject = %destination.subject, "jetstream-bridge destination started");

    let result = publish_lines(&writer, &mut cancel).await;
    if let Err(ref e) = result {
        error!(error = %e, "Destination stopped on error");
    }

    writer.close().await?;
    result
}

async fn publish_lines(
    writer: &Writer,
    cancel: &mut watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            biased;

            Ok(_) = cancel.wait_for(|cancelled| *cancelled) => return Ok(()),
            line = lines.next_line() => match line? {
                Some(line) => writer.write(&Record::with_payload(line.into_bytes())).await?,
                None => return Ok(()),
            },
        }
    }
}
