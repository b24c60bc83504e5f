use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use futures::{StreamExt, stream};
use gantry_common::types::{BackendInfo, ByteRange, KeyContext, ObjectLocator};
use gantry_crypto::{EncryptionConfig, KeyManager, SseAlgorithm};
use gantry_data::{ChannelSink, DataConfig, DataSys, retrieve_data};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const CLI_OWNER: &str = "gantry-cli";
const CLI_NAMESPACE: &str = "default";
const RESPONSE_BUFFER_CHUNKS: usize = 16;

#[derive(Parser)]
#[command(name = "gantry", about = "Data backend tooling for the gantry S3 gateway")]
struct Cli {
    /// JSON data layer configuration. Built-in defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the health of every configured backend.
    Health,
    /// Print the disk usage of the active backend.
    Usage,
    /// Store a file and print its location descriptor.
    Put {
        file: PathBuf,
        #[arg(long, default_value = "default")]
        bucket: String,
        #[arg(long, default_value = "localhost")]
        endpoint: String,
        #[arg(long)]
        location: Option<String>,
        /// Encrypt under this master key.
        #[arg(long)]
        master_key_id: Option<String>,
    },
    /// Write the bytes of a stored location to stdout or a file.
    Get {
        /// Descriptor JSON as printed by `put`, or a bare key.
        locator: String,
        /// Inclusive byte range, `start-end`.
        #[arg(long)]
        range: Option<String>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Delete a stored location.
    Rm { locator: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = EnvFilter::from_default_env().add_directive("gantry=info".parse()?);
    let logs = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);
    if cli.log_json {
        logs.json().init();
    } else {
        logs.init();
    }

    let config = match &cli.config {
        Some(path) => DataConfig::load(path).await?,
        None => DataConfig::default(),
    }
    .apply_env()?;
    let sys = DataSys::from_config(&config, HashMap::new()).await?;
    info!(backend = %config.backend, "data layer ready");

    let request_id = Uuid::new_v4().simple().to_string();
    match cli.command {
        Command::Health => {
            let health = sys.check_health(&request_id).await;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
        Command::Usage => match sys.disk_usage(&request_id).await? {
            Some(usage) => println!("{}", serde_json::to_string_pretty(&usage)?),
            None => println!("{}", serde_json::json!({})),
        },
        Command::Put {
            file,
            bucket,
            endpoint,
            location,
            master_key_id,
        } => {
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("cannot read {}", file.display()))?;
            let size = data.len() as u64;
            let body = stream::iter([Ok::<_, io::Error>(Bytes::from(data))]).boxed();

            let object_key = file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let ctx = KeyContext::new(bucket, CLI_OWNER, CLI_NAMESPACE).with_object_key(object_key);
            let mut backend_info = BackendInfo::new(endpoint);
            if let Some(location) = location {
                backend_info = backend_info.with_object_location(location);
            }

            let cipher = match master_key_id {
                Some(master_key_id) => {
                    let sse = EncryptionConfig {
                        algorithm: SseAlgorithm::Aes256,
                        master_key_id,
                    };
                    Some(sys.kms().create_cipher_bundle(&sse, &request_id).await?)
                }
                None => None,
            };

            let outcome = sys
                .put(cipher, body, size, &ctx, Some(&backend_info), &request_id)
                .await?;
            println!("{}", serde_json::to_string_pretty(&outcome.location)?);
        }
        Command::Get {
            locator,
            range,
            out,
        } => {
            let locator = parse_locator(locator);
            let range = range.as_deref().map(parse_range).transpose()?;
            let out: Box<dyn AsyncWrite + Unpin + Send> = match out {
                Some(path) => Box::new(tokio::fs::File::create(&path).await?),
                None => Box::new(tokio::io::stdout()),
            };

            let (mut sink, rx) = ChannelSink::new(RESPONSE_BUFFER_CHUNKS);
            let reader = retrieve_data(
                [&locator],
                |part| sys.get(part, range, &request_id),
                &mut sink,
            );

            let (retrieved, written) = tokio::join!(reader, write_response(rx, out));
            written?;
            retrieved?;
        }
        Command::Rm { locator } => {
            let locator = parse_locator(locator);
            sys.delete(&locator, &request_id).await?;
            info!(key = %locator.key(), "deleted");
        }
    }

    Ok(())
}

/// Copies a retrieved body into `out`. The receiver is dropped as soon as a
/// write fails, which closes the response and stops the retrieval.
async fn write_response<W>(mut rx: mpsc::Receiver<io::Result<Bytes>>, mut out: W) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = rx.recv().await {
        out.write_all(&chunk?).await?;
    }
    out.flush().await?;
    Ok(())
}

/// Descriptor JSON, or anything else taken as a bare key.
fn parse_locator(raw: String) -> ObjectLocator {
    serde_json::from_str(&raw).unwrap_or(ObjectLocator::Key(raw))
}

fn parse_range(raw: &str) -> anyhow::Result<ByteRange> {
    let Some((start, end)) = raw.split_once('-') else {
        bail!("range must look like start-end, got {raw}");
    };
    let start = start.trim().parse().context("invalid range start")?;
    let end = end.trim().parse().context("invalid range end")?;
    Ok(ByteRange::new(start, end)?)
}
