use mpipe::admission::{AdmissionPolicy, ContentTypePattern, parse_byte_size};
use mpipe::config::{RelayConfig, StaticConfigProvider};
use mpipe::keygen::{IdentityKey, PrefixKey, RandomKey};
use mpipe::relay::{Relay, RelayBuilder};
use mpipe::service::RelayService;
use mpipe::sink::{HttpPutSink, StorageSink};
use mpipe_opendal::OpendalSink;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{debug, error, info};
use url::Url;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KeyKind {
    /// Store parts under their original file name
    Identity,
    /// Store parts under a random UUID, keeping the extension
    Random,
}

#[derive(Debug, Parser)]
#[command(version, about = "Relays multipart uploads to a directory or a PUT endpoint")]
struct Args {
    /// Host to listen on
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value = "8014")]
    port: u16,

    /// Directory to store uploads in
    #[arg(long, required_unless_present = "put_endpoint", conflicts_with = "put_endpoint")]
    root: Option<PathBuf>,

    /// Endpoint receiving one PUT per upload at `{endpoint}/{key}`
    #[arg(long)]
    put_endpoint: Option<Url>,

    /// Allowed content types, e.g. `image/*,application/pdf`
    #[arg(long, conflicts_with = "allow_regex")]
    allow: Option<String>,

    /// Allowed content types as a regular expression
    #[arg(long)]
    allow_regex: Option<String>,

    /// Request size ceiling, e.g. `128mb`
    #[arg(long)]
    limit: Option<String>,

    /// Disable the request size ceiling
    #[arg(long, conflicts_with = "limit")]
    no_limit: bool,

    /// How destination keys are chosen
    #[arg(long, value_enum, default_value = "identity")]
    key: KeyKind,

    /// Prefix prepended to every key
    #[arg(long)]
    prefix: Option<String>,

    /// JSON file with decoder limits
    #[arg(long)]
    config: Option<PathBuf>,

    /// Per-upload deadline in seconds
    #[arg(long)]
    upload_timeout: Option<u64>,
}

fn setup_tracing() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();
}

fn load_config(args: &Args) -> Result<RelayConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => RelayConfig::default(),
    };
    if args.upload_timeout.is_some() {
        config.upload_timeout_secs = args.upload_timeout;
    }
    Ok(config)
}

fn build_policy(args: &Args) -> Result<AdmissionPolicy> {
    let mut policy = AdmissionPolicy::default();

    if let Some(ranges) = &args.allow {
        policy = policy.with_allowed(ranges.parse::<ContentTypePattern>().context("invalid --allow")?);
    }
    if let Some(pattern) = &args.allow_regex {
        policy = policy.with_allowed(ContentTypePattern::regex(pattern).context("invalid --allow-regex")?);
    }

    if args.no_limit {
        policy = policy.with_max_total_bytes(None);
    } else if let Some(limit) = &args.limit {
        policy = policy.with_max_total_bytes(Some(parse_byte_size(limit)?));
    }

    let prefix = args.prefix.clone();
    policy = match (args.key, prefix) {
        (KeyKind::Identity, None) => policy.with_key_generator(IdentityKey),
        (KeyKind::Identity, Some(p)) => policy.with_key_generator(PrefixKey::new(p, IdentityKey)),
        (KeyKind::Random, None) => policy.with_key_generator(RandomKey),
        (KeyKind::Random, Some(p)) => policy.with_key_generator(PrefixKey::new(p, RandomKey)),
    };

    Ok(policy)
}

fn build_relay(sink: impl StorageSink, policy: AdmissionPolicy, config: RelayConfig) -> Relay {
    let mut builder = RelayBuilder::new(sink);
    builder.set_policy(policy);
    builder.set_config(Arc::new(StaticConfigProvider::new(Arc::new(config))));
    builder.build()
}

fn build_service(args: &Args) -> Result<RelayService> {
    let config = load_config(args)?;
    let policy = build_policy(args)?;
    info!(?policy, ?config, "relay configured");

    let relay = match (&args.root, &args.put_endpoint) {
        (Some(root), _) => {
            std::fs::create_dir_all(root).with_context(|| format!("creating {}", root.display()))?;
            let root = root.to_str().context("root is not valid UTF-8")?;
            let builder = opendal::services::Fs::default().root(root);
            let operator = opendal::Operator::new(builder)?.finish();
            info!(%root, "storing uploads on the local filesystem");
            build_relay(OpendalSink::new(operator), policy, config)
        }
        (None, Some(endpoint)) => {
            info!(%endpoint, "relaying uploads with PUT");
            build_relay(HttpPutSink::new(endpoint.clone()), policy, config)
        }
        (None, None) => anyhow::bail!("either --root or --put-endpoint is required"),
    };

    Ok(RelayService::new(relay))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_tracing();

    let service = build_service(&args)?;

    let addr = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("server is running at http://{addr}");

    let http_server = ConnBuilder::new(TokioExecutor::new());
    let graceful = hyper_util::server::graceful::GracefulShutdown::new();

    let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());

    loop {
        let (stream, remote_addr) = tokio::select! {
            res = listener.accept() => {
                match res {
                    Ok(conn) => conn,
                    Err(err) => {
                        error!("error accepting connection: {err}");
                        continue;
                    }
                }
            }
            _ = ctrl_c.as_mut() => {
                info!("received Ctrl+C, shutting down");
                break;
            }
        };

        debug!(%remote_addr, "accepted connection");

        let conn = http_server.serve_connection(TokioIo::new(stream), service.clone());
        let conn = graceful.watch(conn.into_owned());

        tokio::spawn(async move {
            if let Err(err) = conn.await {
                error!("error serving connection: {err}");
            }
        });
    }

    tokio::select! {
        () = graceful.shutdown() => {
            info!("gracefully shut down");
        },
        () = tokio::time::sleep(Duration::from_secs(10)) => {
            info!("waited 10 seconds for graceful shutdown, aborting");
        }
    }

    Ok(())
}
