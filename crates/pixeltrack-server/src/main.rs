//! pixeltrack-server
//!
//! Operator CLI for the tracking key ring plus a JSON-RPC 2.0 server on
//! stdio that fronts the pixel, summary and admin routes. One request per
//! line; each request runs in its own task under a deadline.

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use pixeltrack::{
    handle_admin_list, handle_pixel, handle_query, mint_pixel_url, resolve_config_path,
    subject_hash, AdminListParams, ApiResponse, FileSecretStore, HeuristicClassifier,
    FileRecordStore, IngestionService, KeyRing, KeyStore, MemoryCounterStore, PixelRequest,
    PixelResponse, QueryService, RotationReport, SystemClock, TrackingConfig, TrackingPayload,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "pixeltrack-server")]
#[command(about = "Encrypted email-open tracking: key management and stdio server")]
#[command(version)]
struct Cli {
    /// Tracking config file (defaults to $PIXELTRACK_CONFIG, then ./pixeltrack.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the initial key ring and admin key
    Setup {
        /// Public base URL serving /pixel/
        #[arg(long)]
        worker_url: Option<String>,
        /// Replace an existing key ring
        #[arg(long)]
        force: bool,
    },
    /// Add a new tracking key version and make it current
    Rotate {
        /// Print the result as JSON instead of env lines
        #[arg(long)]
        json: bool,
    },
    /// Print a pixel URL for one message
    Mint {
        #[arg(long)]
        recipient: String,
        #[arg(long)]
        subject: String,
        /// Unix seconds; defaults to now
        #[arg(long)]
        sent_at: Option<i64>,
    },
    /// Serve JSON-RPC requests on stdio
    Serve {
        /// Expose Prometheus metrics on this address
        #[arg(long)]
        metrics_addr: Option<SocketAddr>,
    },
}

/// Secrets live next to the config file, never inside it
fn secrets_path(config_path: &Path) -> PathBuf {
    config_path.with_extension("secrets.json")
}

/// Append-only open record log, also next to the config file
fn records_path(config_path: &Path) -> PathBuf {
    config_path.with_extension("opens.jsonl")
}

fn open_key_store(config_path: &Path) -> Result<KeyStore> {
    let config = TrackingConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.validate()?;
    let secrets = FileSecretStore::new(secrets_path(config_path));
    Ok(KeyStore::new(config, Arc::new(secrets)))
}

fn run_setup(config_path: &Path, worker_url: Option<String>, force: bool) -> Result<()> {
    let mut store = open_key_store(config_path)?;
    let worker_url = worker_url.unwrap_or_else(|| store.metadata().worker_url.clone());
    let ring = store.setup(&worker_url, force)?;
    store.metadata().save(config_path)?;

    info!(path = %config_path.display(), "tracking configured");
    println!("TRACKING_WORKER_URL={}", store.metadata().worker_url);
    println!("TRACKING_CURRENT_KEY_VERSION={}", ring.current_version());
    println!(
        "TRACKING_KEY_V{}={}",
        ring.current_version(),
        ring.current_key().to_base64()
    );
    println!("TRACKING_ADMIN_KEY={}", ring.admin_key());
    Ok(())
}

fn rotation_json(report: &RotationReport, ring: &KeyRing) -> Value {
    let versions: Vec<i64> = ring.versions().into_iter().map(i64::from).collect();
    json!({
        "rotated": true,
        "previousVersion": i64::from(report.previous_version),
        "currentVersion": i64::from(report.current_version),
        "trackingKeyVersions": versions,
    })
}

fn run_rotate(config_path: &Path, as_json: bool) -> Result<()> {
    let mut store = open_key_store(config_path)?;
    if !store.is_configured() {
        bail!("tracking not configured; run setup first");
    }
    let report = store.rotate().context("rotating tracking key")?;
    store.metadata().save(config_path)?;
    let ring = store.load()?;

    info!(
        previous = %report.previous_version,
        current = %report.current_version,
        "tracking key rotated"
    );
    if as_json {
        println!("{}", serde_json::to_string_pretty(&rotation_json(&report, &ring))?);
        return Ok(());
    }
    // Every retained key must be redeployed so older pixels stay readable
    println!("TRACKING_CURRENT_KEY_VERSION={}", report.current_version);
    for (version, key) in ring.codec_keys() {
        println!("TRACKING_KEY_V{}={}", version, key.to_base64());
    }
    Ok(())
}

fn run_mint(config_path: &Path, recipient: &str, subject: &str, sent_at: Option<i64>) -> Result<()> {
    let store = open_key_store(config_path)?;
    let metadata = store.metadata();
    if !metadata.enabled {
        bail!("tracking is not enabled; run setup first");
    }
    let recipient = recipient.trim();
    if recipient.is_empty() {
        bail!("recipient is empty");
    }
    let ring = store.load()?;
    let payload = TrackingPayload::new(
        recipient,
        subject_hash(subject),
        sent_at.unwrap_or_else(|| Utc::now().timestamp()),
    );
    println!("{}", mint_pixel_url(&metadata.worker_url, &payload, &ring)?);
    Ok(())
}

// --- JSON-RPC ---

#[derive(Deserialize, Debug)]
struct RpcRequest {
    jsonrpc: String,
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Serialize, Debug)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Serialize, Debug)]
struct RpcError {
    code: i32,
    message: String,
}

fn error_response(id: Value, code: i32, message: impl Into<String>) -> RpcResponse {
    let message = message.into();
    warn!(code, %message, "responding with error");
    RpcResponse {
        jsonrpc: "2.0",
        id,
        result: None,
        error: Some(RpcError { code, message }),
    }
}

fn success_response(id: Value, result: Value) -> RpcResponse {
    RpcResponse {
        jsonrpc: "2.0",
        id,
        result: Some(result),
        error: None,
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct QueryParams {
    blob: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct AdminParams {
    authorization: Option<String>,
    #[serde(flatten)]
    list: AdminListParams,
}

fn pixel_result(pixel: PixelResponse) -> Value {
    let headers: serde_json::Map<String, Value> = pixel
        .headers
        .iter()
        .map(|(name, value)| (name.to_string(), Value::from(*value)))
        .collect();
    json!({
        "status": pixel.status,
        "content_type": pixel.content_type,
        "headers": headers,
        "body_base64": STANDARD.encode(pixel.body),
    })
}

fn api_result(response: ApiResponse) -> Value {
    json!({ "status": response.status, "body": response.body })
}

struct App {
    ingest: IngestionService,
    query: QueryService,
}

impl App {
    async fn new(config_path: &Path) -> Result<Self> {
        let store = open_key_store(config_path)?;
        let ring = store.load().context("loading tracking keys")?;
        let settings = &store.metadata().service;

        let clock = Arc::new(SystemClock);
        let records = Arc::new(
            FileRecordStore::open(records_path(config_path))
                .await
                .context("opening open record log")?,
        );
        let counters = Arc::new(MemoryCounterStore::new(clock.clone()));

        info!(
            current_version = %ring.current_version(),
            versions = ring.versions().len(),
            "key ring loaded"
        );
        Ok(Self {
            ingest: IngestionService::new(
                &ring,
                counters,
                records.clone(),
                Arc::new(HeuristicClassifier::default()),
                clock,
                settings,
            ),
            query: QueryService::new(&ring, records, settings),
        })
    }

    async fn dispatch(&self, req: RpcRequest) -> RpcResponse {
        if req.jsonrpc != "2.0" {
            return error_response(req.id, -32600, "Invalid Request: jsonrpc must be \"2.0\"");
        }
        debug!(method = %req.method, "processing request");

        match req.method.as_str() {
            "pixel" => match serde_json::from_value::<PixelRequest>(req.params) {
                Ok(params) => success_response(req.id, pixel_result(handle_pixel(&self.ingest, &params).await)),
                // A malformed pixel request still gets the pixel
                Err(e) => {
                    debug!(error = %e, "malformed pixel params");
                    success_response(req.id, pixel_result(PixelResponse::neutral()))
                }
            },
            "query" => match serde_json::from_value::<QueryParams>(req.params) {
                Ok(params) => success_response(req.id, api_result(handle_query(&self.query, &params.blob).await)),
                Err(e) => error_response(req.id, -32602, format!("Invalid params: {}", e)),
            },
            "admin_list" => match serde_json::from_value::<AdminParams>(req.params) {
                Ok(params) => {
                    let response =
                        handle_admin_list(&self.query, params.authorization.as_deref(), &params.list).await;
                    success_response(req.id, api_result(response))
                }
                Err(e) => error_response(req.id, -32602, format!("Invalid params: {}", e)),
            },
            other => error_response(req.id, -32601, format!("Method not found: {}", other)),
        }
    }
}

/// Reply for a request that outran `REQUEST_TIMEOUT`; pixel callers still
/// get the pixel
fn timeout_response(id: Value, method: &str) -> RpcResponse {
    if method == "pixel" {
        warn!("pixel request timed out");
        return success_response(id, pixel_result(PixelResponse::neutral()));
    }
    error_response(id, -32000, format!("Request timed out for method '{}'", method))
}

async fn write_responses(mut rx: mpsc::UnboundedReceiver<RpcResponse>) {
    let mut stdout = tokio::io::stdout();
    while let Some(response) = rx.recv().await {
        let line = match serde_json::to_string(&response) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "failed to serialize response");
                continue;
            }
        };
        if let Err(e) = stdout.write_all(format!("{}\n", line).as_bytes()).await {
            error!(error = %e, "failed to write response");
            break;
        }
        if let Err(e) = stdout.flush().await {
            error!(error = %e, "failed to flush stdout");
            break;
        }
    }
}

async fn serve(config_path: &Path, metrics_addr: Option<SocketAddr>) -> Result<()> {
    if let Some(addr) = metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing prometheus exporter")?;
        info!(%addr, "metrics exporter listening");
    }

    let app = Arc::new(App::new(config_path).await?);
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_responses(rx));

    let mut reader = BufReader::new(tokio::io::stdin());
    let mut line = String::new();
    info!("listening on stdio for JSON-RPC messages");

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                info!("stdin closed, shutting down");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let req: RpcRequest = match serde_json::from_str(trimmed) {
                    Ok(req) => req,
                    Err(e) => {
                        let _ = tx.send(error_response(Value::Null, -32700, format!("Parse error: {}", e)));
                        continue;
                    }
                };
                if req.id.is_null() {
                    debug!(method = %req.method, "ignoring notification");
                    continue;
                }

                let app = app.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let id = req.id.clone();
                    let method = req.method.clone();
                    let response = match tokio::time::timeout(REQUEST_TIMEOUT, app.dispatch(req)).await {
                        Ok(response) => response,
                        Err(_) => timeout_response(id, &method),
                    };
                    let _ = tx.send(response);
                });
            }
            Err(e) => {
                error!(error = %e, "error reading stdin");
                break;
            }
        }
    }

    drop(tx);
    writer.await.context("response writer")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config.as_deref());

    match cli.command {
        Commands::Setup { worker_url, force } => run_setup(&config_path, worker_url, force),
        Commands::Rotate { json } => run_rotate(&config_path, json),
        Commands::Mint {
            recipient,
            subject,
            sent_at,
        } => run_mint(&config_path, &recipient, &subject, sent_at),
        Commands::Serve { metrics_addr } => serve(&config_path, metrics_addr).await,
    }
}
