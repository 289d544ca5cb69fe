use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use smallvec::SmallVec;
use tracing::{error, info, warn};

use skopos_client::MockClient;
use skopos_core::{
    parse_uid, FetchOutcome, KindSpec, ResourceItem, ScopeSelector, WatchEvent,
};
use skopos_store::SnapshotCache;
use skopos_sync::{fetch_scope, SessionOptions, SyncSession, DEFAULT_FETCH_CONCURRENCY};

#[derive(Parser, Debug)]
#[command(name = "skoposctl", version, about = "Skopos sync-layer CLI (fixture-backed)")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespaces to scope to (comma-separated; empty = whole cluster)
    #[arg(long = "ns", global = true, value_delimiter = ',')]
    namespaces: Vec<String>,

    /// JSON fixture backing the demo client
    #[arg(long = "fixture", global = true)]
    fixture: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// One-shot fetch for a kind key, e.g. "v1/Widget"
    Ls {
        /// Kind key, e.g. "v1/Widget" or "demo.io/v1/Gadget"
        kind: String,
    },
    /// Open a sync session and stream snapshot updates until ctrl-c
    Watch {
        /// Kind key, e.g. "v1/Widget" or "demo.io/v1/Gadget"
        kind: String,
        /// Emit a simulated Modified event every N milliseconds
        #[arg(long = "churn-ms")]
        churn_ms: Option<u64>,
    },
}

fn init_tracing() {
    let env = std::env::var("SKOPOS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SKOPOS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid SKOPOS_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_kind(key: &str, watchable: bool) -> Result<KindSpec> {
    let parts: Vec<&str> = key.split('/').collect();
    let (group, version, kind) = match parts.as_slice() {
        [version, kind] => (String::new(), (*version).to_string(), (*kind).to_string()),
        [group, version, kind] => {
            ((*group).to_string(), (*version).to_string(), (*kind).to_string())
        }
        _ => return Err(anyhow!("invalid kind key: {} (expect v1/Kind or group/v1/Kind)", key)),
    };
    Ok(KindSpec { group, version, kind, namespaced: true, watchable, poll_interval: None })
}

fn selector_from(namespaces: &[String]) -> ScopeSelector {
    match namespaces {
        [] => ScopeSelector::ClusterWide,
        [ns] => ScopeSelector::SingleNamespace(ns.clone()),
        many => ScopeSelector::NamespaceSet(many.to_vec()),
    }
}

// ----------------- Fixture loading -----------------

#[derive(Debug, Deserialize)]
struct Fixture {
    #[serde(default)]
    cluster: Vec<FixtureItem>,
    #[serde(default)]
    namespaces: HashMap<String, Vec<FixtureItem>>,
}

#[derive(Debug, Deserialize)]
struct FixtureItem {
    name: String,
    uid: String,
    #[serde(default, rename = "creationTimestamp")]
    creation_timestamp: Option<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

impl FixtureItem {
    fn to_item(&self, namespace: Option<&str>) -> Result<ResourceItem> {
        let uid = parse_uid(&self.uid).with_context(|| format!("item {}", self.name))?;
        let creation_ts = self
            .creation_timestamp
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(0);
        let labels: SmallVec<[(String, String); 8]> =
            self.labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Ok(ResourceItem {
            uid,
            namespace: namespace.map(|s| s.to_string()),
            name: self.name.clone(),
            creation_ts,
            labels,
        })
    }
}

/// Build the demo client plus a flat item list (used for churn simulation).
fn load_fixture(path: &Path) -> Result<(Arc<MockClient>, Vec<ResourceItem>)> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading fixture {}", path.display()))?;
    let fixture: Fixture = serde_json::from_str(&raw)
        .with_context(|| format!("parsing fixture {}", path.display()))?;
    let client = Arc::new(MockClient::new());
    let mut all = Vec::new();
    for entry in &fixture.cluster {
        let item = entry.to_item(None)?;
        client.insert(None, item.clone());
        all.push(item);
    }
    for (ns, entries) in &fixture.namespaces {
        for entry in entries {
            let item = entry.to_item(Some(ns))?;
            client.insert(Some(ns), item.clone());
            all.push(item);
        }
    }
    info!(items = all.len(), fixture = %path.display(), "fixture loaded");
    Ok((client, all))
}

fn require_fixture(fixture: &Option<PathBuf>) -> Result<&Path> {
    fixture.as_deref().ok_or_else(|| anyhow!("--fixture is required"))
}

fn print_items(items: &[ResourceItem], output: Output) -> Result<()> {
    match output {
        Output::Human => {
            for it in items {
                let created = chrono::DateTime::from_timestamp(it.creation_ts, 0)
                    .map(|dt| dt.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!("{} • {} • {}", it.namespace.as_deref().unwrap_or("-"), it.name, created);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(items)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Ls { kind } => {
            let kind = parse_kind(&kind, false)?;
            let (client, _) = load_fixture(require_fixture(&cli.fixture)?)?;
            let client: Arc<dyn skopos_client::RemoteClient> = client;
            let selector = selector_from(&cli.namespaces);
            let outcome = fetch_scope(&client, &kind, &selector, DEFAULT_FETCH_CONCURRENCY).await;
            if let Some(summary) = outcome.partial_error() {
                warn!(error = %summary, "some namespaces dropped from listing");
            }
            match outcome {
                FetchOutcome::Success(items) | FetchOutcome::Partial(items, _) => {
                    print_items(&items, cli.output)?;
                }
                FetchOutcome::Failure(err) => {
                    error!(error = %err, "fetch failed");
                    eprintln!("ls error: {}", err);
                }
            }
        }
        Commands::Watch { kind, churn_ms } => {
            let kind = parse_kind(&kind, true)?;
            let (client, all_items) = load_fixture(require_fixture(&cli.fixture)?)?;
            let selector = selector_from(&cli.namespaces);
            let scoped: Vec<ResourceItem> = match &selector {
                ScopeSelector::ClusterWide => all_items,
                sel => {
                    let wanted = sel.canonical_namespaces().unwrap_or_default();
                    all_items
                        .into_iter()
                        .filter(|it| {
                            it.namespace
                                .as_deref()
                                .is_some_and(|ns| wanted.iter().any(|w| w == ns))
                        })
                        .collect()
                }
            };
            let cache = Arc::new(SnapshotCache::new());
            let session = SyncSession::open(
                client.clone(),
                cache,
                kind,
                selector,
                SessionOptions::default(),
            );

            // Optional fixture churn: rotate Modified events over the
            // scoped items so the stream has something to say.
            let churn = churn_ms.map(|ms| {
                let client = client.clone();
                tokio::spawn(async move {
                    let mut tick = tokio::time::interval(Duration::from_millis(ms.max(1)));
                    let mut n: u64 = 0;
                    loop {
                        tick.tick().await;
                        if scoped.is_empty() {
                            continue;
                        }
                        let mut item = scoped[(n as usize) % scoped.len()].clone();
                        item.labels.push(("demo.skopos.dev/churn".into(), n.to_string()));
                        client.emit(WatchEvent::Modified(item)).await;
                        n += 1;
                    }
                })
            });

            let mut epochs = session.epoch_stream();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("interrupted; closing session");
                        break;
                    }
                    changed = epochs.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snap = session.snapshot();
                        match cli.output {
                            Output::Human => {
                                println!("epoch={} items={}", snap.epoch, snap.items.len());
                                if let Some(err) = session.error() {
                                    println!("  error: {}", err);
                                }
                            }
                            Output::Json => println!("{}", serde_json::to_string(&*snap)?),
                        }
                    }
                }
            }
            if let Some(c) = churn {
                c.abort();
            }
            session.close();
        }
    }
    Ok(())
}
