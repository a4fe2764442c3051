use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use converge_core::PodSnapshot;
use converge_kubehub::{ClusterApi, KubeCluster};
use converge_lifecycle::{
    enumerate_pods, LifecycleConfig, LifecycleReport, Orchestrator, DEFAULT_IMAGE, DEFAULT_NAMESPACE, DEFAULT_WORKLOAD,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "convergectl", version, about = "Drive a namespace/workload lifecycle and confirm each step via watches")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

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
    /// Clean, create, scale and enumerate the workload
    Run(RunArgs),
    /// List all namespaces with phase and age
    Namespaces,
    /// List the workload's pods
    Pods {
        #[arg(long = "namespace", env = "CONVERGE_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
        namespace: String,
        #[arg(long = "workload", env = "CONVERGE_WORKLOAD", default_value = DEFAULT_WORKLOAD)]
        workload: String,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long = "namespace", env = "CONVERGE_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,
    #[arg(long = "workload", env = "CONVERGE_WORKLOAD", default_value = DEFAULT_WORKLOAD)]
    workload: String,
    #[arg(long = "image", env = "CONVERGE_IMAGE", default_value = DEFAULT_IMAGE)]
    image: String,
    /// Container port exposed by the workload
    #[arg(long = "port", default_value_t = 80)]
    port: i32,
    /// Replicas at creation
    #[arg(long = "replicas", default_value_t = 1)]
    replicas: i32,
    /// Replicas after the scale step
    #[arg(long = "scale-to", default_value_t = 2)]
    scale_to: i32,
    /// Bound on each convergence wait
    #[arg(long = "timeout-secs", env = "CONVERGE_TIMEOUT_SECS", default_value_t = 300)]
    timeout_secs: u64,
    /// Wait for convergence without bound
    #[arg(long = "no-timeout", action = ArgAction::SetTrue)]
    no_timeout: bool,
    /// Capacity of the watch event queue
    #[arg(long = "queue-cap", env = "CONVERGE_QUEUE_CAP", default_value_t = 1024)]
    queue_cap: usize,
}

impl RunArgs {
    fn into_config(self) -> LifecycleConfig {
        LifecycleConfig {
            namespace: self.namespace,
            workload: self.workload,
            image: self.image,
            container_port: self.port,
            replicas: self.replicas,
            scale_to: self.scale_to,
            timeout: if self.no_timeout { None } else { Some(Duration::from_secs(self.timeout_secs)) },
            queue_cap: self.queue_cap,
        }
    }
}

const LOG_ENV: &str = "CONVERGE_LOG";
const METRICS_ENV: &str = "CONVERGE_METRICS_ADDR";
const DEFAULT_LOG: &str = "info";

/// Filter from `CONVERGE_LOG` directives; unparseable directives fall back to `info`.
fn log_filter(directives: Option<String>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG))
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var(LOG_ENV).ok()))
        .with_target(true)
        .init();
}

fn init_metrics() {
    let Ok(raw) = std::env::var(METRICS_ENV) else {
        return;
    };
    let Ok(addr) = raw.parse::<SocketAddr>() else {
        warn!(value = %raw, env = METRICS_ENV, "not a host:port; metrics exporter disabled");
        return;
    };
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(_) => info!(%addr, "prometheus exporter listening"),
        Err(e) => warn!(error = %e, "prometheus exporter not installed"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let api: Arc<dyn ClusterApi> = Arc::new(KubeCluster::try_default().await?);

    match cli.command {
        Commands::Run(args) => {
            let config = args.into_config();
            info!(namespace = %config.namespace, workload = %config.workload, replicas = config.replicas, scale_to = config.scale_to, timeout = ?config.timeout, "run invoked");
            let cancel = CancellationToken::new();
            let ctrl_c = tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    if signal::ctrl_c().await.is_ok() {
                        info!("Ctrl-C received; cancelling workflow");
                        cancel.cancel();
                    }
                }
            });
            let outcome = Orchestrator::new(api, config)?.run(cancel).await;
            ctrl_c.abort();
            let report = outcome.map_err(|e| {
                error!(error = %e, "run failed");
                e
            })?;
            match cli.output {
                Output::Human => print_report(&report),
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
        }
        Commands::Namespaces => {
            info!("namespaces invoked");
            let items = api.list_namespaces().await?;
            match cli.output {
                Output::Human => {
                    println!("{:<32} {:<12} AGE", "NAME", "PHASE");
                    for ns in &items {
                        let phase = ns.namespace_phase().map(|p| p.as_str()).unwrap_or("-");
                        println!("{:<32} {:<12} {}", ns.name(), phase, render_age(ns.creation_ts));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&items)?),
            }
        }
        Commands::Pods { namespace, workload } => {
            info!(namespace = %namespace, workload = %workload, "pods invoked");
            let config = LifecycleConfig { namespace, workload, ..Default::default() };
            let pods = enumerate_pods(api.as_ref(), &config.namespace, &config.workload_spec(0)).await?;
            match cli.output {
                Output::Human => print_pods(&pods),
                Output::Json => println!("{}", serde_json::to_string_pretty(&pods)?),
            }
        }
    }

    Ok(())
}

fn print_report(report: &LifecycleReport) {
    let phases: Vec<&str> = report.phases.iter().map(|p| p.as_str()).collect();
    println!("namespace: {}", report.namespace);
    println!("workload:  {}", report.workload);
    println!("cleaned:   {}", if report.cleaned { "yes" } else { "no" });
    println!("phases:    {}", phases.join(" → "));
    print_pods(&report.pods);
}

fn print_pods(pods: &[PodSnapshot]) {
    println!("{:<36} {:<10} {:<16} {:<15} {:<15} PORT", "NAME", "PHASE", "REASON", "HOST-IP", "POD-IP");
    for p in pods {
        println!(
            "{:<36} {:<10} {:<16} {:<15} {:<15} {}",
            p.name,
            p.phase,
            p.reason.as_deref().unwrap_or("-"),
            p.host_ip.as_deref().unwrap_or("-"),
            p.pod_ip.as_deref().unwrap_or("-"),
            p.container_port.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()),
        );
    }
}

fn render_age(creation_ts: i64) -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
    format_age(creation_ts, now)
}

/// Coarse `kubectl`-style age: two units above an hour, one below.
fn format_age(creation_ts: i64, now: i64) -> String {
    if creation_ts <= 0 {
        return "-".to_string();
    }
    let elapsed = (now - creation_ts).max(0) as u64;
    let (days, hours, mins, secs) = (elapsed / 86_400, elapsed % 86_400 / 3600, elapsed % 3600 / 60, elapsed % 60);
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_defaults_match_reference_workflow() {
        let cli = Cli::try_parse_from(["convergectl", "run"]).expect("parse");
        let Commands::Run(args) = cli.command else { panic!("expected run") };
        let cfg = args.into_config();
        assert_eq!(cfg.replicas, 1);
        assert_eq!(cfg.scale_to, 2);
        assert_eq!(cfg.container_port, 80);
        assert_eq!(cfg.timeout, Some(Duration::from_secs(300)));
        assert_eq!(cli.output, Output::Human);
    }

    #[test]
    fn no_timeout_waits_unbounded() {
        let cli = Cli::try_parse_from(["convergectl", "-o", "json", "run", "--namespace", "demo", "--no-timeout"])
            .expect("parse");
        assert_eq!(cli.output, Output::Json);
        let Commands::Run(args) = cli.command else { panic!("expected run") };
        let cfg = args.into_config();
        assert_eq!(cfg.namespace, "demo");
        assert_eq!(cfg.timeout, None);
    }

    #[test]
    fn age_renders_coarse_units() {
        let now = 1_700_000_000;
        assert_eq!(format_age(0, now), "-");
        assert_eq!(format_age(now - 42, now), "42s");
        assert_eq!(format_age(now - 90, now), "1m");
        assert_eq!(format_age(now - 3 * 3600 - 5 * 60 - 7, now), "3h5m");
        assert_eq!(format_age(now - 2 * 86_400 - 3 * 3600, now), "2d3h");
        assert_eq!(format_age(now + 30, now), "0s");
        assert_eq!(render_age(-1), "-");
    }

    #[test]
    fn log_directives_fall_back_to_info() {
        use tracing_subscriber::filter::LevelFilter;
        assert_eq!(log_filter(None).max_level_hint(), Some(LevelFilter::INFO));
        assert_eq!(log_filter(Some("debug".into())).max_level_hint(), Some(LevelFilter::DEBUG));
        assert_eq!(log_filter(Some("converge=loud".into())).max_level_hint(), Some(LevelFilter::INFO));
    }
}
