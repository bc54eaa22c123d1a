//! kubetun
//!
//! Connects a workstation to a Kubernetes cluster's network over a TUN
//! device and optionally redirects workloads to it.
//!
//! Usage:
//!   Connect:         kubetun connect -n dev
//!   Redirect:        kubetun connect -n dev --workload deployment/details
//!   Restore:         kubetun reset -n dev --workload deployment/details
//!   Tunnel server:   kubetun serve -L tcp://:10800 -L 'tun://:8421?net=223.254.254.100/24'
//!   Route conflicts: kubetun route-conflicts --tun utun5 --disable

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kubetun::cluster::{ClusterApi, KubeCluster, WorkloadRef};
use kubetun::config::{load_config_or_default, Config};
use kubetun::connect::{ConnectOptions, SessionState};
use kubetun::lock::HostLock;
use kubetun::route::{self, Route};
use kubetun::{dhcp, reverse, route_conflict};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "kubetun")]
#[command(version)]
#[command(about = "Layer-3 tunnel into a Kubernetes cluster network")]
struct Args {
    /// Path to config file (default: ~/.config/kubetun/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run tunnel routers for the given serve nodes
    Serve {
        /// Serve node (repeatable), e.g. tcp://:10800 or tun://:8421?net=223.254.254.100/24
        #[arg(short = 'L', long = "listen", required = true)]
        listen: Vec<String>,

        /// Node every router forwards through, e.g. tcp://127.0.0.1:10800
        #[arg(short = 'F', long = "forward", default_value = "")]
        forward: String,

        /// Dial attempts through the forward node
        #[arg(long)]
        retries: Option<usize>,
    },
    /// Connect this machine to the cluster network
    Connect {
        /// Path to kubeconfig (default: inferred)
        #[arg(long)]
        kubeconfig: Option<PathBuf>,

        /// Namespace (default: from kubeconfig)
        #[arg(short, long)]
        namespace: Option<String>,

        /// Workload to redirect to this machine, as kind/name (repeatable)
        #[arg(long = "workload")]
        workloads: Vec<String>,
    },
    /// Restore redirected workloads and remove their shadow pods
    Reset {
        /// Path to kubeconfig (default: inferred)
        #[arg(long)]
        kubeconfig: Option<PathBuf>,

        /// Namespace (default: from kubeconfig)
        #[arg(short, long)]
        namespace: Option<String>,

        /// Workload to restore, as kind/name (repeatable)
        #[arg(long = "workload", required = true)]
        workloads: Vec<String>,
    },
    /// List interfaces whose routes overlap the tunnel's
    RouteConflicts {
        /// TUN interface name
        #[arg(long)]
        tun: String,

        /// Bring conflicting interfaces down
        #[arg(long)]
        disable: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = load_config_or_default(args.config.as_deref())?;

    match args.command {
        Command::Serve {
            listen,
            forward,
            retries,
        } => {
            let retries = retries.unwrap_or_else(|| config.tunnel().retries());
            run_serve(Route::new(listen, forward, retries)).await
        }
        Command::Connect {
            kubeconfig,
            namespace,
            workloads,
        } => {
            let cluster = connect_cluster(&config, kubeconfig, namespace).await?;
            run_connect(cluster, &config, parse_workloads(&workloads)?).await
        }
        Command::Reset {
            kubeconfig,
            namespace,
            workloads,
        } => {
            let cluster = connect_cluster(&config, kubeconfig, namespace).await?;
            run_reset(cluster, parse_workloads(&workloads)?).await
        }
        Command::RouteConflicts { tun, disable } => {
            let conflicts = route_conflict::detect_and_disable(&tun, disable).await?;
            if conflicts.is_empty() {
                println!("No conflicting interfaces");
            }
            for dev in conflicts {
                println!("{}", dev);
            }
            Ok(())
        }
    }
}

fn parse_workloads(raw: &[String]) -> Result<Vec<WorkloadRef>> {
    raw.iter()
        .filter(|w| !w.trim().is_empty())
        .map(|w| {
            w.parse::<WorkloadRef>()
                .with_context(|| format!("Invalid workload {:?} (expected kind/name)", w))
        })
        .collect()
}

/// CLI flags take precedence over the config file.
async fn connect_cluster(
    config: &Config,
    kubeconfig: Option<PathBuf>,
    namespace: Option<String>,
) -> Result<Arc<dyn ClusterApi>> {
    let file = config.cluster();
    let kubeconfig = kubeconfig.or(file.kubeconfig);
    let namespace = namespace.or(file.namespace);
    let cluster = KubeCluster::connect(kubeconfig.as_deref(), namespace.as_deref())
        .await
        .context("Failed to connect to cluster")?;
    log::info!("using namespace {}", cluster.namespace());
    Ok(Arc::new(cluster))
}

async fn run_serve(route: Route) -> Result<()> {
    let token = CancellationToken::new();
    let mut errors = route::start(token.clone(), &route)
        .await
        .context("Failed to start routers")?;

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
            Ok(())
        }
        Some(e) = errors.recv() => Err(anyhow::Error::new(e).context("Router stopped")),
    };
    token.cancel();
    result
}

async fn run_connect(
    cluster: Arc<dyn ClusterApi>,
    config: &Config,
    workloads: Vec<WorkloadRef>,
) -> Result<()> {
    let _lock = HostLock::acquire().context("Another kubetun connect is running")?;
    let mac = dhcp::local_mac_address()
        .await
        .context("Failed to read MAC address")?;

    let mut opts = ConnectOptions::new(cluster, config, workloads, mac, SessionState::new());
    opts.prepare().await.context("Failed to prepare connection")?;
    let mut errors = match opts.do_connect().await {
        Ok(errors) => errors,
        Err(e) => {
            opts.disconnect().await;
            return Err(anyhow::Error::new(e).context("Failed to connect"));
        }
    };

    if !opts.workloads.is_empty() {
        if let Err(e) = opts.do_reverse().await {
            opts.disconnect().await;
            return Err(anyhow::Error::new(e).context("Failed to redirect workloads"));
        }
    }

    log::info!("Connected. Press Ctrl+C to disconnect.");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("Disconnecting"),
        Some(e) = errors.recv() => log::error!("Tunnel stopped: {}", e),
    }
    let failed = opts.disconnect().await;
    if failed > 0 {
        anyhow::bail!("{} cleanup step(s) failed, see log", failed);
    }
    Ok(())
}

async fn run_reset(cluster: Arc<dyn ClusterApi>, workloads: Vec<WorkloadRef>) -> Result<()> {
    for workload in &workloads {
        reverse::remove_inbound_pod(&cluster, workload)
            .await
            .with_context(|| format!("Failed to reset {}", workload))?;
        log::info!("{} restored", workload);
    }
    Ok(())
}
