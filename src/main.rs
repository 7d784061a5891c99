//! rust-procproxy: per-process transparent proxy daemon
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! sudo ./rust-procproxy
//!
//! # Run with custom configuration
//! sudo ./rust-procproxy -c /path/to/config.json
//!
//! # Remove rules left behind by a crashed run, then start
//! sudo ./rust-procproxy --first-clean
//!
//! # Run with environment overrides
//! RUST_PROCPROXY_LOG_LEVEL=debug sudo ./rust-procproxy
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use rust_procproxy::cgroup::{
    read_origin, scan_processes, ControllerManager, Priority, ProcRecord, ProcessMonitor,
};
use rust_procproxy::config::{create_default_config, load_config_with_env, Config};
use rust_procproxy::fakedns::{FakeDns, FakeDnsConfig};
use rust_procproxy::iptables::{FilterSession, IptablesExecutor};
use rust_procproxy::scope::{rules, ProxyScope, ScopeContext, MAIN_CONTROLLER};
use rust_procproxy::tproxy::{has_net_admin_capability, is_root};
use rust_procproxy::tunnel::TunnelTimeouts;

/// How often `/proc` is polled for started and exited processes
const PROCESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Process events buffered between the monitor and the controllers
const PROCESS_EVENT_CAPACITY: usize = 256;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
    /// Remove leftover chains before starting
    first_clean: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/rust-procproxy/config.json");
        let mut generate_config = false;
        let mut check_config = false;
        let mut first_clean = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "--first-clean" => {
                    first_clean = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("rust-procproxy v{}", rust_procproxy::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
            first_clean,
        }
    }
}

fn print_help() {
    println!(
        r#"rust-procproxy v{}

Per-process transparent proxy daemon (cgroup v2 + iptables TPROXY).

USAGE:
    rust-procproxy [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/rust-procproxy/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    --first-clean           Remove chains and rules left by a previous run
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    RUST_PROCPROXY_LOG_LEVEL     Override log level (trace, debug, info, warn, error)
    RUST_PROCPROXY_CGROUP_ROOT   Override the cgroup v2 mount point
    RUST_PROCPROXY_IPTABLES      Override the iptables binary
    RUST_PROCPROXY_DNS_LISTEN    Override the fake DNS listen address

REQUIREMENTS:
    - Linux kernel with TPROXY and cgroup v2 (xt_cgroup) support
    - CAP_NET_ADMIN capability (or root)
    - policy routing for every scope mark:

    ip rule add fwmark 8090 lookup 100
    ip route add local 0.0.0.0/0 dev lo table 100
"#,
        rust_procproxy::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("tokio=warn".parse().unwrap_or_else(|_| level.into()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Check system prerequisites
fn check_prerequisites() {
    if !is_root() && !has_net_admin_capability() {
        warn!("Not running as root and CAP_NET_ADMIN not detected");
        warn!("TPROXY and cgroup writes will fail with permission errors");
    }
}

/// Create the bypass controller and move the daemon itself into it
fn build_controllers(config: &Config) -> Result<Arc<ControllerManager>> {
    let controllers = Arc::new(ControllerManager::new(&config.cgroup_root));
    controllers
        .create_priority_controller(MAIN_CONTROLLER, Priority::MAIN)
        .context("Failed to create main controller")?;

    let pid = std::process::id();
    match std::env::current_exe() {
        Ok(exe) => {
            let exe = exe.to_string_lossy().into_owned();
            let me = ProcRecord::new(exe.clone(), pid, read_origin(pid));
            controllers.claim_path(MAIN_CONTROLLER, &exe, &[me])?;
        }
        Err(e) => warn!("Cannot resolve own executable, daemon traffic may loop: {}", e),
    }
    Ok(controllers)
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();
    let args = Args::parse();

    if args.generate_config {
        create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    let config = load_config_with_env(&args.config_path).with_context(|| {
        format!("Failed to load configuration from {:?}", args.config_path)
    })?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);
    info!("rust-procproxy v{}", rust_procproxy::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);
    check_prerequisites();

    let session = Arc::new(FilterSession::new(Arc::new(IptablesExecutor::new(
        config.iptables_bin.clone(),
    ))));
    if args.first_clean {
        session.first_clean(
            &rules::leftover_chains(),
            &rules::leftover_rules(&config.scopes, config.listen_ip),
        );
        if config.fake_dns.enabled {
            session.first_clean_nat(&rules::leftover_dns_rules(
                &config.scopes,
                config.fake_dns.listen.port(),
            ));
        }
    }

    let controllers = build_controllers(&config)?;
    let cancel = CancellationToken::new();

    let mut ctx = ScopeContext::new(Arc::clone(&session), Arc::clone(&controllers))
        .with_listen_ip(config.listen_ip)
        .with_timeouts(TunnelTimeouts {
            dial: config.dial_timeout(),
            handshake: config.handshake_timeout(),
            ..TunnelTimeouts::default()
        });

    if config.fake_dns.enabled {
        let dns = FakeDns::builder(config.fake_dns.listen)
            .config(FakeDnsConfig::from(&config.fake_dns))
            .build()
            .await
            .context("Failed to start fake DNS")?;
        let dns_addr = dns.local_addr().context("Fake DNS has no local address")?;
        // REDIRECT from OUTPUT delivers to loopback
        if !(dns_addr.ip().is_loopback() || dns_addr.ip().is_unspecified()) {
            warn!(
                "Fake DNS listens on {}; redirected queries arrive on loopback",
                dns_addr
            );
        }
        ctx = ctx
            .with_resolver(Arc::clone(dns.resolver()))
            .with_dns_redirect(dns_addr.port());
        tokio::spawn(dns.run(cancel.clone()));
    }

    let (events_tx, events_rx) = mpsc::channel(PROCESS_EVENT_CAPACITY);
    let mut monitor = ProcessMonitor::new(PROCESS_POLL_INTERVAL);
    match scan_processes() {
        Ok(records) => monitor.seed(&records),
        Err(e) => warn!("Initial process scan failed: {}", e),
    }
    tokio::spawn(monitor.run(events_tx, cancel.clone()));
    tokio::spawn(Arc::clone(&controllers).run_event_loop(events_rx, cancel.clone()));

    let mut scopes = Vec::new();
    for cfg in config.enabled_scopes() {
        let mut scope = ProxyScope::new(cfg.clone(), ctx.clone());
        match scope.start() {
            Ok(()) => scopes.push(scope),
            Err(e) => error!("Scope {} failed to start: {}", cfg.scope, e),
        }
    }
    if scopes.is_empty() {
        cancel.cancel();
        let _ = controllers.remove_controller(MAIN_CONTROLLER);
        bail!("No proxy scope could be started");
    }

    info!(
        "Startup complete in {:.2}ms ({} scopes)",
        start_time.elapsed().as_secs_f64() * 1000.0,
        scopes.len()
    );

    tokio::select! {
        _ = signal::ctrl_c() => info!("Received SIGINT, initiating shutdown..."),
        () = wait_for_sigterm() => info!("Received SIGTERM, initiating shutdown..."),
    }

    info!("Shutting down...");
    for scope in scopes.iter_mut().rev() {
        if let Err(e) = scope.stop().await {
            error!("Scope {} stop failed: {}", scope.config().scope, e);
        }
    }
    cancel.cancel();

    match controllers.remove_controller(MAIN_CONTROLLER) {
        Ok(released) => info!("Released {} bypassed process(es)", released),
        Err(e) => warn!("Removing main controller: {}", e),
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
