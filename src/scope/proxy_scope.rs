//! Start/stop lifecycle of one proxy scope

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::interceptor::Interceptor;
use super::rules::{self, MAIN_CONTROLLER};
use crate::cgroup::{running_of, scan_processes, ControllerManager, Priority, ProcRecord};
use crate::config::ScopeConfig;
use crate::error::{ConfigError, ProcProxyError};
use crate::fakedns::FakeIpResolver;
use crate::iptables::FilterSession;
use crate::tproxy::{default_socket_provider, SocketProvider, TproxyListener, TproxyUdpListener};
use crate::tunnel::{HandlerRegistry, TunnelTimeouts};

/// Daemon-wide state every scope works against
#[derive(Debug, Clone)]
pub struct ScopeContext {
    pub session: Arc<FilterSession>,
    pub controllers: Arc<ControllerManager>,
    pub registry: Arc<HandlerRegistry>,
    pub resolver: Option<Arc<FakeIpResolver>>,
    pub provider: Arc<dyn SocketProvider>,
    pub listen_ip: Ipv4Addr,
    pub timeouts: TunnelTimeouts,
    /// Local port scope DNS queries are redirected to, if any
    pub dns_redirect: Option<u16>,
}

impl ScopeContext {
    /// Context with TPROXY sockets, loopback listeners and default deadlines
    #[must_use]
    pub fn new(session: Arc<FilterSession>, controllers: Arc<ControllerManager>) -> Self {
        Self {
            session,
            controllers,
            registry: Arc::new(HandlerRegistry::new()),
            resolver: None,
            provider: default_socket_provider(),
            listen_ip: Ipv4Addr::LOCALHOST,
            timeouts: TunnelTimeouts::default(),
            dns_redirect: None,
        }
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<FakeIpResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    #[must_use]
    pub fn with_socket_provider(mut self, provider: Arc<dyn SocketProvider>) -> Self {
        self.provider = provider;
        self
    }

    #[must_use]
    pub const fn with_listen_ip(mut self, ip: Ipv4Addr) -> Self {
        self.listen_ip = ip;
        self
    }

    /// Send each scope's DNS queries to the fake responder on `port`
    #[must_use]
    pub const fn with_dns_redirect(mut self, port: u16) -> Self {
        self.dns_redirect = Some(port);
        self
    }

    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: TunnelTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

/// One proxy policy domain: its controller, rules and interception loops
#[derive(Debug)]
pub struct ProxyScope {
    cfg: ScopeConfig,
    ctx: ScopeContext,
    stopping: Arc<AtomicBool>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    tcp_addr: Option<SocketAddr>,
    udp_addr: Option<SocketAddr>,
}

impl ProxyScope {
    #[must_use]
    pub fn new(cfg: ScopeConfig, ctx: ScopeContext) -> Self {
        Self {
            cfg,
            ctx,
            stopping: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            tcp_addr: None,
            udp_addr: None,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ScopeConfig {
        &self.cfg
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Bound TCP listener address while running
    #[must_use]
    pub const fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    /// Bound UDP listener address while running with UDP enabled
    #[must_use]
    pub const fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    /// Bind the listeners, classify the scope's programs, install its rules
    /// and start intercepting. Must be called within a Tokio runtime.
    ///
    /// Nothing stays installed if a step fails.
    ///
    /// # Errors
    ///
    /// Returns the first failing step: missing upstream, bind, controller
    /// creation or rule installation.
    pub fn start(&mut self) -> Result<(), ProcProxyError> {
        if self.is_running() {
            return Ok(());
        }
        let scope = self.cfg.scope;
        let server = self.cfg.selected_proxy().cloned().ok_or_else(|| {
            ConfigError::ValidationError(format!(
                "Scope {}: proxy '{}' not found",
                scope, self.cfg.proxy_name
            ))
        })?;

        let addr = SocketAddr::from((self.ctx.listen_ip, self.cfg.listen_port));
        let tcp = TproxyListener::bind(addr, self.ctx.provider.as_ref())?;
        let udp = if self.cfg.redirects_udp() {
            Some(TproxyUdpListener::bind(addr, Arc::clone(&self.ctx.provider))?)
        } else {
            None
        };

        self.classify()?;
        if let Err(e) = rules::install(&self.ctx.session, &self.cfg, self.ctx.listen_ip) {
            self.declassify();
            return Err(e.into());
        }
        if let Some(port) = self.ctx.dns_redirect {
            if let Err(e) = rules::install_dns_redirect(&self.ctx.session, &self.cfg, port) {
                if let Err(rollback) =
                    rules::uninstall(&self.ctx.session, &self.cfg, self.ctx.listen_ip)
                {
                    warn!("Rollback of {} rules incomplete: {}", scope, rollback);
                }
                self.declassify();
                return Err(e.into());
            }
        }

        self.stopping.store(false, Ordering::Release);
        self.cancel = CancellationToken::new();
        let interceptor = Arc::new(Interceptor::new(
            scope,
            self.cfg.proxy_type,
            server,
            self.ctx.timeouts,
            Arc::clone(&self.ctx.registry),
            self.ctx.resolver.clone(),
            Arc::clone(&self.stopping),
        ));

        self.tcp_addr = Some(tcp.listen_addr());
        self.tasks.push(tokio::spawn(
            Arc::clone(&interceptor).run_tcp(tcp, self.cancel.clone()),
        ));
        if let Some(udp) = udp {
            self.udp_addr = Some(udp.listen_addr());
            self.tasks
                .push(tokio::spawn(interceptor.run_udp(udp, self.cancel.clone())));
        }

        info!(
            "Scope {} started: {} via {} {}",
            scope,
            addr,
            self.cfg.proxy_type,
            self.cfg.proxy_name
        );
        Ok(())
    }

    /// Stop intercepting, close the scope's tunnels, remove its rules and
    /// return its processes to their origin groups.
    ///
    /// # Errors
    ///
    /// Returns the rule removal failure; the other steps are best-effort.
    pub async fn stop(&mut self) -> Result<(), ProcProxyError> {
        if !self.is_running() {
            return Ok(());
        }
        let scope = self.cfg.scope;
        self.stopping.store(true, Ordering::Release);
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Scope {} loop ended abnormally: {}", scope, e);
            }
        }
        self.tcp_addr = None;
        self.udp_addr = None;

        let closed = self.ctx.registry.clear_scope(scope);
        if closed > 0 {
            debug!("Scope {}: closed {} remaining tunnels", scope, closed);
        }

        let dns = match self.ctx.dns_redirect {
            Some(port) => rules::uninstall_dns_redirect(&self.ctx.session, &self.cfg, port),
            None => Ok(()),
        };
        let result = rules::uninstall(&self.ctx.session, &self.cfg, self.ctx.listen_ip);
        self.declassify();
        dns.and(result)?;
        info!("Scope {} stopped", scope);
        Ok(())
    }

    fn controller_name(&self) -> String {
        self.cfg.scope.to_string()
    }

    /// Create the scope's controller and move running programs into place
    fn classify(&self) -> Result<(), ProcProxyError> {
        let name = self.controller_name();
        let priority = Priority(self.cfg.scope.default_priority());
        self.ctx
            .controllers
            .create_priority_controller(&name, priority)?;

        let running = self.running_processes();
        for path in &self.cfg.proxy_programs {
            let moved = self
                .ctx
                .controllers
                .claim_path(&name, path, &running_of(&running, path))?;
            debug!("{}: claimed {} ({} running)", name, path, moved);
        }
        for path in &self.cfg.no_proxy_programs {
            match self
                .ctx
                .controllers
                .claim_path(MAIN_CONTROLLER, path, &running_of(&running, path))
            {
                Ok(moved) => debug!("{}: {} bypasses ({} running)", name, path, moved),
                Err(e) => warn!("Cannot exclude {}: {}", path, e),
            }
        }
        Ok(())
    }

    fn running_processes(&self) -> Vec<ProcRecord> {
        if self.cfg.proxy_programs.is_empty() && self.cfg.no_proxy_programs.is_empty() {
            return Vec::new();
        }
        scan_processes().unwrap_or_else(|e| {
            warn!("Process scan failed: {}", e);
            Vec::new()
        })
    }

    /// Undo [`Self::classify`]
    fn declassify(&self) {
        let name = self.controller_name();
        for path in &self.cfg.no_proxy_programs {
            if let Err(e) = self
                .ctx
                .controllers
                .del_controlled_path(MAIN_CONTROLLER, path)
            {
                debug!("Releasing {} from {}: {}", path, MAIN_CONTROLLER, e);
            }
        }
        for path in &self.cfg.proxy_programs {
            if let Err(e) = self.ctx.controllers.del_controlled_path(&name, path) {
                debug!("Releasing {} from {}: {}", path, name, e);
            }
        }
        match self.ctx.controllers.remove_controller(&name) {
            Ok(released) => debug!("Controller {} removed, {} released", name, released),
            Err(e) => warn!("Removing controller {}: {}", name, e),
        }
    }
}
