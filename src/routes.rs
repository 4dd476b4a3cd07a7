//! Route controller contract and implementations.
//!
//! The routing-protocol session itself lives outside dnsroute. The core only
//! asks for host routes to be announced or withdrawn; both calls must be
//! idempotent.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::error::RouteError;

/// Announces and withdraws host routes.
#[async_trait]
pub trait RouteController: Send + Sync + 'static {
    /// Announce a host route for `ip`. Repeating it is a no-op.
    async fn announce(&self, ip: IpAddr) -> Result<(), RouteError>;

    /// Withdraw the host route for `ip`. Withdrawing an absent route is a no-op.
    async fn withdraw(&self, ip: IpAddr) -> Result<(), RouteError>;
}

/// Host prefix for an address: `/32` for IPv4, `/128` for IPv6.
pub fn host_prefix(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{v4}/32"),
        IpAddr::V6(v6) => format!("{v6}/128"),
    }
}

/// In-memory announced set.
///
/// Used directly for dry runs, and by [`CommandRouteController`] to keep its
/// hooks idempotent.
#[derive(Debug, Default)]
pub struct RouteTable {
    announced: Mutex<HashSet<IpAddr>>,
}

impl RouteTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `ip` is currently announced.
    pub fn is_announced(&self, ip: &IpAddr) -> bool {
        self.announced.lock().contains(ip)
    }

    /// Announced addresses, sorted.
    pub fn routes(&self) -> Vec<IpAddr> {
        let mut routes: Vec<IpAddr> = self.announced.lock().iter().copied().collect();
        routes.sort();
        routes
    }

    /// Number of announced routes.
    pub fn len(&self) -> usize {
        self.announced.lock().len()
    }

    /// True if nothing is announced.
    pub fn is_empty(&self) -> bool {
        self.announced.lock().is_empty()
    }
}

#[async_trait]
impl RouteController for RouteTable {
    async fn announce(&self, ip: IpAddr) -> Result<(), RouteError> {
        if self.announced.lock().insert(ip) {
            debug!(prefix = %host_prefix(ip), "route announced");
        }
        Ok(())
    }

    async fn withdraw(&self, ip: IpAddr) -> Result<(), RouteError> {
        if self.announced.lock().remove(&ip) {
            debug!(prefix = %host_prefix(ip), "route withdrawn");
        }
        Ok(())
    }
}

/// Runs external commands to add and remove routes, e.g. `ip route` or a
/// routing daemon's control CLI.
///
/// Each argument may contain `{ip}` and `{prefix}` placeholders.
#[derive(Debug)]
pub struct CommandRouteController {
    announce: Vec<String>,
    withdraw: Vec<String>,
    timeout: Duration,
    table: RouteTable,
}

impl CommandRouteController {
    /// Create a controller from argv templates.
    pub fn new(announce: Vec<String>, withdraw: Vec<String>, timeout: Duration) -> Self {
        Self {
            announce,
            withdraw,
            timeout,
            table: RouteTable::new(),
        }
    }

    /// Addresses whose announce hook last succeeded.
    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    async fn run(&self, template: &[String], ip: IpAddr) -> Result<(), RouteError> {
        let argv = render(template, ip);
        let Some((program, args)) = argv.split_first() else {
            return Err(RouteError::NotConfigured);
        };

        let mut command = Command::new(program);
        command.args(args).kill_on_drop(true);

        let status = tokio::time::timeout(self.timeout, command.status())
            .await
            .map_err(|_| RouteError::Timeout { ip })?
            .map_err(|source| RouteError::Spawn { ip, source })?;

        if !status.success() {
            return Err(RouteError::Failed {
                ip,
                status: status.to_string(),
            });
        }
        debug!(?argv, "route command succeeded");
        Ok(())
    }
}

#[async_trait]
impl RouteController for CommandRouteController {
    async fn announce(&self, ip: IpAddr) -> Result<(), RouteError> {
        if self.table.is_announced(&ip) {
            return Ok(());
        }
        self.run(&self.announce, ip).await?;
        self.table.announce(ip).await
    }

    async fn withdraw(&self, ip: IpAddr) -> Result<(), RouteError> {
        if !self.table.is_announced(&ip) {
            return Ok(());
        }
        self.run(&self.withdraw, ip).await?;
        self.table.withdraw(ip).await
    }
}

fn render(template: &[String], ip: IpAddr) -> Vec<String> {
    let ip_str = ip.to_string();
    let prefix = host_prefix(ip);
    template
        .iter()
        .map(|arg| arg.replace("{ip}", &ip_str).replace("{prefix}", &prefix))
        .collect()
}
