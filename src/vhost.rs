//! Virtual hosts.
//!
//! # Responsibilities
//! - Describe which connections a host answers: bind address, port, server
//!   name and aliases (absent criteria are wildcards)
//! - Keep registered hosts ordered by specificity, registration order on ties
//! - Pick the most specific host for a request, falling back to the primary
//!
//! # Design Decisions
//! - Names and aliases match case-insensitively
//! - Specificity weights: bind address 4, port 2, server name 1. Only the
//!   ordering matters; a fully specified host always beats a partial one
//! - The host list is published as an immutable snapshot, same as mounts

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use regex::Regex;

use crate::handler::Handler;
use crate::mount::{MountOptions, MountTable};

/// A host-name pattern from a server-alias list.
#[derive(Debug, Clone)]
pub enum HostPattern {
    /// Case-insensitive equality.
    Exact(String),
    /// Shell-style glob: `*` matches any run of characters, `?` one.
    Glob(Regex),
    /// Arbitrary regular expression, anchored by the caller if desired.
    Regex(Regex),
}

impl HostPattern {
    /// Parses an alias: globs when it contains `*` or `?`, exact otherwise.
    pub fn parse(alias: &str) -> Result<Self, regex::Error> {
        if !alias.contains(['*', '?']) {
            return Ok(Self::Exact(alias.to_ascii_lowercase()));
        }
        let mut pattern = String::from("(?i)^");
        for c in alias.chars() {
            match c {
                '*' => pattern.push_str(".*"),
                '?' => pattern.push('.'),
                c => pattern.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
            }
        }
        pattern.push('$');
        Ok(Self::Glob(Regex::new(&pattern)?))
    }

    pub fn matches(&self, host: &str) -> bool {
        match self {
            Self::Exact(name) => name.eq_ignore_ascii_case(host),
            Self::Glob(re) | Self::Regex(re) => re.is_match(host),
        }
    }
}

/// The criteria a virtual host is selected by.
#[derive(Debug, Clone, Default)]
pub struct HostDescriptor {
    pub bind_address: Option<IpAddr>,
    pub port: Option<u16>,
    pub server_name: Option<String>,
    pub server_aliases: Vec<HostPattern>,
}

impl HostDescriptor {
    /// A descriptor answering only to `name` (any address, any port).
    pub fn named(name: impl Into<String>) -> Self {
        Self { server_name: Some(name.into()), ..Self::default() }
    }

    pub fn bind_address(mut self, addr: IpAddr) -> Self {
        self.bind_address = Some(addr);
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn alias(mut self, pattern: HostPattern) -> Self {
        self.server_aliases.push(pattern);
        self
    }

    /// Higher is more specific.
    pub fn specificity(&self) -> u8 {
        let mut score = 0;
        if self.bind_address.is_some() {
            score += 4;
        }
        if self.port.is_some() {
            score += 2;
        }
        if self.server_name.is_some() {
            score += 1;
        }
        score
    }

    /// Whether every present criterion matches the connection and host.
    pub fn matches(&self, local_addr: IpAddr, local_port: u16, host: &str) -> bool {
        self.bind_address.is_none_or(|addr| addr == local_addr)
            && self.port.is_none_or(|port| port == local_port)
            && (self.server_name.as_deref().is_none_or(|name| name.eq_ignore_ascii_case(host))
                || self.server_aliases.iter().any(|alias| alias.matches(host)))
    }
}

impl fmt::Display for HostDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.server_name.as_deref().unwrap_or("*"))?;
        match self.bind_address {
            Some(addr) => write!(f, "@{addr}")?,
            None => f.write_str("@*")?,
        }
        match self.port {
            Some(port) => write!(f, ":{port}"),
            None => f.write_str(":*"),
        }
    }
}

/// A virtual host: a descriptor plus its own, independent mount table.
#[derive(Debug)]
pub struct VirtualHost {
    descriptor: HostDescriptor,
    mounts: MountTable,
}

impl VirtualHost {
    pub fn new(descriptor: HostDescriptor) -> Self {
        Self { descriptor, mounts: MountTable::new() }
    }

    pub fn descriptor(&self) -> &HostDescriptor {
        &self.descriptor
    }

    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    /// Mounts `handler` at `prefix` on this host.
    pub fn mount(&self, prefix: &str, handler: impl Handler) {
        self.mount_with(prefix, handler, MountOptions::none());
    }

    pub fn mount_with(&self, prefix: &str, handler: impl Handler, options: MountOptions) {
        tracing::debug!(host = %self.descriptor, prefix, "mounting handler");
        self.mounts.set(prefix, handler.into_boxed_handler(), options);
    }

    /// Returns whether something was mounted at `prefix`.
    pub fn unmount(&self, prefix: &str) -> bool {
        tracing::debug!(host = %self.descriptor, prefix, "unmounting handler");
        self.mounts.remove(prefix)
    }
}

/// Registered virtual hosts, most specific first.
pub struct VirtualHosts {
    hosts: ArcSwap<Vec<Arc<VirtualHost>>>,
    writer: Mutex<()>,
}

impl VirtualHosts {
    pub fn new() -> Self {
        Self { hosts: ArcSwap::from_pointee(Vec::new()), writer: Mutex::new(()) }
    }

    /// Registers `host` and re-sorts by specificity. The sort is stable, so
    /// among equally specific hosts the earlier registration wins.
    pub fn add(&self, host: Arc<VirtualHost>) {
        let _guard = self.writer.lock();
        let mut hosts = Vec::clone(&self.hosts.load());
        hosts.push(host);
        hosts.sort_by_key(|h| std::cmp::Reverse(h.descriptor.specificity()));
        self.hosts.store(Arc::new(hosts));
    }

    /// Current snapshot, in selection order.
    pub fn snapshot(&self) -> Arc<Vec<Arc<VirtualHost>>> {
        self.hosts.load_full()
    }

    pub fn len(&self) -> usize {
        self.hosts.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for VirtualHosts {
    fn default() -> Self { Self::new() }
}

/// Picks the first (most specific) host matching the connection's local
/// address and the request's host name; `primary` when none does.
pub fn select<'a>(
    hosts: &'a [Arc<VirtualHost>],
    primary: &'a Arc<VirtualHost>,
    local: SocketAddr,
    host: &str,
) -> &'a Arc<VirtualHost> {
    hosts
        .iter()
        .find(|h| h.descriptor.matches(local.ip(), local.port(), host))
        .unwrap_or(primary)
}
