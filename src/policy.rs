//! Policy store: the immutable set of hosts, groups and permission rules.
//!
//! Built once from the configuration at startup and shared read-only
//! (`Arc<PolicyStore>`) by every session.

use std::collections::{BTreeSet, HashMap, HashSet};

use regex::Regex;
use thiserror::Error;
use tracing::warn;

use crate::config::{GatewayConfig, GroupConfig, HostConfig, PermissionConfig};

/// Structural problems in the policy. All of them are fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("duplicate host name '{0}'")]
    DuplicateHost(String),

    #[error("duplicate group name '{0}'")]
    DuplicateGroup(String),

    #[error("invalid host pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("host '{host}' references unknown proxy '{proxy}'")]
    UnknownProxy { host: String, proxy: String },

    #[error("proxy chain of host '{host}' loops back to '{revisited}'")]
    ProxyCycle { host: String, revisited: String },
}

/// An internal host the gateway can connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    /// Key identifier, interpolated into the client key path template.
    pub sshkey: String,
    /// Name of the host this one is reached through.
    pub proxy: Option<String>,
}

impl From<HostConfig> for Host {
    fn from(c: HostConfig) -> Self {
        Self {
            name: c.name,
            hostname: c.hostname,
            port: c.port,
            username: c.username,
            sshkey: c.sshkey,
            proxy: c.proxy.filter(|p| !p.is_empty()),
        }
    }
}

/// A named set of gateway usernames.
#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    pub users: BTreeSet<String>,
}

impl Group {
    pub fn new(name: impl Into<String>, users: impl IntoIterator<Item = String>) -> Self {
        Self {
            name: name.into(),
            users: users.into_iter().collect(),
        }
    }

    pub fn contains(&self, username: &str) -> bool {
        self.users.contains(username)
    }
}

impl From<GroupConfig> for Group {
    fn from(c: GroupConfig) -> Self {
        Self::new(c.name, c.users)
    }
}

/// Grants every member of `groups` the hosts whose name matches one of the
/// patterns.
///
/// Patterns are anchored at the start of the host name only: `db` matches
/// `db1` and `db-replica`. Write `^db1$` for an exact name.
#[derive(Debug, Clone)]
pub struct Permission {
    pub groups: BTreeSet<String>,
    patterns: Vec<Regex>,
}

impl Permission {
    pub fn new(
        groups: impl IntoIterator<Item = String>,
        hostnames: &[String],
    ) -> Result<Self, PolicyError> {
        let patterns = hostnames
            .iter()
            .map(|p| compile_pattern(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            groups: groups.into_iter().collect(),
            patterns,
        })
    }

    pub fn from_config(c: PermissionConfig) -> Result<Self, PolicyError> {
        Self::new(c.groups, &c.hostnames)
    }

    /// Whether the rule names `group`.
    pub fn applies_to(&self, group: &str) -> bool {
        self.groups.contains(group)
    }

    /// Whether any pattern matches `host_name`.
    pub fn matches(&self, host_name: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(host_name))
    }

    pub fn patterns(&self) -> &[Regex] {
        &self.patterns
    }
}

/// Compile a host pattern with match-from-start semantics.
fn compile_pattern(pattern: &str) -> Result<Regex, PolicyError> {
    Regex::new(&format!("^(?:{})", pattern)).map_err(|e| PolicyError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// The closed-world authorization dataset.
#[derive(Debug)]
pub struct PolicyStore {
    hosts: Vec<Host>,
    index: HashMap<String, usize>,
    groups: Vec<Group>,
    permissions: Vec<Permission>,
}

impl PolicyStore {
    /// Build and validate a store. Fails on duplicates and on proxy
    /// references that are unknown or cyclic.
    pub fn new(
        hosts: Vec<Host>,
        groups: Vec<Group>,
        permissions: Vec<Permission>,
    ) -> Result<Self, PolicyError> {
        let store = Self::index(hosts, groups, permissions)?;

        for host in &store.hosts {
            store.proxy_chain(host)?;
        }

        for perm in &store.permissions {
            for group in &perm.groups {
                if store.group(group).is_none() {
                    warn!("Permission references unknown group '{}'", group);
                }
            }
        }

        Ok(store)
    }

    /// Normalize the raw configuration records into a store.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, PolicyError> {
        let hosts = config.hosts.iter().cloned().map(Host::from).collect();
        let groups = config.groups.iter().cloned().map(Group::from).collect();
        let permissions = config
            .permissions
            .iter()
            .cloned()
            .map(Permission::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(hosts, groups, permissions)
    }

    /// Index hosts and groups without checking proxy references.
    pub(crate) fn index(
        hosts: Vec<Host>,
        groups: Vec<Group>,
        permissions: Vec<Permission>,
    ) -> Result<Self, PolicyError> {
        let mut index = HashMap::with_capacity(hosts.len());
        for (i, host) in hosts.iter().enumerate() {
            if index.insert(host.name.clone(), i).is_some() {
                return Err(PolicyError::DuplicateHost(host.name.clone()));
            }
        }

        let mut group_names = HashSet::with_capacity(groups.len());
        for group in &groups {
            if !group_names.insert(group.name.as_str()) {
                return Err(PolicyError::DuplicateGroup(group.name.clone()));
            }
        }

        Ok(Self {
            hosts,
            index,
            groups,
            permissions,
        })
    }

    /// All hosts, in configuration order.
    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn host(&self, name: &str) -> Option<&Host> {
        self.index.get(name).map(|&i| &self.hosts[i])
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn permissions(&self) -> &[Permission] {
        &self.permissions
    }

    /// Resolve the hops needed to reach `host`, outermost proxy first and
    /// `host` itself last.
    ///
    /// Walks `proxy` references iteratively; a host seen twice is a cycle.
    pub fn proxy_chain<'a>(&'a self, host: &'a Host) -> Result<Vec<&'a Host>, PolicyError> {
        let mut chain = vec![host];
        let mut visited = HashSet::from([host.name.as_str()]);
        let mut current = host;

        while let Some(proxy) = current.proxy.as_deref() {
            let next = self.host(proxy).ok_or_else(|| PolicyError::UnknownProxy {
                host: current.name.clone(),
                proxy: proxy.to_string(),
            })?;
            if !visited.insert(next.name.as_str()) {
                return Err(PolicyError::ProxyCycle {
                    host: host.name.clone(),
                    revisited: next.name.clone(),
                });
            }
            chain.push(next);
            current = next;
        }

        chain.reverse();
        Ok(chain)
    }
}
