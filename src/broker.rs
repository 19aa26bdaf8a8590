//! Connection broker: opens the chain of SSH sessions needed to reach a host.
//!
//! ```text
//! gateway --SSH--> [proxy 1] --direct-tcpip--> [proxy 2] --direct-tcpip--> ... --> [target]
//! ```
//!
//! The first hop is a direct connection; every following hop is a nested
//! SSH session running over a `direct-tcpip` channel of the previous one.
//! If any hop fails, every session already opened for the chain is
//! disconnected before the error is returned.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::policy::{Host, PolicyError, PolicyStore};

/// Terminal parameters the client negotiated with the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyInfo {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

/// Why a single hop could not be established.
#[derive(Debug, Error)]
pub enum HopError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("failed to load key {} for {host}", .path.display())]
    Key {
        host: String,
        path: PathBuf,
        #[source]
        source: russh::keys::Error,
    },

    #[error("connection to {host} timed out")]
    Timeout { host: String },

    #[error("connection to {host} failed")]
    Connect {
        host: String,
        #[source]
        source: russh::Error,
    },

    #[error("cannot open tunnel from {via} to {host}")]
    Tunnel {
        via: String,
        host: String,
        #[source]
        source: russh::Error,
    },

    #[error("authentication to {host} as '{user}' was rejected")]
    AuthRejected { host: String, user: String },
}

/// A chain could not be established. The failing hop is the `source()`.
#[derive(Debug, Error)]
#[error("cannot establish connection to {target}")]
pub struct BrokerError {
    pub target: String,
    #[source]
    pub cause: HopError,
}

impl BrokerError {
    /// Whether the failure comes from the policy rather than the network.
    pub fn is_config(&self) -> bool {
        matches!(self.cause, HopError::Policy(_))
    }
}

/// A chunk of output from a remote shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellOutput {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// An interactive shell running on the target host.
pub trait RemoteShell: Send + 'static {
    /// Next chunk of output, `Ok(None)` once the remote side ended the
    /// session. Must be cancel safe.
    fn recv(&mut self) -> impl Future<Output = anyhow::Result<Option<ShellOutput>>> + Send;

    fn send(&mut self, data: &[u8]) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Forward a client terminal resize.
    fn resize(&mut self, cols: u32, rows: u32)
    -> impl Future<Output = anyhow::Result<()>> + Send;

    /// No more client input will follow.
    fn eof(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Opens and closes individual hops. Implemented over russh in
/// [`crate::transport`]; tests use an in-memory implementation.
pub trait Connector: Send + Sync + 'static {
    /// One authenticated SSH session.
    type Transport: Send + Sync + 'static;

    /// Interactive shell on a transport.
    type Shell: RemoteShell;

    /// Connect straight to `host` over the network.
    fn connect_direct(
        &self,
        host: &Host,
    ) -> impl Future<Output = Result<Self::Transport, HopError>> + Send;

    /// Connect to `host` through a tunnel opened on `via`.
    fn connect_tunneled(
        &self,
        via: &Self::Transport,
        host: &Host,
    ) -> impl Future<Output = Result<Self::Transport, HopError>> + Send;

    /// Start an interactive shell, with a PTY if the client has one.
    fn open_shell(
        &self,
        transport: &Self::Transport,
        pty: Option<&PtyInfo>,
    ) -> impl Future<Output = anyhow::Result<Self::Shell>> + Send;

    fn disconnect(&self, transport: Self::Transport) -> impl Future<Output = ()> + Send;
}

/// A live chain of hops. The last one is the target host.
///
/// Dropping it drops every transport; [`Broker::close`] disconnects them
/// explicitly, innermost first.
pub struct Connection<T> {
    jumps: Vec<T>,
    target: T,
}

impl<T> Connection<T> {
    pub fn target(&self) -> &T {
        &self.target
    }

    /// Number of transports in the chain, target included.
    pub fn hop_count(&self) -> usize {
        self.jumps.len() + 1
    }
}

pub struct Broker<C> {
    policy: Arc<PolicyStore>,
    connector: C,
}

impl<C: Connector> Broker<C> {
    pub fn new(policy: Arc<PolicyStore>, connector: C) -> Self {
        Self { policy, connector }
    }

    pub fn policy(&self) -> &PolicyStore {
        &self.policy
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Establish every hop needed to reach `host`.
    pub async fn connect(&self, host: &Host) -> Result<Connection<C::Transport>, BrokerError> {
        let fail = |cause: HopError| BrokerError {
            target: host.name.clone(),
            cause,
        };

        let chain = self.policy.proxy_chain(host).map_err(|e| fail(e.into()))?;
        // The chain always ends with `host` itself.
        let proxies = chain.split_last().map(|(_, p)| p).unwrap_or_default();
        info!(
            "Connecting to {} ({}@{}:{}) through {} proxy hop(s)",
            host.name,
            host.username,
            host.hostname,
            host.port,
            proxies.len()
        );

        let mut jumps: Vec<C::Transport> = Vec::with_capacity(proxies.len());

        for hop in proxies {
            match self.open_hop(jumps.last(), hop).await {
                Ok(transport) => {
                    debug!("Hop {} established", hop.name);
                    jumps.push(transport);
                }
                Err(e) => {
                    self.release(jumps).await;
                    return Err(fail(e));
                }
            }
        }

        let target = match self.open_hop(jumps.last(), host).await {
            Ok(transport) => transport,
            Err(e) => {
                self.release(jumps).await;
                return Err(fail(e));
            }
        };
        info!("Connection to {} established", host.name);
        Ok(Connection { jumps, target })
    }

    async fn open_hop(
        &self,
        via: Option<&C::Transport>,
        hop: &Host,
    ) -> Result<C::Transport, HopError> {
        match via {
            None => self.connector.connect_direct(hop).await,
            Some(via) => self.connector.connect_tunneled(via, hop).await,
        }
    }

    /// Disconnect every hop of a chain, innermost first.
    pub async fn close(&self, connection: Connection<C::Transport>) {
        let Connection { mut jumps, target } = connection;
        jumps.push(target);
        self.release(jumps).await;
    }

    async fn release(&self, mut transports: Vec<C::Transport>) {
        while let Some(transport) = transports.pop() {
            self.connector.disconnect(transport).await;
        }
    }
}
