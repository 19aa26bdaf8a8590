//! russh client side: the [`Connector`] used in production.
//!
//! Nested hops use `Handle::channel_open_direct_tcpip` on the previous hop
//! and run a new SSH session over it with `russh::client::connect_stream`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use russh::client::{self, Handle, Msg};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelMsg, Disconnect};
use tracing::{debug, info, warn};

use crate::broker::{Connector, HopError, PtyInfo, RemoteShell, ShellOutput};
use crate::config::{GatewayConfig, HostKeyCheck};
use crate::credentials::fingerprint;
use crate::policy::Host;

/// Client handler enforcing the configured host key policy.
pub struct HopHandler {
    host: String,
    port: u16,
    check: HostKeyCheck,
    known_hosts: PathBuf,
}

impl client::Handler for HopHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fp = fingerprint(server_public_key);
        match self.check {
            HostKeyCheck::None => {
                debug!(
                    "Accepting host key {} for {}:{} without verification",
                    fp, self.host, self.port
                );
                Ok(true)
            }
            HostKeyCheck::Strict => {
                let known = russh::keys::check_known_hosts_path(
                    &self.host,
                    self.port,
                    server_public_key,
                    &self.known_hosts,
                )?;
                if !known {
                    warn!(
                        "Host key {} for {}:{} is not in {}",
                        fp,
                        self.host,
                        self.port,
                        self.known_hosts.display()
                    );
                }
                Ok(known)
            }
            HostKeyCheck::AcceptNew => {
                if russh::keys::check_known_hosts_path(
                    &self.host,
                    self.port,
                    server_public_key,
                    &self.known_hosts,
                )? {
                    return Ok(true);
                }
                info!(
                    "Learning host key {} for {}:{} into {}",
                    fp,
                    self.host,
                    self.port,
                    self.known_hosts.display()
                );
                russh::keys::known_hosts::learn_known_hosts_path(
                    &self.host,
                    self.port,
                    server_public_key,
                    &self.known_hosts,
                )?;
                Ok(true)
            }
        }
    }
}

/// One authenticated SSH session to an internal host.
pub struct HopSession {
    pub name: String,
    handle: Handle<HopHandler>,
}

/// Shell channel on the target host. Stdout and stderr are kept apart.
pub struct HopShell {
    name: String,
    channel: Channel<Msg>,
}

impl RemoteShell for HopShell {
    async fn recv(&mut self) -> anyhow::Result<Option<ShellOutput>> {
        while let Some(msg) = self.channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => return Ok(Some(ShellOutput::Stdout(data.to_vec()))),
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    return Ok(Some(ShellOutput::Stderr(data.to_vec())));
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    debug!("Shell on {} exited with {}", self.name, exit_status);
                }
                ChannelMsg::Eof | ChannelMsg::Close => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }

    async fn send(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.channel
            .data(data)
            .await
            .with_context(|| format!("Write to shell on {} failed", self.name))
    }

    async fn resize(&mut self, cols: u32, rows: u32) -> anyhow::Result<()> {
        self.channel
            .window_change(cols, rows, 0, 0)
            .await
            .with_context(|| format!("Window change on {} failed", self.name))
    }

    async fn eof(&mut self) -> anyhow::Result<()> {
        self.channel
            .eof()
            .await
            .with_context(|| format!("EOF to shell on {} failed", self.name))
    }
}

/// Opens hops with russh using the gateway configuration.
pub struct SshConnector {
    config: Arc<GatewayConfig>,
    client_config: Arc<client::Config>,
}

impl SshConnector {
    pub fn new(config: Arc<GatewayConfig>) -> Self {
        let client_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };
        Self {
            config,
            client_config: Arc::new(client_config),
        }
    }

    fn handler(&self, host: &Host) -> HopHandler {
        HopHandler {
            host: host.hostname.clone(),
            port: host.port,
            check: self.config.host_key_check,
            known_hosts: self.config.known_hosts_path(),
        }
    }

    fn load_key(&self, host: &Host) -> Result<PrivateKey, HopError> {
        let path = self.config.client_key_path(&host.sshkey);
        debug!("Loading key {} for {}", path.display(), host.name);
        russh::keys::load_secret_key(&path, None).map_err(|source| HopError::Key {
            host: host.name.clone(),
            path,
            source,
        })
    }

    async fn authenticate(
        &self,
        mut handle: Handle<HopHandler>,
        host: &Host,
        key: PrivateKey,
    ) -> Result<HopSession, HopError> {
        let connect_err = |source| HopError::Connect {
            host: host.name.clone(),
            source,
        };

        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .map_err(connect_err)?
            .flatten();
        let result = handle
            .authenticate_publickey(
                host.username.clone(),
                PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
            )
            .await
            .map_err(connect_err)?;

        if !result.success() {
            return Err(HopError::AuthRejected {
                host: host.name.clone(),
                user: host.username.clone(),
            });
        }

        info!("Authenticated to {} as {}", host.name, host.username);
        Ok(HopSession {
            name: host.name.clone(),
            handle,
        })
    }
}

impl Connector for SshConnector {
    type Transport = HopSession;
    type Shell = HopShell;

    async fn connect_direct(&self, host: &Host) -> Result<HopSession, HopError> {
        let key = self.load_key(host)?;
        info!(
            "Connecting to {} at {}:{}",
            host.name, host.hostname, host.port
        );

        let handle = tokio::time::timeout(
            self.config.connect_timeout(),
            client::connect(
                self.client_config.clone(),
                (host.hostname.as_str(), host.port),
                self.handler(host),
            ),
        )
        .await
        .map_err(|_| HopError::Timeout {
            host: host.name.clone(),
        })?
        .map_err(|source| HopError::Connect {
            host: host.name.clone(),
            source,
        })?;

        self.authenticate(handle, host, key).await
    }

    async fn connect_tunneled(
        &self,
        via: &HopSession,
        host: &Host,
    ) -> Result<HopSession, HopError> {
        let key = self.load_key(host)?;
        info!(
            "Opening tunnel from {} to {} at {}:{}",
            via.name, host.name, host.hostname, host.port
        );

        let timeout = self.config.connect_timeout();
        let timed_out = || HopError::Timeout {
            host: host.name.clone(),
        };

        let channel = tokio::time::timeout(
            timeout,
            via.handle.channel_open_direct_tcpip(
                host.hostname.clone(),
                u32::from(host.port),
                "127.0.0.1",
                0,
            ),
        )
        .await
        .map_err(|_| timed_out())?
        .map_err(|source| HopError::Tunnel {
            via: via.name.clone(),
            host: host.name.clone(),
            source,
        })?;

        let handle = tokio::time::timeout(
            timeout,
            client::connect_stream(
                self.client_config.clone(),
                channel.into_stream(),
                self.handler(host),
            ),
        )
        .await
        .map_err(|_| timed_out())?
        .map_err(|source| HopError::Connect {
            host: host.name.clone(),
            source,
        })?;

        self.authenticate(handle, host, key).await
    }

    async fn open_shell(
        &self,
        transport: &HopSession,
        pty: Option<&PtyInfo>,
    ) -> anyhow::Result<HopShell> {
        let channel = transport
            .handle
            .channel_open_session()
            .await
            .with_context(|| format!("Failed to open session channel on {}", transport.name))?;

        if let Some(pty) = pty {
            channel
                .request_pty(false, &pty.term, pty.cols, pty.rows, 0, 0, &[])
                .await
                .with_context(|| format!("PTY request failed on {}", transport.name))?;
        }
        channel
            .request_shell(false)
            .await
            .with_context(|| format!("Shell request failed on {}", transport.name))?;

        debug!("Interactive shell started on {}", transport.name);
        Ok(HopShell {
            name: transport.name.clone(),
            channel,
        })
    }

    async fn disconnect(&self, transport: HopSession) {
        debug!("Disconnecting from {}", transport.name);
        if let Err(e) = transport
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("Disconnect from {} failed: {}", transport.name, e);
        }
    }
}
