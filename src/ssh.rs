//! SSH server implementation using russh.
//!
//! Handles:
//! - Password, public key and `none` authentication against [`Credentials`]
//! - Session channels running the interactive relay (shell only)
//! - Terminal type and size tracking for the remote shells

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use russh::keys::{PrivateKey, PublicKey};
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodKind, MethodSet};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::authz;
use crate::broker::{Broker, PtyInfo};
use crate::config::GatewayConfig;
use crate::credentials::{Credentials, fingerprint};
use crate::relay::{self, ClientIo, Terminal};
use crate::transport::SshConnector;

/// Shared state for the SSH server.
pub struct ServerState {
    pub config: Arc<GatewayConfig>,
    pub credentials: Arc<Credentials>,
    pub broker: Arc<Broker<SshConnector>>,
}

/// Per-connection handler state.
pub struct ConnectionHandler {
    server: Arc<ServerState>,

    /// Client's socket address.
    peer_addr: SocketAddr,

    /// Authenticated gateway username.
    username: Option<String>,

    /// Open session channels.
    channels: HashMap<ChannelId, ClientChannel>,
}

struct ClientChannel {
    /// Client input for the relay task. `None` after EOF.
    input_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    /// Latest terminal parameters, `None` until a PTY is requested.
    pty_tx: watch::Sender<Option<PtyInfo>>,
    task: Option<JoinHandle<()>>,
}

/// The client side of a session channel, as seen by the relay.
struct ChannelIo {
    channel_id: ChannelId,
    handle: Handle,
    input_rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ClientChannel {
    fn new() -> Self {
        let (pty_tx, _) = watch::channel(None);
        Self {
            input_tx: None,
            pty_tx,
            task: None,
        }
    }

    /// Queue client input for the relay task without waiting on it. The
    /// relay may itself be blocked writing to this connection.
    fn push_input(&self, data: &[u8]) -> bool {
        self.input_tx
            .as_ref()
            .is_some_and(|tx| tx.send(data.to_vec()).is_ok())
    }
}

impl ClientIo for ChannelIo {
    async fn recv(&mut self) -> Option<Vec<u8>> {
        self.input_rx.recv().await
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.handle
            .data(self.channel_id, CryptoVec::from_slice(data))
            .await
            .map_err(|_| anyhow!("client channel {:?} is closed", self.channel_id))
    }

    async fn send_stderr(&mut self, data: &[u8]) -> Result<()> {
        self.handle
            .extended_data(self.channel_id, 1, CryptoVec::from_slice(data))
            .await
            .map_err(|_| anyhow!("client channel {:?} is closed", self.channel_id))
    }
}

fn reject() -> Auth {
    Auth::Reject {
        proceed_with_methods: None,
        partial_success: false,
    }
}

impl ConnectionHandler {
    fn new(server: Arc<ServerState>, peer_addr: SocketAddr) -> Self {
        Self {
            server,
            peer_addr,
            username: None,
            channels: HashMap::new(),
        }
    }

    fn accept(&mut self, user: &str, method: &str) -> Auth {
        info!(
            "User '{}' authenticated from {} via {}",
            user, self.peer_addr, method
        );
        self.username = Some(user.to_string());
        Auth::Accept
    }
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if self.server.credentials.requires_auth(user) {
            debug!("'none' auth refused for '{}'", user);
            return Ok(reject());
        }
        Ok(self.accept(user, "none"))
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        // Hash verification is CPU bound.
        let server = self.server.clone();
        let (name, pass) = (user.to_string(), password.to_string());
        let ok = tokio::task::spawn_blocking(move || {
            server.credentials.verify_password(&name, &pass)
        })
        .await?;

        if !ok {
            warn!("Password rejected for '{}' from {}", user, self.peer_addr);
            return Ok(reject());
        }
        Ok(self.accept(user, "password"))
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!(
            "Public key {} offered by '{}' from {}",
            fingerprint(public_key),
            user,
            self.peer_addr
        );
        if self.server.credentials.is_authorized_key(public_key) {
            Ok(Auth::Accept)
        } else {
            Ok(reject())
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fp = fingerprint(public_key);
        if !self.server.credentials.is_authorized_key(public_key) {
            warn!("Public key {} rejected for '{}'", fp, user);
            return Ok(reject());
        }
        Ok(self.accept(user, &format!("public key {}", fp)))
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("Session channel opened: {:?}", channel.id());
        self.channels.insert(channel.id(), ClientChannel::new());
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "PTY request: channel={:?}, term={}, cols={}, rows={}",
            channel_id, term, col_width, row_height
        );
        let Some(client) = self.channels.get(&channel_id) else {
            session.channel_failure(channel_id)?;
            return Ok(());
        };
        let term = if term.is_empty() { "xterm-256color" } else { term };
        client.pty_tx.send_replace(Some(PtyInfo {
            term: term.to_string(),
            cols: col_width,
            rows: row_height,
        }));
        session.channel_success(channel_id)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let username = self
            .username
            .clone()
            .ok_or_else(|| anyhow!("Not authenticated"))?;
        let Some(client) = self.channels.get_mut(&channel_id) else {
            session.channel_failure(channel_id)?;
            return Ok(());
        };
        if client.task.is_some() {
            warn!("Second shell request on channel {:?} ignored", channel_id);
            session.channel_failure(channel_id)?;
            return Ok(());
        }

        let broker = self.server.broker.clone();
        let hosts: Vec<_> = authz::reachable_hosts(broker.policy(), &username)
            .into_iter()
            .cloned()
            .collect();
        info!(
            "Shell for '{}' on channel {:?}: {} reachable host(s)",
            username,
            channel_id,
            hosts.len()
        );
        if hosts.is_empty() {
            warn!("User '{}' is not authorized for any host", username);
        }

        let (input_tx, input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        client.input_tx = Some(input_tx);

        let pty = client.pty_tx.subscribe();
        let has_pty = pty.borrow().is_some();
        let handle = session.handle();
        let io = ChannelIo {
            channel_id,
            handle: handle.clone(),
            input_rx,
        };
        let banner = self.server.config.banner_for(&username);

        client.task = Some(tokio::spawn(async move {
            let session =
                relay::Session::new(username.clone(), hosts, broker, Terminal::new(io, has_pty), pty);
            match session.run(&banner).await {
                Ok(_) => info!("Session of '{}' closed", username),
                Err(e) => debug!("Session of '{}' ended: {:#}", username, e),
            }

            let _ = handle.exit_status_request(channel_id, 0).await;
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
        }));

        session.channel_success(channel_id)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!(
            "Exec request on channel {:?} refused: {}",
            channel_id,
            String::from_utf8_lossy(data)
        );
        session.channel_failure(channel_id)?;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel_id: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Window change: channel={:?}, cols={}, rows={}",
            channel_id, col_width, row_height
        );
        if let Some(client) = self.channels.get(&channel_id) {
            client.pty_tx.send_modify(|pty| {
                if let Some(pty) = pty {
                    pty.cols = col_width;
                    pty.rows = row_height;
                }
            });
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(client) = self.channels.get(&channel_id) {
            if !client.push_input(data) {
                debug!("Dropping {} byte(s) for {:?}", data.len(), channel_id);
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel EOF: {:?}", channel_id);
        // The relay sees end of input once the sender is gone.
        if let Some(client) = self.channels.get_mut(&channel_id) {
            client.input_tx = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel closed: {:?}", channel_id);
        if let Some(mut client) = self.channels.remove(&channel_id) {
            client.input_tx = None;
            if let Some(task) = client.task.take() {
                if !task.is_finished() {
                    task.abort();
                }
            }
        }
        Ok(())
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        for client in self.channels.values() {
            if let Some(task) = &client.task {
                task.abort();
            }
        }
    }
}

/// Run the SSH server until interrupted.
pub async fn run_server(
    config: Arc<GatewayConfig>,
    credentials: Arc<Credentials>,
    broker: Arc<Broker<SshConnector>>,
) -> Result<()> {
    let keys = load_host_keys(&config.host_key_paths())?;

    let russh_config = Arc::new(russh::server::Config {
        methods: MethodSet::from(
            &[MethodKind::None, MethodKind::Password, MethodKind::PublicKey][..],
        ),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys,
        ..Default::default()
    });

    let server_state = Arc::new(ServerState {
        config: config.clone(),
        credentials,
        broker,
    });

    let (host, port) = config.bind_addr();
    let listener = TcpListener::bind((host, port))
        .await
        .with_context(|| format!("Failed to listen on {}:{}", host, port))?;
    info!("SSH server listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => accepted.context("Failed to accept connection")?,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        };
        info!("SSH connection received from {}", peer_addr);

        let server_state_clone = server_state.clone();
        let russh_config_clone = russh_config.clone();

        tokio::spawn(async move {
            let handler = ConnectionHandler::new(server_state_clone, peer_addr);
            match russh::server::run_stream(russh_config_clone, stream, handler).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        warn!("SSH session error from {}: {}", peer_addr, e);
                    }
                }
                Err(e) => {
                    warn!("SSH connection error from {}: {}", peer_addr, e);
                }
            }
            info!("SSH connection closed by {}", peer_addr);
        });
    }
}

/// Load every configured host key that exists. Without any, generate an
/// ephemeral Ed25519 key.
fn load_host_keys(paths: &[PathBuf]) -> Result<Vec<PrivateKey>> {
    use russh::keys::ssh_key::Algorithm;
    use russh::keys::ssh_key::rand_core::OsRng;

    let mut keys = Vec::new();
    for path in paths.iter().filter(|p| p.exists()) {
        info!("Loading host key from {}", path.display());
        let key = russh::keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {}", path.display()))?;
        keys.push(key);
    }

    if keys.is_empty() {
        warn!("No server host key found, generating an ephemeral Ed25519 key");
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .context("Failed to generate host key")?;
        keys.push(key);
    }
    Ok(keys)
}
