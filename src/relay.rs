//! Interactive relay: the per-session host menu and terminal passthrough.
//!
//! A session moves through explicit [`SessionState`]s:
//!
//! ```text
//! Authenticating -> MenuLoop -> Connecting(i) -> Relaying(i) -> MenuLoop -> ... -> Closed
//! ```
//!
//! Connect and relay failures always lead back to `MenuLoop`. Only a quit
//! at the menu or the client going away closes the session.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broker::{Broker, Connection, Connector, PtyInfo, RemoteShell, ShellOutput};
use crate::policy::Host;

const PROMPT: &str = "Please enter a server number(q to quit): ";

/// Byte-level access to the client's session channel.
pub trait ClientIo: Send {
    /// Next chunk of client input. `None` once the client stops sending.
    fn recv(&mut self) -> impl Future<Output = Option<Vec<u8>>> + Send;

    fn send(&mut self, data: &[u8]) -> impl Future<Output = Result<()>> + Send;

    fn send_stderr(&mut self, data: &[u8]) -> impl Future<Output = Result<()>> + Send;
}

/// The client's terminal as seen by the gateway.
///
/// Lines are edited locally and echoed back when the client has a PTY and
/// echo is on. Raw reads pass bytes through untouched.
pub struct Terminal<C> {
    io: C,
    pty: bool,
    echo: bool,
    pending: VecDeque<u8>,
    /// Last line ended with CR; swallow a following LF.
    skip_lf: bool,
}

impl<C: ClientIo> Terminal<C> {
    pub fn new(io: C, pty: bool) -> Self {
        Self {
            io,
            pty,
            echo: true,
            pending: VecDeque::new(),
            skip_lf: false,
        }
    }

    pub fn set_echo(&mut self, on: bool) {
        self.echo = on;
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.io.send(data).await
    }

    pub async fn write_stderr(&mut self, data: &[u8]) -> Result<()> {
        self.io.send_stderr(data).await
    }

    /// Write text, translating `\n` to `\r\n`.
    pub async fn write_text(&mut self, text: &str) -> Result<()> {
        self.write(text.replace('\n', "\r\n").as_bytes()).await
    }

    /// Read one edited line. `None` on end of input, Ctrl-C, or Ctrl-D on
    /// an empty line.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let mut line: Vec<u8> = Vec::new();
        loop {
            if self.pending.is_empty() {
                match self.io.recv().await {
                    Some(chunk) => self.pending.extend(chunk),
                    None if line.is_empty() => return Ok(None),
                    None => return Ok(Some(String::from_utf8_lossy(&line).into_owned())),
                }
            }

            let mut echo = Vec::new();
            let mut done = None;
            while let Some(b) = self.pending.pop_front() {
                if std::mem::take(&mut self.skip_lf) && b == b'\n' {
                    continue;
                }
                match b {
                    b'\r' | b'\n' => {
                        self.skip_lf = b == b'\r';
                        echo.extend_from_slice(b"\r\n");
                        done = Some(Some(String::from_utf8_lossy(&line).into_owned()));
                        break;
                    }
                    0x7f | 0x08 => {
                        if line.pop().is_some() {
                            echo.extend_from_slice(b"\x08 \x08");
                        }
                    }
                    0x03 => {
                        echo.extend_from_slice(b"^C\r\n");
                        done = Some(None);
                        break;
                    }
                    0x04 if line.is_empty() => {
                        done = Some(None);
                        break;
                    }
                    b if b < 0x20 => {}
                    b => {
                        line.push(b);
                        echo.push(b);
                    }
                }
            }

            if self.echo && self.pty && !echo.is_empty() {
                self.write(&echo).await?;
            }
            if let Some(result) = done {
                return Ok(result);
            }
        }
    }

    /// Next raw input chunk; bytes left over from line mode come first.
    pub async fn read_raw(&mut self) -> Option<Vec<u8>> {
        if std::mem::take(&mut self.skip_lf) && self.pending.front() == Some(&b'\n') {
            self.pending.pop_front();
        }
        if !self.pending.is_empty() {
            return Some(self.pending.drain(..).collect());
        }
        self.io.recv().await
    }
}

/// What the user typed at the menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuChoice {
    Quit,
    Select(usize),
    /// Not a number, or out of range. The menu is shown again.
    Invalid,
}

impl MenuChoice {
    pub fn parse(line: &str, host_count: usize) -> Self {
        let line = line.trim();
        if line == "q" || line == "quit" {
            return MenuChoice::Quit;
        }
        match line.parse::<usize>() {
            Ok(i) if i < host_count => MenuChoice::Select(i),
            _ => MenuChoice::Invalid,
        }
    }
}

/// Menu listing with stable indices.
pub fn render_menu(hosts: &[Host]) -> String {
    let mut out = String::from("\n");
    for (i, host) in hosts.iter().enumerate() {
        out.push_str(&format!(
            "{}) {} {}@{}\n",
            i, host.name, host.username, host.hostname
        ));
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Authenticating,
    MenuLoop,
    Connecting(usize),
    Relaying(usize),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Authenticated,
    Menu(MenuChoice),
    Connected,
    ConnectFailed,
    RelayEnded,
    RelayFailed,
    ClientGone,
}

impl SessionState {
    pub fn on(self, event: SessionEvent) -> SessionState {
        match (self, event) {
            (SessionState::Closed, _) | (_, SessionEvent::ClientGone) => SessionState::Closed,
            (SessionState::Authenticating, SessionEvent::Authenticated) => SessionState::MenuLoop,
            (SessionState::MenuLoop, SessionEvent::Menu(MenuChoice::Quit)) => SessionState::Closed,
            (SessionState::MenuLoop, SessionEvent::Menu(MenuChoice::Select(i))) => {
                SessionState::Connecting(i)
            }
            (SessionState::MenuLoop, SessionEvent::Menu(MenuChoice::Invalid)) => {
                SessionState::MenuLoop
            }
            (SessionState::Connecting(i), SessionEvent::Connected) => SessionState::Relaying(i),
            (SessionState::Connecting(_), SessionEvent::ConnectFailed) => SessionState::MenuLoop,
            (SessionState::Relaying(_), SessionEvent::RelayEnded | SessionEvent::RelayFailed) => {
                SessionState::MenuLoop
            }
            (state, event) => {
                debug!("Ignoring {:?} in state {:?}", event, state);
                state
            }
        }
    }
}

/// How a relay phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    RemoteClosed,
    ClientGone,
}

/// Copy bytes both ways between the client and a remote shell until one
/// side ends. Terminal resizes are forwarded as they happen.
pub async fn relay<C, S>(
    term: &mut Terminal<C>,
    shell: &mut S,
    pty: &mut watch::Receiver<Option<PtyInfo>>,
) -> Result<RelayEnd>
where
    C: ClientIo,
    S: RemoteShell,
{
    enum Step {
        Remote(Result<Option<ShellOutput>>),
        Client(Option<Vec<u8>>),
        Resized(bool),
    }

    let mut watching = true;
    loop {
        let step = tokio::select! {
            output = shell.recv() => Step::Remote(output),
            input = term.read_raw() => Step::Client(input),
            changed = pty.changed(), if watching => Step::Resized(changed.is_ok()),
        };

        match step {
            Step::Remote(Ok(Some(ShellOutput::Stdout(data)))) => term.write(&data).await?,
            Step::Remote(Ok(Some(ShellOutput::Stderr(data)))) => term.write_stderr(&data).await?,
            Step::Remote(Ok(None)) => return Ok(RelayEnd::RemoteClosed),
            Step::Remote(Err(e)) => return Err(e).context("Read from remote shell failed"),
            Step::Client(Some(data)) => shell
                .send(&data)
                .await
                .context("Write to remote shell failed")?,
            Step::Client(None) => {
                if let Err(e) = shell.eof().await {
                    debug!("EOF to remote shell failed: {:#}", e);
                }
                return Ok(RelayEnd::ClientGone);
            }
            Step::Resized(false) => watching = false,
            Step::Resized(true) => {
                let size = pty.borrow_and_update().as_ref().map(|p| (p.cols, p.rows));
                if let Some((cols, rows)) = size {
                    if let Err(e) = shell.resize(cols, rows).await {
                        warn!("Resize to {}x{} failed: {:#}", cols, rows, e);
                    }
                }
            }
        }
    }
}

/// One client's interactive session.
pub struct Session<C, K: Connector> {
    username: String,
    hosts: Vec<Host>,
    broker: Arc<Broker<K>>,
    term: Terminal<C>,
    pty: watch::Receiver<Option<PtyInfo>>,
    state: SessionState,
}

impl<C: ClientIo, K: Connector> Session<C, K> {
    pub fn new(
        username: String,
        hosts: Vec<Host>,
        broker: Arc<Broker<K>>,
        term: Terminal<C>,
        pty: watch::Receiver<Option<PtyInfo>>,
    ) -> Self {
        Self {
            username,
            hosts,
            broker,
            term,
            pty,
            state: SessionState::Authenticating,
        }
    }

    fn advance(&mut self, event: SessionEvent) {
        let next = self.state.on(event);
        debug!(
            "Session '{}': {:?} --{:?}--> {:?}",
            self.username, self.state, event, next
        );
        self.state = next;
    }

    /// Drive the session until it closes. Errors mean the client channel
    /// can no longer be written to.
    pub async fn run(mut self, banner: &str) -> Result<SessionState> {
        let broker = Arc::clone(&self.broker);
        let menu = render_menu(&self.hosts);
        let mut live: Option<(Connection<K::Transport>, K::Shell)> = None;

        self.advance(SessionEvent::Authenticated);
        self.term
            .write_text(&format!(
                "{}\nYou are authorized to login into these servers:\n",
                banner
            ))
            .await?;

        loop {
            let event = match self.state {
                SessionState::Authenticating => SessionEvent::Authenticated,

                SessionState::MenuLoop => {
                    self.term.set_echo(true);
                    self.term.write_text(&menu).await?;
                    self.term.write_text(PROMPT).await?;
                    match self.term.read_line().await? {
                        None => SessionEvent::ClientGone,
                        Some(line) => {
                            SessionEvent::Menu(MenuChoice::parse(&line, self.hosts.len()))
                        }
                    }
                }

                SessionState::Connecting(i) => {
                    let host = self.hosts[i].clone();
                    self.term
                        .write_text(&format!("Connecting {} ...\n", host.name))
                        .await?;
                    self.term.set_echo(false);

                    let pty = self.pty.borrow_and_update().clone();
                    match open(&broker, &host, pty.as_ref()).await {
                        Ok(opened) => {
                            live = Some(opened);
                            SessionEvent::Connected
                        }
                        Err(e) => {
                            warn!(
                                "User '{}' cannot connect to {}: {:#}",
                                self.username, host.name, e
                            );
                            self.term.write_text("can not open connection\n").await?;
                            SessionEvent::ConnectFailed
                        }
                    }
                }

                SessionState::Relaying(i) => {
                    let Some((connection, mut shell)) = live.take() else {
                        warn!("Session '{}' lost its connection before relaying", self.username);
                        self.advance(SessionEvent::RelayFailed);
                        continue;
                    };
                    let name = &self.hosts[i].name;
                    info!("User '{}' relaying to {}", self.username, name);

                    let outcome = relay(&mut self.term, &mut shell, &mut self.pty).await;
                    drop(shell);
                    broker.close(connection).await;

                    match outcome {
                        Ok(RelayEnd::RemoteClosed) => {
                            info!("User '{}' left {}", self.username, name);
                            SessionEvent::RelayEnded
                        }
                        Ok(RelayEnd::ClientGone) => SessionEvent::ClientGone,
                        Err(e) => {
                            warn!(
                                "Relay between '{}' and {} failed: {:#}",
                                self.username, name, e
                            );
                            self.term
                                .write_text(&format!("\nconnection to {} lost\n", name))
                                .await?;
                            SessionEvent::RelayFailed
                        }
                    }
                }

                SessionState::Closed => return Ok(self.state),
            };
            self.advance(event);
        }
    }
}

/// Connect to `host` and start a shell on it.
async fn open<K: Connector>(
    broker: &Broker<K>,
    host: &Host,
    pty: Option<&PtyInfo>,
) -> Result<(Connection<K::Transport>, K::Shell)> {
    let connection = broker.connect(host).await?;
    match broker.connector().open_shell(connection.target(), pty).await {
        Ok(shell) => Ok((connection, shell)),
        Err(e) => {
            broker.close(connection).await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::broker::mock::{MockConnector, MockTransport};
    use crate::policy::PolicyStore;
    use crate::policy::fixtures::*;

    /// Client side driven by the test through channels. Output is tagged
    /// with whether it went to stderr.
    struct ScriptedClient {
        input: mpsc::UnboundedReceiver<Vec<u8>>,
        output: mpsc::UnboundedSender<(bool, Vec<u8>)>,
    }

    impl ClientIo for ScriptedClient {
        async fn recv(&mut self) -> Option<Vec<u8>> {
            self.input.recv().await
        }

        async fn send(&mut self, data: &[u8]) -> Result<()> {
            self.output
                .send((false, data.to_vec()))
                .map_err(|_| anyhow::anyhow!("client went away"))
        }

        async fn send_stderr(&mut self, data: &[u8]) -> Result<()> {
            self.output
                .send((true, data.to_vec()))
                .map_err(|_| anyhow::anyhow!("client went away"))
        }
    }

    struct Harness {
        input: Option<mpsc::UnboundedSender<Vec<u8>>>,
        output: mpsc::UnboundedReceiver<(bool, Vec<u8>)>,
        pty: Option<watch::Sender<Option<PtyInfo>>>,
        seen: String,
        seen_err: String,
    }

    impl Harness {
        fn type_str(&self, s: &str) {
            if let Some(tx) = &self.input {
                tx.send(s.as_bytes().to_vec()).unwrap();
            }
        }

        fn hang_up(&mut self) {
            self.input = None;
        }

        fn resize(&self, cols: u32, rows: u32) {
            let pty = self.pty.as_ref().unwrap();
            pty.send_modify(|p| {
                if let Some(p) = p {
                    p.cols = cols;
                    p.rows = rows;
                }
            });
        }

        /// Wait until stdout so far contains `needle` `times` times.
        async fn expect(&mut self, needle: &str, times: usize) {
            self.wait_for(false, needle, times).await
        }

        async fn expect_stderr(&mut self, needle: &str) {
            self.wait_for(true, needle, 1).await
        }

        async fn wait_for(&mut self, stderr: bool, needle: &str, times: usize) {
            let count = |h: &Harness| {
                let text = if stderr { &h.seen_err } else { &h.seen };
                text.matches(needle).count()
            };
            let wait = async {
                while count(self) < times {
                    match self.output.recv().await {
                        Some((true, chunk)) => {
                            self.seen_err.push_str(&String::from_utf8_lossy(&chunk))
                        }
                        Some((false, chunk)) => {
                            self.seen.push_str(&String::from_utf8_lossy(&chunk))
                        }
                        None => break,
                    }
                }
            };
            tokio::time::timeout(Duration::from_secs(5), wait)
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {:?} in {:?}", needle, self.seen));
            assert!(
                count(self) >= times,
                "missing {:?} in {:?} / {:?}",
                needle,
                self.seen,
                self.seen_err
            );
        }
    }

    fn terminal(pty: bool) -> (Terminal<ScriptedClient>, Harness) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let term = Terminal::new(
            ScriptedClient {
                input: in_rx,
                output: out_tx,
            },
            pty,
        );
        let harness = Harness {
            input: Some(in_tx),
            output: out_rx,
            pty: None,
            seen: String::new(),
            seen_err: String::new(),
        };
        (term, harness)
    }

    fn new_session(
        connector: MockConnector,
        pty: Option<PtyInfo>,
    ) -> (Session<ScriptedClient, MockConnector>, Harness, MockConnector) {
        let store = Arc::new(
            PolicyStore::new(
                vec![host("db1", Some("jump1")), host("jump1", None)],
                vec![],
                vec![],
            )
            .unwrap(),
        );
        let hosts = store.hosts().to_vec();
        let broker = Arc::new(Broker::new(store, connector.clone()));
        let (term, mut harness) = terminal(pty.is_some());
        let (pty_tx, pty_rx) = watch::channel(pty);
        harness.pty = Some(pty_tx);
        let session = Session::new("alice".to_string(), hosts, broker, term, pty_rx);
        (session, harness, connector)
    }

    fn xterm() -> PtyInfo {
        PtyInfo {
            term: "xterm-256color".to_string(),
            cols: 120,
            rows: 40,
        }
    }

    #[test]
    fn test_menu_choice_parse() {
        assert_eq!(MenuChoice::parse("q", 2), MenuChoice::Quit);
        assert_eq!(MenuChoice::parse(" quit ", 2), MenuChoice::Quit);
        assert_eq!(MenuChoice::parse("0", 2), MenuChoice::Select(0));
        assert_eq!(MenuChoice::parse("1\n", 2), MenuChoice::Select(1));
        assert_eq!(MenuChoice::parse("2", 2), MenuChoice::Invalid);
        assert_eq!(MenuChoice::parse("-1", 2), MenuChoice::Invalid);
        assert_eq!(MenuChoice::parse("one", 2), MenuChoice::Invalid);
        assert_eq!(MenuChoice::parse("", 2), MenuChoice::Invalid);
        assert_eq!(MenuChoice::parse("0", 0), MenuChoice::Invalid);
    }

    #[test]
    fn test_render_menu() {
        let menu = render_menu(&[host("db1", Some("jump1")), host("web1", None)]);
        assert_eq!(
            menu,
            "\n0) db1 ops@db1.internal\n1) web1 ops@web1.internal\n"
        );
        assert_eq!(render_menu(&[]), "\n");
    }

    #[test]
    fn test_state_transitions() {
        use SessionEvent as E;
        use SessionState as S;

        assert_eq!(S::Authenticating.on(E::Authenticated), S::MenuLoop);
        assert_eq!(S::MenuLoop.on(E::Menu(MenuChoice::Invalid)), S::MenuLoop);
        assert_eq!(S::MenuLoop.on(E::Menu(MenuChoice::Select(1))), S::Connecting(1));
        assert_eq!(S::MenuLoop.on(E::Menu(MenuChoice::Quit)), S::Closed);
        assert_eq!(S::MenuLoop.on(E::ClientGone), S::Closed);
        assert_eq!(S::Connecting(1).on(E::Connected), S::Relaying(1));
        assert_eq!(S::Connecting(1).on(E::ConnectFailed), S::MenuLoop);
        assert_eq!(S::Relaying(1).on(E::RelayEnded), S::MenuLoop);
        assert_eq!(S::Relaying(1).on(E::RelayFailed), S::MenuLoop);
        assert_eq!(S::Relaying(1).on(E::ClientGone), S::Closed);
        assert_eq!(S::Closed.on(E::Authenticated), S::Closed);
        // Out-of-order events leave the state alone.
        assert_eq!(S::MenuLoop.on(E::Connected), S::MenuLoop);
        assert_eq!(S::Connecting(0).on(E::Menu(MenuChoice::Quit)), S::Connecting(0));
    }

    #[tokio::test]
    async fn test_read_line_editing_and_echo() {
        let (mut term, mut h) = terminal(true);
        h.type_str("1x");
        h.type_str("\x7f2\r\nrest");
        assert_eq!(term.read_line().await.unwrap(), Some("12".to_string()));
        h.expect("2\r\n", 1).await;
        assert_eq!(h.seen, "1x\x08 \x082\r\n");

        // The leftover goes to raw reads, the LF after CR is swallowed.
        term.set_echo(false);
        assert_eq!(term.read_raw().await, Some(b"rest".to_vec()));
    }

    #[tokio::test]
    async fn test_read_line_without_pty_does_not_echo() {
        let (mut term, mut h) = terminal(false);
        h.type_str("0\n");
        assert_eq!(term.read_line().await.unwrap(), Some("0".to_string()));
        term.write_text("done\n").await.unwrap();
        h.expect("done", 1).await;
        assert_eq!(h.seen, "done\r\n");
    }

    #[tokio::test]
    async fn test_read_line_end_of_input() {
        let (mut term, mut h) = terminal(true);
        h.type_str("\x04");
        assert_eq!(term.read_line().await.unwrap(), None);

        h.type_str("\x03");
        assert_eq!(term.read_line().await.unwrap(), None);

        h.type_str("partial");
        h.hang_up();
        assert_eq!(term.read_line().await.unwrap(), Some("partial".to_string()));
        assert_eq!(term.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_quit_closes_session() {
        let (session, mut h, connector) = new_session(MockConnector::default(), Some(xterm()));
        h.type_str("q\r");
        let state = session.run("SSH Gateway, welcome alice!").await.unwrap();

        assert_eq!(state, SessionState::Closed);
        h.expect("Please enter a server number", 1).await;
        assert!(h.seen.starts_with("SSH Gateway, welcome alice!\r\n"));
        assert!(h.seen.contains("0) db1 ops@db1.internal"));
        assert!(h.seen.contains("1) jump1 ops@jump1.internal"));
        assert!(connector.connects().is_empty());
    }

    #[tokio::test]
    async fn test_end_of_input_closes_session() {
        let (session, mut h, connector) = new_session(MockConnector::default(), None);
        h.hang_up();
        let state = session.run("hi").await.unwrap();
        assert_eq!(state, SessionState::Closed);
        assert!(connector.connects().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_choices_reshow_menu() {
        let (session, mut h, connector) = new_session(MockConnector::default(), None);
        h.type_str("2\r");
        h.type_str("abc\r");
        h.type_str("\r");
        h.type_str("quit\r");
        let state = session.run("hi").await.unwrap();

        assert_eq!(state, SessionState::Closed);
        h.expect(PROMPT, 4).await;
        assert!(connector.connects().is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_menu() {
        let (session, mut h, connector) =
            new_session(MockConnector::failing_at(&["db1"]), Some(xterm()));
        let task = tokio::spawn(session.run("hi"));

        h.type_str("0\r");
        h.expect("can not open connection", 1).await;
        h.expect(PROMPT, 2).await;
        assert_eq!(connector.open_count(), 0);

        h.type_str("q\r");
        assert_eq!(task.await.unwrap().unwrap(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_shell_failure_releases_chain() {
        let connector = MockConnector {
            shell_fails: true,
            ..MockConnector::default()
        };
        let (session, mut h, connector) = new_session(connector, None);
        let task = tokio::spawn(session.run("hi"));

        h.type_str("0\r");
        h.expect("can not open connection", 1).await;
        assert_eq!(connector.open_count(), 0);

        h.hang_up();
        assert_eq!(task.await.unwrap().unwrap(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_relay_round_trip_then_menu() {
        let (session, mut h, connector) = new_session(MockConnector::default(), Some(xterm()));
        let task = tokio::spawn(session.run("hi"));

        h.type_str("0\r");
        h.expect("hello from db1", 1).await;
        assert_eq!(
            connector.connects(),
            vec!["direct jump1", "jump1 -> db1"]
        );
        assert_eq!(connector.open_count(), 2);
        assert_eq!(
            connector.log.lock().unwrap().shells,
            vec![("db1".to_string(), Some(xterm()))]
        );

        // Raw mode: input reaches the remote shell unedited and is not
        // echoed locally, so it shows up exactly once.
        h.type_str("ls -l\x7f\r");
        h.expect("ls -l\x7f\r", 1).await;
        assert_eq!(h.seen.matches("ls -l").count(), 1);

        h.type_str("exit\r");
        h.expect(PROMPT, 2).await;
        assert_eq!(connector.open_count(), 0);

        // The session is reusable after the remote side closed.
        h.type_str("1\r");
        h.expect("hello from jump1", 1).await;
        h.type_str("exit\r");
        h.expect(PROMPT, 3).await;

        h.type_str("q\r");
        assert_eq!(task.await.unwrap().unwrap(), SessionState::Closed);
        assert_eq!(connector.open_count(), 0);
    }

    #[tokio::test]
    async fn test_client_gone_during_relay_closes_and_releases() {
        let (session, mut h, connector) = new_session(MockConnector::default(), None);
        let task = tokio::spawn(session.run("hi"));

        h.type_str("0\r");
        h.expect("hello from db1", 1).await;
        assert_eq!(connector.open_count(), 2);

        h.hang_up();
        assert_eq!(task.await.unwrap().unwrap(), SessionState::Closed);
        assert_eq!(connector.open_count(), 0);
    }

    #[tokio::test]
    async fn test_relay_reports_remote_close() {
        let (mut term, mut h) = terminal(false);
        let connector = MockConnector::default();
        let transport = MockTransport {
            name: "db1".to_string(),
        };
        let mut shell = connector.open_shell(&transport, None).await.unwrap();
        shell.send(b"exit").await.unwrap();
        let (_pty_tx, mut pty) = watch::channel(None);

        assert_eq!(
            relay(&mut term, &mut shell, &mut pty).await.unwrap(),
            RelayEnd::RemoteClosed
        );
        h.expect("hello from db1", 1).await;
        h.hang_up();
        assert_eq!(term.read_raw().await, None);
    }

    #[tokio::test]
    async fn test_remote_stderr_goes_to_client_stderr() {
        let connector = MockConnector {
            shell_stderr: true,
            ..MockConnector::default()
        };
        let (session, mut h, _connector) = new_session(connector, None);
        let task = tokio::spawn(session.run("hi"));

        h.type_str("0\r");
        h.expect_stderr("warning from db1").await;
        h.expect("hello from db1", 1).await;
        assert!(!h.seen.contains("warning from db1"));

        h.type_str("exit\r");
        h.expect(PROMPT, 2).await;
        h.hang_up();
        assert_eq!(task.await.unwrap().unwrap(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_relay_error_reports_and_returns_to_menu() {
        let connector = MockConnector {
            shell_breaks: true,
            ..MockConnector::default()
        };
        let (session, mut h, connector) = new_session(connector, Some(xterm()));
        let task = tokio::spawn(session.run("hi"));

        h.type_str("0\r");
        h.expect("connection to db1 lost", 1).await;
        h.expect(PROMPT, 2).await;
        assert_eq!(connector.open_count(), 0);
        assert_eq!(
            connector.log.lock().unwrap().disconnected,
            vec!["db1", "jump1"]
        );

        h.type_str("q\r");
        assert_eq!(task.await.unwrap().unwrap(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_window_change_during_relay_resizes_remote() {
        let (session, mut h, connector) = new_session(MockConnector::default(), Some(xterm()));
        let task = tokio::spawn(session.run("hi"));

        h.type_str("0\r");
        h.expect("hello from db1", 1).await;
        assert!(connector.resizes().is_empty());

        h.resize(200, 60);
        tokio::time::timeout(Duration::from_secs(5), async {
            while connector.resizes().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(connector.resizes(), vec![("db1".to_string(), 200, 60)]);

        // The next connection starts with the new size.
        h.type_str("exit\r");
        h.expect(PROMPT, 2).await;
        h.type_str("1\r");
        h.expect("hello from jump1", 1).await;
        assert_eq!(
            connector.log.lock().unwrap().shells.last().cloned(),
            Some((
                "jump1".to_string(),
                Some(PtyInfo {
                    term: "xterm-256color".to_string(),
                    cols: 200,
                    rows: 60,
                })
            ))
        );

        h.hang_up();
        assert_eq!(task.await.unwrap().unwrap(), SessionState::Closed);
    }
}
