//! Per-connection session engine
//!
//! One task per accepted connection walks the session through
//! `Connected → KeyExchanged → Authenticated → ChannelOpen → ShellGranted →
//! CommandLoop → Closed`, or into `Aborted` when the handshake fails. The
//! SSH hooks in [`crate::handlers::ssh`] report progress as
//! [`HandshakeEvent`]s; once a shell is granted the channel is used as a
//! plain byte stream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::commands;
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::events::{AlertEvent, EventBus};
use crate::handlers::ssh::HoneypotHandler;
use crate::mac;
use crate::transcript::{escape, Transcript};

const BANNER: &str = concat!(
    "###############################################################\r\n",
    "    Welcome to Ubuntu Server Version 20.0.1\r\n",
    "    All connections are monitored and recorded\r\n",
    "    Disconnect IMMEDIATELY if you are not an authorized user!\r\n",
    "###############################################################\r\n",
    "\r\n",
);

const PROMPT: &[u8] = b"$ ";

const READ_CHUNK: usize = 1024;

/// How long the protocol task gets to flush the disconnect before it is aborted
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    KeyExchanged,
    Authenticated,
    ChannelOpen,
    ShellGranted,
    CommandLoop,
    Closed,
    Aborted,
}

/// Handshake progress reported by the protocol hooks, in arrival order.
#[derive(Debug)]
pub enum HandshakeEvent<C> {
    Authenticated { user: String },
    ChannelOpen(C),
    ShellRequested,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Measured from accept, covers negotiation and authentication too
    pub channel_timeout: Duration,
    /// Measured from the channel being opened
    pub shell_timeout: Duration,
    pub max_line_bytes: usize,
}

impl From<&SessionConfig> for SessionLimits {
    fn from(config: &SessionConfig) -> Self {
        Self {
            channel_timeout: config.channel_timeout(),
            shell_timeout: config.shell_timeout(),
            max_line_bytes: config.max_line_bytes,
        }
    }
}

/// Everything a session borrows from the process.
pub struct SessionContext {
    pub ssh: Arc<russh::server::Config>,
    pub transcript: Transcript,
    pub events: EventBus,
    pub limits: SessionLimits,
}

/// Accumulates raw input until a carriage return completes a line.
#[derive(Debug, Default)]
pub struct LineBuffer {
    bytes: Vec<u8>,
    /// A `\n` right after the last `\r` belongs to that line ending
    skip_lf: bool,
}

impl LineBuffer {
    pub fn push(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// Take the next complete line, trailing whitespace trimmed.
    pub fn next_line(&mut self) -> Option<String> {
        if self.skip_lf {
            match self.bytes.first() {
                Some(b'\n') => {
                    self.bytes.remove(0);
                    self.skip_lf = false;
                }
                Some(_) => self.skip_lf = false,
                None => {}
            }
        }

        let end = self.bytes.iter().position(|&b| b == b'\r')?;
        let raw: Vec<u8> = self.bytes.drain(..=end).collect();
        self.skip_lf = true;
        Some(String::from_utf8_lossy(&raw[..end]).trim_end().to_string())
    }

    pub fn has_line(&self) -> bool {
        self.bytes.contains(&b'\r')
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// State owned by one connection.
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub peer: SocketAddr,
    pub mac: Option<String>,
    pub authenticated: bool,
    pub shell_granted: bool,
    pub state: SessionState,
    pub line: LineBuffer,
    started: Instant,
}

impl Session {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            mac: None,
            authenticated: false,
            shell_granted: false,
            state: SessionState::Connected,
            line: LineBuffer::default(),
            started: Instant::now(),
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(session = %self.id, from = ?self.state, to = ?next, "Session state");
        self.state = next;
    }
}

/// Drive one accepted connection to completion. Never returns an error:
/// every failure ends here, logged, with the transport closed.
pub async fn run(ctx: Arc<SessionContext>, socket: TcpStream, peer: SocketAddr) {
    let mut session = Session::new(peer);
    let port = socket.local_addr().map(|a| a.port()).unwrap_or_default();
    session.mac = mac::resolve(peer.ip()).await;

    let alert = AlertEvent::new(session.id, peer, port, session.mac.clone());
    info!(session = %session.id, peer = %peer, "Got a connection");
    ctx.transcript.append(session.id, alert.message.clone());
    ctx.events.publish(alert);

    let result = drive(&ctx, &mut session, socket).await;
    finish(&mut session, &ctx.transcript, result);
}

async fn drive(
    ctx: &SessionContext,
    session: &mut Session,
    socket: TcpStream,
) -> Result<(), SessionError> {
    let channel_deadline = session.started + ctx.limits.channel_timeout;
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let handler = HoneypotHandler::new(session.id, session.peer, ctx.transcript.clone(), events_tx);

    let running = match timeout_at(
        channel_deadline,
        russh::server::run_stream(ctx.ssh.clone(), socket, handler),
    )
    .await
    {
        Err(_) => return Err(SessionError::HandshakeTimeout("no identification from client")),
        Ok(Err(e)) => return Err(SessionError::Negotiation(e.to_string())),
        Ok(Ok(running)) => running,
    };
    session.transition(SessionState::KeyExchanged);

    let handle = running.handle();
    let mut protocol = tokio::spawn(running);

    let established = establish(session, &mut events_rx, &ctx.limits).await;
    let mut result = match established {
        Ok(channel) => {
            // Later channel opens and shell requests are refused by the hooks
            drop(events_rx);
            let mut stream = channel.into_stream();
            command_loop(&mut stream, session, &ctx.transcript, ctx.limits.max_line_bytes).await
        }
        Err(e) => Err(e),
    };

    // Best-effort close of the transport on every exit path
    let _ = handle
        .disconnect(russh::Disconnect::ByApplication, String::new(), "en".into())
        .await;
    match timeout(CLOSE_GRACE, &mut protocol).await {
        Ok(Ok(Err(e))) => {
            debug!(session = %session.id, "Protocol task ended: {}", e);
            // The hooks vanished because negotiation itself failed
            if matches!(result, Err(SessionError::HandshakeClosed)) {
                result = Err(SessionError::Negotiation(e.to_string()));
            }
        }
        Ok(_) => {}
        Err(_) => protocol.abort(),
    }

    result
}

/// Wait for a channel and then a shell request, each inside its own window.
pub async fn establish<C>(
    session: &mut Session,
    events: &mut mpsc::UnboundedReceiver<HandshakeEvent<C>>,
    limits: &SessionLimits,
) -> Result<C, SessionError> {
    let channel_deadline = session.started + limits.channel_timeout;
    let channel = loop {
        match timeout_at(channel_deadline, events.recv()).await {
            Err(_) => return Err(SessionError::HandshakeTimeout("no channel")),
            Ok(None) => return Err(SessionError::HandshakeClosed),
            Ok(Some(HandshakeEvent::Authenticated { user })) => {
                debug!(session = %session.id, user = %user, "Authenticated");
                session.authenticated = true;
                session.transition(SessionState::Authenticated);
            }
            Ok(Some(HandshakeEvent::ChannelOpen(channel))) => break channel,
            Ok(Some(HandshakeEvent::ShellRequested)) => {}
        }
    };
    session.transition(SessionState::ChannelOpen);

    let shell_deadline = Instant::now() + limits.shell_timeout;
    loop {
        match timeout_at(shell_deadline, events.recv()).await {
            Err(_) => return Err(SessionError::HandshakeTimeout("client never asked for a shell")),
            Ok(None) => return Err(SessionError::HandshakeClosed),
            Ok(Some(HandshakeEvent::ShellRequested)) => break,
            // Extra channels are accepted by the hooks but never served
            Ok(Some(_)) => {}
        }
    }
    session.shell_granted = true;
    session.transition(SessionState::ShellGranted);

    Ok(channel)
}

/// The fake shell: banner, then prompt / echo / dispatch until `exit`.
pub async fn command_loop<S>(
    stream: &mut S,
    session: &mut Session,
    transcript: &Transcript,
    max_line_bytes: usize,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    session.transition(SessionState::CommandLoop);
    stream.write_all(BANNER.as_bytes()).await?;

    let mut buf = [0u8; READ_CHUNK];
    loop {
        stream.write_all(PROMPT).await?;
        stream.flush().await?;

        let command = loop {
            if let Some(line) = session.line.next_line() {
                break line;
            }
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Err(SessionError::PeerClosed);
            }
            // Local terminal echo, before anything is interpreted
            stream.write_all(&buf[..n]).await?;
            stream.flush().await?;
            session.line.push(&buf[..n]);
            if !session.line.has_line() && session.line.len() > max_line_bytes {
                return Err(SessionError::LineTooLong(max_line_bytes));
            }
        };

        stream.write_all(b"\r\n").await?;
        let logged = escape(&command);
        transcript.append(session.id, format!("$ {}", logged));
        info!(session = %session.id, peer = %session.peer, command = %command, "Command");

        if command == "exit" {
            return Ok(());
        }

        let response = commands::respond(&command);
        // Escaping never touches a rule prefix, so this picks the same rule
        transcript.append(session.id, commands::respond(&logged));
        stream.write_all(to_wire(&response).as_bytes()).await?;
    }
}

fn to_wire(text: &str) -> String {
    let mut wire = text.replace('\n', "\r\n");
    wire.push_str("\r\n");
    wire
}

/// Record how the session ended.
fn finish(session: &mut Session, transcript: &Transcript, result: Result<(), SessionError>) {
    match result {
        Ok(()) => {
            session.transition(SessionState::Closed);
            info!(session = %session.id, peer = %session.peer, "Session closed by exit");
            transcript.append(session.id, "session closed: exit");
        }
        Err(SessionError::PeerClosed) => {
            session.transition(SessionState::Closed);
            info!(session = %session.id, peer = %session.peer, "Peer disconnected");
            transcript.append(session.id, "session closed: peer disconnected");
        }
        Err(e) => {
            let next = if e.is_handshake() {
                SessionState::Aborted
            } else {
                SessionState::Closed
            };
            session.transition(next);
            warn!(
                session = %session.id,
                peer = %session.peer,
                class = e.class(),
                "{}",
                e
            );
            transcript.append(session.id, format!("session ended: {}", escape(&e.to_string())));
        }
    }
    debug!(
        session = %session.id,
        state = ?session.state,
        authenticated = session.authenticated,
        shell_granted = session.shell_granted,
        "Session finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    fn peer() -> SocketAddr {
        "192.0.2.10:50022".parse().unwrap()
    }

    fn limits(channel_ms: u64, shell_ms: u64) -> SessionLimits {
        SessionLimits {
            channel_timeout: Duration::from_millis(channel_ms),
            shell_timeout: Duration::from_millis(shell_ms),
            max_line_bytes: 64,
        }
    }

    async fn read_until(stream: &mut DuplexStream, needle: &str) -> String {
        let mut seen = Vec::new();
        let mut buf = [0u8; 256];
        let deadline = Instant::now() + Duration::from_secs(5);
        while !String::from_utf8_lossy(&seen).contains(needle) {
            let n = timeout_at(deadline, stream.read(&mut buf))
                .await
                .expect("timed out waiting for output")
                .unwrap();
            assert!(n > 0, "stream closed before {:?} arrived", needle);
            seen.extend_from_slice(&buf[..n]);
        }
        String::from_utf8_lossy(&seen).into_owned()
    }

    async fn assert_quiet(stream: &mut DuplexStream) {
        let mut buf = [0u8; 64];
        let res = timeout(Duration::from_millis(50), stream.read(&mut buf)).await;
        assert!(res.is_err(), "unexpected output: {:?}", res);
    }

    fn spawn_shell(
        transcript: Transcript,
        max_line_bytes: usize,
    ) -> (
        DuplexStream,
        JoinHandle<(Result<(), SessionError>, Session)>,
    ) {
        let (client, mut server) = tokio::io::duplex(8192);
        let task = tokio::spawn(async move {
            let mut session = Session::new(peer());
            let result = command_loop(&mut server, &mut session, &transcript, max_line_bytes).await;
            (result, session)
        });
        (client, task)
    }

    async fn temp_transcript(dir: &Path) -> (Transcript, JoinHandle<()>, std::path::PathBuf) {
        let path = dir.join("transcript.log");
        let (transcript, writer) = Transcript::open(&path).await.unwrap();
        (transcript, writer, path)
    }

    #[test]
    fn test_line_buffer_accumulates_across_pushes() {
        let mut line = LineBuffer::default();
        line.push(b"p");
        assert_eq!(line.next_line(), None);
        line.push(b"w");
        assert_eq!(line.next_line(), None);
        line.push(b"d  \r");
        assert_eq!(line.next_line().as_deref(), Some("pwd"));
        assert!(line.is_empty());
        assert_eq!(line.next_line(), None);
    }

    #[test]
    fn test_line_buffer_several_lines_in_one_chunk() {
        let mut line = LineBuffer::default();
        line.push(b"ls\rpwd\rrm");
        assert_eq!(line.next_line().as_deref(), Some("ls"));
        assert_eq!(line.next_line().as_deref(), Some("pwd"));
        assert_eq!(line.next_line(), None);
        assert_eq!(line.len(), 2);
    }

    #[test]
    fn test_line_buffer_crlf() {
        let mut line = LineBuffer::default();
        line.push(b"ls\r");
        assert_eq!(line.next_line().as_deref(), Some("ls"));
        // the \n of a split CRLF arrives in the next read
        line.push(b"\npwd\r\n");
        assert_eq!(line.next_line().as_deref(), Some("pwd"));
        assert_eq!(line.next_line(), None);
        assert!(line.is_empty());
    }

    #[test]
    fn test_line_buffer_keeps_leading_whitespace_and_invalid_utf8() {
        let mut line = LineBuffer::default();
        line.push(b" ls\r");
        assert_eq!(line.next_line().as_deref(), Some(" ls"));
        line.push(&[0x66, 0xff, 0x6f, b'\r']);
        assert_eq!(line.next_line().as_deref(), Some("f\u{fffd}o"));
    }

    #[tokio::test]
    async fn test_establish_full_handshake() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(HandshakeEvent::Authenticated { user: "root".into() }).unwrap();
        tx.send(HandshakeEvent::ChannelOpen(7u32)).unwrap();
        tx.send(HandshakeEvent::ShellRequested).unwrap();

        let mut session = Session::new(peer());
        let channel = establish(&mut session, &mut rx, &limits(500, 500)).await.unwrap();
        assert_eq!(channel, 7);
        assert!(session.authenticated);
        assert!(session.shell_granted);
        assert_eq!(session.state, SessionState::ShellGranted);
    }

    #[tokio::test]
    async fn test_establish_times_out_without_channel() {
        let (_tx, mut rx) = mpsc::unbounded_channel::<HandshakeEvent<u32>>();
        let mut session = Session::new(peer());
        let err = establish(&mut session, &mut rx, &limits(50, 500)).await.unwrap_err();
        assert!(matches!(err, SessionError::HandshakeTimeout("no channel")));
        assert_eq!(session.state, SessionState::Connected);
    }

    #[tokio::test]
    async fn test_establish_times_out_without_shell_request() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(HandshakeEvent::Authenticated { user: "admin".into() }).unwrap();
        tx.send(HandshakeEvent::ChannelOpen(1u32)).unwrap();

        let mut session = Session::new(peer());
        let started = Instant::now();
        let err = establish(&mut session, &mut rx, &limits(500, 50)).await.unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(matches!(
            err,
            SessionError::HandshakeTimeout("client never asked for a shell")
        ));
        assert!(err.is_handshake());
        assert!(!session.shell_granted);
        assert_eq!(session.state, SessionState::ChannelOpen);
        drop(tx);
    }

    #[tokio::test]
    async fn test_establish_transport_gone() {
        let (tx, mut rx) = mpsc::unbounded_channel::<HandshakeEvent<u32>>();
        drop(tx);
        let mut session = Session::new(peer());
        let err = establish(&mut session, &mut rx, &limits(500, 500)).await.unwrap_err();
        assert!(matches!(err, SessionError::HandshakeClosed));
    }

    #[tokio::test]
    async fn test_banner_prompt_and_command() {
        let dir = tempfile::tempdir().unwrap();
        let (transcript, _writer, _) = temp_transcript(dir.path()).await;
        let (mut client, task) = spawn_shell(transcript, 1024);

        let greeting = read_until(&mut client, "$ ").await;
        assert!(greeting.contains("All connections are monitored and recorded"));
        assert!(greeting.ends_with("\r\n$ "));

        client.write_all(b"pwd\r").await.unwrap();
        let out = read_until(&mut client, "/home/user\r\n$ ").await;
        assert_eq!(out, "pwd\r\r\n/home/user\r\n$ ");

        client.write_all(b"exit\r").await.unwrap();
        let (result, session) = task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(session.state, SessionState::CommandLoop);
    }

    #[tokio::test]
    async fn test_echo_precedes_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let (transcript, _writer, _) = temp_transcript(dir.path()).await;
        let (mut client, _task) = spawn_shell(transcript, 1024);
        read_until(&mut client, "$ ").await;

        client.write_all(b"ver").await.unwrap();
        assert_eq!(read_until(&mut client, "ver").await, "ver");
        assert_quiet(&mut client).await;

        client.write_all(b"sion").await.unwrap();
        assert_eq!(read_until(&mut client, "sion").await, "sion");
        assert_quiet(&mut client).await;

        client.write_all(b"\r").await.unwrap();
        let out = read_until(&mut client, "Inc.\r\n$ ").await;
        assert!(out.starts_with("\r\r\nGNU bash, version 3.1.27(1)-release (x86_64)\r\nCopyright"));
    }

    #[tokio::test]
    async fn test_exit_skips_interpreter() {
        let dir = tempfile::tempdir().unwrap();
        let (transcript, writer, path) = temp_transcript(dir.path()).await;
        let (mut client, task) = spawn_shell(transcript.clone(), 1024);
        read_until(&mut client, "$ ").await;

        client.write_all(b"exit\r").await.unwrap();
        let (result, _) = task.await.unwrap();
        assert!(result.is_ok());

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"exit\r\r\n");

        drop(transcript);
        writer.await.unwrap();
        let log = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(log.contains("] $ exit"));
        assert!(!log.contains("command not found"));
    }

    #[tokio::test]
    async fn test_transcript_records_commands_and_responses_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (transcript, writer, path) = temp_transcript(dir.path()).await;
        let (mut client, task) = spawn_shell(transcript.clone(), 1024);
        read_until(&mut client, "$ ").await;

        client.write_all(b"ls\rrm secrets.txt\rzzz\r").await.unwrap();
        read_until(&mut client, "zzz command not found\r\n$ ").await;
        // Abrupt disconnect mid-session
        drop(client);
        let (result, _) = task.await.unwrap();
        assert!(matches!(result, Err(SessionError::PeerClosed)));

        drop(transcript);
        writer.await.unwrap();
        let log = tokio::fs::read_to_string(&path).await.unwrap();
        let texts: Vec<&str> = log
            .lines()
            .map(|l| l.split_once("] ").unwrap().1)
            .collect();
        assert_eq!(
            texts,
            vec![
                "$ ls",
                "Desktop Documents Pictures Music Shared",
                "$ rm secrets.txt",
                "-bash: rm secrets.txt not found",
                "$ zzz",
                "-bash: zzz command not found",
            ]
        );
    }

    #[tokio::test]
    async fn test_embedded_newline_stays_on_one_transcript_line() {
        let dir = tempfile::tempdir().unwrap();
        let (transcript, writer, path) = temp_transcript(dir.path()).await;
        let (mut client, task) = spawn_shell(transcript.clone(), 1024);
        read_until(&mut client, "$ ").await;

        client
            .write_all(b"zzz\nsession closed: exit\r")
            .await
            .unwrap();
        // The wire still answers with what was typed
        read_until(&mut client, "zzz\r\nsession closed: exit command not found\r\n$ ").await;
        client.write_all(b"exit\r").await.unwrap();
        let (result, _) = task.await.unwrap();
        assert!(result.is_ok());

        drop(transcript);
        writer.await.unwrap();
        let log = tokio::fs::read_to_string(&path).await.unwrap();
        let texts: Vec<&str> = log
            .lines()
            .map(|l| l.split_once("] ").unwrap().1)
            .collect();
        assert_eq!(
            texts,
            vec![
                "$ zzz\\nsession closed: exit",
                "-bash: zzz\\nsession closed: exit command not found",
                "$ exit",
            ]
        );
    }

    #[tokio::test]
    async fn test_sessions_do_not_share_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let (transcript, _writer, _) = temp_transcript(dir.path()).await;
        let (mut a, _ta) = spawn_shell(transcript.clone(), 1024);
        let (mut b, _tb) = spawn_shell(transcript, 1024);
        read_until(&mut a, "$ ").await;
        read_until(&mut b, "$ ").await;

        a.write_all(b"p").await.unwrap();
        read_until(&mut a, "p").await;
        b.write_all(b"l").await.unwrap();
        read_until(&mut b, "l").await;
        a.write_all(b"wd\r").await.unwrap();
        b.write_all(b"s\r").await.unwrap();

        assert!(read_until(&mut a, "$ ").await.contains("/home/user"));
        assert!(read_until(&mut b, "$ ")
            .await
            .contains("Desktop Documents Pictures Music Shared"));
    }

    #[tokio::test]
    async fn test_overlong_line_ends_session() {
        let dir = tempfile::tempdir().unwrap();
        let (transcript, _writer, _) = temp_transcript(dir.path()).await;
        let (mut client, task) = spawn_shell(transcript, 16);
        read_until(&mut client, "$ ").await;

        client.write_all(&[b'a'; 32]).await.unwrap();
        let (result, _) = task.await.unwrap();
        assert!(matches!(result, Err(SessionError::LineTooLong(16))));
    }

    #[tokio::test]
    async fn test_finish_states() {
        let dir = tempfile::tempdir().unwrap();
        let (transcript, _writer, _) = temp_transcript(dir.path()).await;

        let mut session = Session::new(peer());
        finish(&mut session, &transcript, Ok(()));
        assert_eq!(session.state, SessionState::Closed);

        let mut session = Session::new(peer());
        finish(
            &mut session,
            &transcript,
            Err(SessionError::HandshakeTimeout("no channel")),
        );
        assert_eq!(session.state, SessionState::Aborted);

        let mut session = Session::new(peer());
        finish(&mut session, &transcript, Err(SessionError::LineTooLong(8)));
        assert_eq!(session.state, SessionState::Closed);
    }

    #[test]
    fn test_wire_line_endings() {
        assert_eq!(to_wire("a\nb"), "a\r\nb\r\n");
        assert_eq!(to_wire("/home/user"), "/home/user\r\n");
    }
}
