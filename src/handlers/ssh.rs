//! SSH protocol hooks
//!
//! Accepts every password, admits only session channels and grants any shell
//! request. Each step is forwarded to the session engine as a
//! [`HandshakeEvent`].

use std::net::SocketAddr;
use std::time::Duration;

use russh::keys::PrivateKey;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::session::HandshakeEvent;
use crate::transcript::{escape, Transcript};

/// Build the russh server configuration: our identity string, our host key,
/// password authentication only.
pub fn ssh_config(server: &ServerConfig, host_key: PrivateKey) -> russh::server::Config {
    let mut config = russh::server::Config::default();
    config.keys.push(host_key);
    config.server_id = russh::SshId::Standard(server.ssh_banner.clone());
    config.methods = russh::MethodSet::from([russh::MethodKind::Password].as_slice());
    config.auth_rejection_time = Duration::from_millis(250);
    config.auth_rejection_time_initial = Some(Duration::ZERO);
    config.inactivity_timeout = None;
    config
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Session,
    DirectTcpip,
    ForwardedTcpip,
    X11,
}

impl ChannelKind {
    fn name(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::DirectTcpip => "direct-tcpip",
            Self::ForwardedTcpip => "forwarded-tcpip",
            Self::X11 => "x11",
        }
    }
}

/// Channel admission policy: only interactive sessions.
pub fn admits(kind: ChannelKind) -> bool {
    kind == ChannelKind::Session
}

pub struct HoneypotHandler {
    session: Uuid,
    peer: SocketAddr,
    transcript: Transcript,
    events: mpsc::UnboundedSender<HandshakeEvent<Channel<Msg>>>,
}

impl HoneypotHandler {
    pub fn new(
        session: Uuid,
        peer: SocketAddr,
        transcript: Transcript,
        events: mpsc::UnboundedSender<HandshakeEvent<Channel<Msg>>>,
    ) -> Self {
        Self {
            session,
            peer,
            transcript,
            events,
        }
    }

    /// False once the engine has stopped listening, i.e. after the shell
    /// has been granted or the session is over.
    fn notify(&self, event: HandshakeEvent<Channel<Msg>>) -> bool {
        if self.events.send(event).is_err() {
            debug!(session = %self.session, "Session engine no longer listening");
            return false;
        }
        true
    }

    fn refuse(&self, kind: ChannelKind, target: String) -> bool {
        warn!(
            session = %self.session,
            peer = %self.peer,
            kind = kind.name(),
            target = %target,
            "Channel refused"
        );
        self.transcript.append(
            self.session,
            format!("refused {} channel to {}", kind.name(), escape(&target)),
        );
        admits(kind)
    }
}

impl russh::server::Handler for HoneypotHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        info!(
            session = %self.session,
            peer = %self.peer,
            user = %user,
            password = %password,
            "Login attempt"
        );
        self.transcript.append(
            self.session,
            format!(
                "login attempt user: {} password: {}",
                escape(user),
                escape(password)
            ),
        );
        self.notify(HandshakeEvent::Authenticated {
            user: user.to_string(),
        });
        Ok(Auth::Accept)
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint(russh::keys::HashAlg::Sha256);
        debug!(
            session = %self.session,
            user = %user,
            key = %fingerprint,
            "Public key offered"
        );
        self.transcript.append(
            self.session,
            format!("public key offered user: {} key: {}", escape(user), fingerprint),
        );
        Ok(Auth::Reject {
            proceed_with_methods: Some(russh::MethodSet::from(
                [russh::MethodKind::Password].as_slice(),
            )),
            partial_success: false,
        })
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let id = channel.id();
        if !self.notify(HandshakeEvent::ChannelOpen(channel)) {
            debug!(session = %self.session, channel = %id, "Extra session channel refused");
            return Ok(false);
        }
        debug!(session = %self.session, channel = %id, "Session channel opened");
        Ok(admits(ChannelKind::Session))
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.refuse(
            ChannelKind::DirectTcpip,
            format!("{}:{}", host_to_connect, port_to_connect),
        ))
    }

    async fn channel_open_forwarded_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.refuse(
            ChannelKind::ForwardedTcpip,
            format!("{}:{}", host_to_connect, port_to_connect),
        ))
    }

    async fn channel_open_x11(
        &mut self,
        _channel: Channel<Msg>,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.refuse(
            ChannelKind::X11,
            format!("{}:{}", originator_address, originator_port),
        ))
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            session = %self.session,
            term = %term,
            cols = col_width,
            rows = row_height,
            "PTY granted"
        );
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.notify(HandshakeEvent::ShellRequested) {
            let _ = session.channel_failure(channel);
            return Ok(());
        }
        debug!(session = %self.session, channel = %channel, "Shell granted");
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data);
        info!(session = %self.session, peer = %self.peer, command = %command, "Exec refused");
        self.transcript
            .append(self.session, format!("exec refused: {}", escape(&command)));
        let _ = session.channel_failure(channel);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        info!(session = %self.session, peer = %self.peer, subsystem = %name, "Subsystem refused");
        self.transcript
            .append(self.session, format!("subsystem refused: {}", escape(name)));
        let _ = session.channel_failure(channel);
        Ok(())
    }
}
