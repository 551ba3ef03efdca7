//! Listener and session supervision

pub mod ssh;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::session::{self, SessionContext};

/// Pause after a failed accept so a persistent error (e.g. EMFILE) cannot spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub async fn bind(server: &ServerConfig) -> Result<TcpListener> {
    let listener = TcpListener::bind((server.host.as_str(), server.port))
        .await
        .with_context(|| format!("BindFailure: cannot bind {}:{}", server.host, server.port))?;
    info!("SSH honeypot listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Accept connections forever, one session task each.
///
/// With `max_sessions > 0` the accept loop waits for a free slot instead of
/// accepting more connections.
pub async fn serve(listener: TcpListener, ctx: Arc<SessionContext>, max_sessions: usize) -> Result<()> {
    let limit = (max_sessions > 0).then(|| Arc::new(Semaphore::new(max_sessions)));
    let mut sessions = JoinSet::new();

    loop {
        let permit = match &limit {
            Some(limit) => Some(limit.clone().acquire_owned().await?),
            None => None,
        };

        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let ctx = ctx.clone();
                    sessions.spawn(async move {
                        session::run(ctx, socket, peer).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    warn!("AcceptFailure: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(joined) = sessions.join_next() => {
                if let Err(e) = joined {
                    error!("Session task failed: {}", e);
                }
            }
        }
    }
}
