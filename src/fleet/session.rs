//! Thin wrapper around an authenticated `async_imap` session.
//!
//! Owns connect/login/select and the handful of commands the worker needs.
//! Generic over the underlying stream so TLS and plaintext accounts share
//! one code path.

use std::fmt;
use std::time::Duration;

use async_native_tls::TlsStream;
use futures::StreamExt;
use secrecy::ExposeSecret;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::{ConnectionError, SyncError};
use crate::store::models::ExternalMailbox;

/// Stream bound required by `async_imap::Session`.
pub trait ImapStream: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug> ImapStream for T {}

/// Snapshot of the selected mailbox returned by SELECT.
#[derive(Debug, Clone, Copy)]
pub struct MailboxStatus {
    pub uid_validity: Option<u32>,
    pub uid_next: Option<u32>,
    pub exists: u32,
}

/// Outcome of one IDLE wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    /// The server pushed an untagged response; new mail may be available.
    NewData,
    /// The wait timed out without server activity.
    Timeout,
}

/// An authenticated IMAP session with INBOX selected state managed by the
/// caller.
pub struct ImapSession<S: ImapStream> {
    inner: async_imap::Session<S>,
    supports_idle: bool,
}

/// Connect over implicit TLS, authenticate, and probe capabilities.
pub async fn connect_tls(
    account: &ExternalMailbox,
    timeout: Duration,
) -> Result<ImapSession<TlsStream<TcpStream>>, ConnectionError> {
    let host = account.imap_host.clone();
    let port = account.imap_port;

    let tcp = tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port)))
        .await
        .map_err(|_| ConnectionError::Timeout {
            host: host.clone(),
            timeout,
        })?
        .map_err(|e| ConnectionError::Tcp {
            host: host.clone(),
            port,
            reason: e.to_string(),
        })?;

    let tls = async_native_tls::TlsConnector::new();
    let stream = tokio::time::timeout(timeout, tls.connect(host.as_str(), tcp))
        .await
        .map_err(|_| ConnectionError::Timeout {
            host: host.clone(),
            timeout,
        })?
        .map_err(|e| ConnectionError::Tls {
            host: host.clone(),
            reason: e.to_string(),
        })?;

    login(account, stream, timeout).await
}

/// Connect without TLS (test servers, localhost relays).
pub async fn connect_plain(
    account: &ExternalMailbox,
    timeout: Duration,
) -> Result<ImapSession<TcpStream>, ConnectionError> {
    let host = account.imap_host.clone();
    let port = account.imap_port;

    let tcp = tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port)))
        .await
        .map_err(|_| ConnectionError::Timeout {
            host: host.clone(),
            timeout,
        })?
        .map_err(|e| ConnectionError::Tcp {
            host: host.clone(),
            port,
            reason: e.to_string(),
        })?;

    login(account, tcp, timeout).await
}

async fn login<S: ImapStream>(
    account: &ExternalMailbox,
    stream: S,
    timeout: Duration,
) -> Result<ImapSession<S>, ConnectionError> {
    let client = async_imap::Client::new(stream);

    let login = tokio::time::timeout(
        timeout,
        client.login(&account.username, account.password.expose_secret()),
    )
    .await
    .map_err(|_| ConnectionError::Timeout {
        host: account.imap_host.clone(),
        timeout,
    })?;

    let mut session = login.map_err(|(e, _client)| ConnectionError::Auth {
        host: account.imap_host.clone(),
        username: account.username.clone(),
        reason: e.to_string(),
    })?;

    let supports_idle = match session.capabilities().await {
        Ok(caps) => caps.has_str("IDLE"),
        Err(e) => {
            debug!(host = %account.imap_host, "CAPABILITY failed, assuming no IDLE: {e}");
            false
        }
    };

    debug!(
        host = %account.imap_host,
        user = %account.username,
        idle = supports_idle,
        "IMAP session established"
    );

    Ok(ImapSession {
        inner: session,
        supports_idle,
    })
}

impl<S: ImapStream> ImapSession<S> {
    pub fn supports_idle(&self) -> bool {
        self.supports_idle
    }

    /// SELECT INBOX and report its UIDVALIDITY / UIDNEXT / EXISTS.
    pub async fn select_inbox(&mut self) -> Result<MailboxStatus, SyncError> {
        let mailbox = self
            .inner
            .select("INBOX")
            .await
            .map_err(|e| SyncError::Select {
                mailbox: "INBOX".into(),
                reason: e.to_string(),
            })?;

        Ok(MailboxStatus {
            uid_validity: mailbox.uid_validity,
            uid_next: mailbox.uid_next,
            exists: mailbox.exists,
        })
    }

    /// UIDs of unread messages, ascending.
    pub async fn search_unseen(&mut self) -> Result<Vec<u32>, SyncError> {
        let uids = self.inner.uid_search("UNSEEN").await?;
        let mut out: Vec<u32> = uids.into_iter().collect();
        out.sort_unstable();
        Ok(out)
    }

    /// UIDs strictly greater than `cursor`, ascending.
    ///
    /// `UID n:*` always matches at least the last message in the mailbox
    /// even when its UID is below `n`, so the result is filtered again
    /// client-side.
    pub async fn search_uids_above(&mut self, cursor: u32) -> Result<Vec<u32>, SyncError> {
        let query = format!("UID {}:*", cursor.saturating_add(1));
        let uids = self.inner.uid_search(&query).await?;
        let mut out: Vec<u32> = uids.into_iter().filter(|&u| u > cursor).collect();
        out.sort_unstable();
        Ok(out)
    }

    /// Fetch raw RFC 822 bytes for a chunk of UIDs, without setting \Seen.
    pub async fn fetch_raw(&mut self, uids: &[u32]) -> Result<Vec<(u32, Vec<u8>)>, SyncError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let set = uid_set(uids);
        let stream = self.inner.uid_fetch(&set, "(UID BODY.PEEK[])").await?;
        let fetches: Vec<_> = stream.collect().await;

        let mut out = Vec::with_capacity(uids.len());
        for fetched in fetches {
            let fetched = fetched?;
            let Some(uid) = fetched.uid else {
                warn!("FETCH response without UID; skipping");
                continue;
            };
            match fetched.body() {
                Some(body) => out.push((uid, body.to_vec())),
                None => warn!(uid, "FETCH response without body; skipping"),
            }
        }
        out.sort_unstable_by_key(|(uid, _)| *uid);
        Ok(out)
    }

    /// Mark every listed UID \Seen. Applied to all *attempted* UIDs so a
    /// poison message is not refetched forever.
    pub async fn mark_seen(&mut self, uids: &[u32]) -> Result<(), SyncError> {
        if uids.is_empty() {
            return Ok(());
        }
        let set = uid_set(uids);
        let stream = self
            .inner
            .uid_store(&set, "+FLAGS.SILENT (\\Seen)")
            .await?;
        let _: Vec<_> = stream.collect().await;
        Ok(())
    }

    /// Lightweight heartbeat; failure means the connection is dead.
    pub async fn noop(&mut self) -> Result<(), SyncError> {
        self.inner.noop().await?;
        Ok(())
    }

    /// Enter IDLE and wait for server activity or `timeout`.
    ///
    /// Consumes the session while the IDLE handle owns the stream and
    /// returns it afterwards.
    pub async fn idle_wait(self, timeout: Duration) -> Result<(Self, IdleOutcome), SyncError> {
        let supports_idle = self.supports_idle;
        let mut handle = self.inner.idle();
        handle.init().await?;

        let (wait, _interrupt) = handle.wait_with_timeout(timeout);
        let response = wait.await?;

        let inner = handle.done().await?;
        let session = Self {
            inner,
            supports_idle,
        };

        let outcome = match response {
            async_imap::extensions::idle::IdleResponse::NewData(_) => IdleOutcome::NewData,
            async_imap::extensions::idle::IdleResponse::Timeout
            | async_imap::extensions::idle::IdleResponse::ManualInterrupt => IdleOutcome::Timeout,
        };
        Ok((session, outcome))
    }

    /// Close the session. Errors are logged, never propagated — the remote
    /// end may already be gone.
    pub async fn logout(mut self) {
        if let Err(e) = self.inner.logout().await {
            debug!("LOGOUT failed (connection likely already closed): {e}");
        }
    }
}

/// Render a UID set for FETCH/STORE, collapsing runs into ranges.
pub fn uid_set(uids: &[u32]) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut i = 0;
    while i < uids.len() {
        let start = uids[i];
        let mut end = start;
        while i + 1 < uids.len() && uids[i + 1] == end + 1 {
            i += 1;
            end = uids[i];
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}:{end}"));
        }
        i += 1;
    }
    parts.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_set_collapses_runs() {
        assert_eq!(uid_set(&[1, 2, 3, 7, 9, 10]), "1:3,7,9:10");
        assert_eq!(uid_set(&[5]), "5");
        assert_eq!(uid_set(&[]), "");
    }
}
