//! Mailbox access
//!
//! [`MailboxClient`] is one open, authenticated session with the collecting mailbox selected.
//! [`MailboxConnector`] opens such sessions; [`MailboxSession`] owns the current one and
//! reconnects on demand so operations can be retried after a broken connection.

use async_imap::Session;
use async_native_tls::TlsConnector;
use async_trait::async_trait;
use chrono::NaiveDate;
use futures_util::io::{AsyncRead, AsyncWrite};
use futures_util::StreamExt;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::parse::{parse_envelope, Envelope};
use super::retry::Recover;
use super::tunnel;
use crate::config::{ConfigHandle, EmailConfig};
use crate::error::{CloudMailError, Result};

/// UIDs per FETCH command
const FETCH_CHUNK: usize = 100;

#[async_trait]
pub trait MailboxClient: Send {
    /// UIDs of messages received on or after `since`, ascending
    async fn search_since(&mut self, since: NaiveDate) -> Result<Vec<u32>>;

    /// Header metadata for `uids`
    async fn fetch_envelopes(&mut self, uids: &[u32]) -> Result<Vec<Envelope>>;

    /// Full source of one message without setting `\Seen`; `None` if it is gone
    async fn fetch_source(&mut self, uid: u32) -> Result<Option<Vec<u8>>>;

    async fn logout(&mut self) -> Result<()>;
}

#[async_trait]
pub trait MailboxConnector: Send + Sync {
    /// Connect, authenticate and open the mailbox read-only
    async fn connect(&self) -> Result<Box<dyn MailboxClient>>;
}

/// Current session plus the means to replace it
pub struct MailboxSession {
    connector: Arc<dyn MailboxConnector>,
    client: Option<Box<dyn MailboxClient>>,
}

impl MailboxSession {
    pub fn new(connector: Arc<dyn MailboxConnector>) -> Self {
        Self {
            connector,
            client: None,
        }
    }

    /// The open client, connecting first if needed
    pub async fn client(&mut self) -> Result<&mut Box<dyn MailboxClient>> {
        if self.client.is_none() {
            self.client = Some(self.connector.connect().await?);
        }
        self.client
            .as_mut()
            .ok_or_else(|| CloudMailError::Imap("not connected".to_string()))
    }

    /// Log out, ignoring errors from a connection that is already broken
    pub async fn close(&mut self) {
        if let Some(mut client) = self.client.take() {
            if let Err(e) = client.logout().await {
                debug!("Logout failed: {}", e);
            }
        }
    }
}

#[async_trait]
impl Recover for MailboxSession {
    async fn recover(&mut self) -> Result<()> {
        self.close().await;
        self.client = Some(self.connector.connect().await?);
        info!("Reconnected to mailbox");
        Ok(())
    }
}

/// Transport an IMAP session can run over: TLS or plain TCP
pub trait ImapStream: AsyncRead + AsyncWrite + Unpin + Debug + Send + 'static {}

impl<S> ImapStream for S where S: AsyncRead + AsyncWrite + Unpin + Debug + Send + 'static {}

fn imap_err(e: impl std::fmt::Display) -> CloudMailError {
    CloudMailError::Imap(e.to_string())
}

/// Connects to the IMAP server from the live configuration
pub struct ImapConnector {
    config: ConfigHandle,
}

impl ImapConnector {
    pub fn new(config: ConfigHandle) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    async fn connect(&self) -> Result<Box<dyn MailboxClient>> {
        let config = self.config.snapshot().await;
        let email = config.email;
        let imap = &email.imap;

        if email.user.is_empty() {
            return Err(CloudMailError::Config(
                "email.user is not configured".to_string(),
            ));
        }

        info!("Connecting to IMAP server at {}:{}", imap.host, imap.port);
        let tcp_stream = tunnel::open(&imap.host, imap.port, &config.proxy).await?;
        let tcp_stream = async_io::Async::new(tcp_stream.into_std()?)?;

        if imap.secure {
            let tls_stream = TlsConnector::new()
                .connect(imap.host.as_str(), tcp_stream)
                .await
                .map_err(imap_err)?;
            open_mailbox(tls_stream, &email).await
        } else {
            warn!("IMAP connection to {} is not encrypted", imap.host);
            open_mailbox(tcp_stream, &email).await
        }
    }
}

/// Log in and open the collecting mailbox read-only
async fn open_mailbox<S: ImapStream>(
    stream: S,
    email: &EmailConfig,
) -> Result<Box<dyn MailboxClient>> {
    let client = async_imap::Client::new(stream);
    let mut session = client
        .login(&email.user, &email.pass)
        .await
        .map_err(|(e, _)| CloudMailError::Imap(format!("login failed: {}", e)))?;

    let mailbox = session.examine(&email.mailbox).await.map_err(imap_err)?;
    info!(
        "Opened {} ({} messages)",
        email.mailbox, mailbox.exists
    );

    Ok(Box::new(ImapMailbox { session }))
}

pub struct ImapMailbox<S: ImapStream> {
    session: Session<S>,
}

#[async_trait]
impl<S: ImapStream> MailboxClient for ImapMailbox<S> {
    async fn search_since(&mut self, since: NaiveDate) -> Result<Vec<u32>> {
        let query = format!("SINCE {}", since.format("%d-%b-%Y"));
        debug!("Searching with query: {}", query);

        let uids = self.session.uid_search(&query).await.map_err(imap_err)?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();

        debug!("Found {} messages since {}", uids.len(), since);
        Ok(uids)
    }

    async fn fetch_envelopes(&mut self, uids: &[u32]) -> Result<Vec<Envelope>> {
        let mut envelopes = Vec::with_capacity(uids.len());

        for chunk in uids.chunks(FETCH_CHUNK) {
            let uid_set = chunk
                .iter()
                .map(|u| u.to_string())
                .collect::<Vec<_>>()
                .join(",");

            let mut messages = self
                .session
                .uid_fetch(&uid_set, "(UID INTERNALDATE BODY.PEEK[HEADER])")
                .await
                .map_err(imap_err)?;

            while let Some(message) = messages.next().await {
                let message = message.map_err(imap_err)?;
                let (Some(uid), Some(header)) = (message.uid, message.header()) else {
                    warn!("Skipping fetch response without UID or header");
                    continue;
                };
                let internal_date = message.internal_date().map(|d| d.timestamp_millis());
                envelopes.push(parse_envelope(uid, header, internal_date));
            }
        }

        envelopes.sort_by_key(|e| e.uid);
        Ok(envelopes)
    }

    async fn fetch_source(&mut self, uid: u32) -> Result<Option<Vec<u8>>> {
        let mut messages = self
            .session
            .uid_fetch(uid.to_string(), "(UID BODY.PEEK[])")
            .await
            .map_err(imap_err)?;

        let mut source = None;
        while let Some(message) = messages.next().await {
            let message = message.map_err(imap_err)?;
            if message.uid == Some(uid) {
                source = message.body().map(|b| b.to_vec());
            }
        }
        Ok(source)
    }

    async fn logout(&mut self) -> Result<()> {
        self.session.logout().await.map_err(imap_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullClient;

    #[async_trait]
    impl MailboxClient for NullClient {
        async fn search_since(&mut self, _since: NaiveDate) -> Result<Vec<u32>> {
            Ok(vec![])
        }
        async fn fetch_envelopes(&mut self, _uids: &[u32]) -> Result<Vec<Envelope>> {
            Ok(vec![])
        }
        async fn fetch_source(&mut self, _uid: u32) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
        async fn logout(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingConnector {
        connects: AtomicUsize,
    }

    #[async_trait]
    impl MailboxConnector for CountingConnector {
        async fn connect(&self) -> Result<Box<dyn MailboxClient>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(NullClient))
        }
    }

    #[tokio::test]
    async fn test_session_connects_lazily_once() {
        let connector = Arc::new(CountingConnector::default());
        let mut session = MailboxSession::new(connector.clone());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);

        session.client().await.unwrap();
        session.client().await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        session.recover().await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    /// Minimal IMAP responder for one connection: greeting, then tagged OKs.
    /// With `via_proxy` it first accepts an HTTP CONNECT.
    async fn serve_imap(listener: tokio::net::TcpListener, via_proxy: bool) -> Vec<String> {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let (socket, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(socket);
        let mut commands = Vec::new();

        if via_proxy {
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                if line.starts_with("CONNECT") {
                    commands.push(line.trim_end().to_string());
                }
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            reader
                .get_mut()
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
        }

        reader.get_mut().write_all(b"* OK IMAP4rev1 ready\r\n").await.unwrap();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
            let mut parts = line.split_whitespace();
            let tag = parts.next().unwrap_or("*").to_string();
            let command = parts.next().unwrap_or_default().to_uppercase();
            commands.push(command.clone());

            let reply = match command.as_str() {
                "EXAMINE" => format!(
                    "* FLAGS (\\Seen)\r\n* 2 EXISTS\r\n* 0 RECENT\r\n{} OK [READ-ONLY] EXAMINE completed\r\n",
                    tag
                ),
                "LOGOUT" => format!("* BYE\r\n{} OK LOGOUT completed\r\n", tag),
                _ => format!("{} OK {} completed\r\n", tag, command),
            };
            reader.get_mut().write_all(reply.as_bytes()).await.unwrap();
            if command == "LOGOUT" {
                break;
            }
        }
        commands
    }

    fn plaintext_config(port: u16) -> Config {
        let mut config = Config::default();
        config.email.imap.secure = false;
        config.email.imap.host = "127.0.0.1".to_string();
        config.email.imap.port = port;
        config.email.user = "collector@gmail.com".to_string();
        config.email.pass = "app-password".to_string();
        config
    }

    #[tokio::test]
    async fn test_plaintext_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_imap(listener, false));

        let connector = ImapConnector::new(ConfigHandle::in_memory(plaintext_config(port)));
        let mut client = connector.connect().await.unwrap();
        client.logout().await.unwrap();

        let commands = server.await.unwrap();
        assert_eq!(commands, vec!["LOGIN", "EXAMINE", "LOGOUT"]);
    }

    #[tokio::test]
    async fn test_connection_through_http_proxy() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_imap(listener, true));

        let mut config = plaintext_config(143);
        config.email.imap.host = "imap.example.com".to_string();
        config.proxy.enabled = true;
        config.proxy.protocol = "http".to_string();
        config.proxy.host = "127.0.0.1".to_string();
        config.proxy.port = proxy_port;

        let connector = ImapConnector::new(ConfigHandle::in_memory(config));
        let mut client = connector.connect().await.unwrap();
        client.logout().await.unwrap();

        let commands = server.await.unwrap();
        assert_eq!(commands[0], "CONNECT imap.example.com:143 HTTP/1.1");
        assert_eq!(&commands[1..], ["LOGIN", "EXAMINE", "LOGOUT"]);
    }

    #[tokio::test]
    async fn test_missing_user_is_a_config_error() {
        let connector = ImapConnector::new(ConfigHandle::in_memory(Config::default()));
        let result = connector.connect().await;
        assert!(matches!(result, Err(CloudMailError::Config(_))));
    }
}
