// ABOUTME: SSH transport built on russh
//
// One SshSession wraps one authenticated russh client handle. Every spawned
// process gets its own session channel, optionally with a PTY attached, which
// is what keeps stdout line-buffered for tools that fully buffer when not on a
// terminal.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect, Sig};
use russh_keys::key;
use tracing::{debug, info, warn};

use super::{Connector, ProcessOutput, PtyRequest, RemoteProcess, RemoteSession, TransportError};
use crate::pool::config::{Credentials, EndpointConfig, KeepaliveConfig};

/// SSH extended data stream number for stderr
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

// === Client Handler ===

/// russh callback handler
///
/// Host keys are accepted and logged; the endpoint is a single operator-owned
/// host reached over a trusted network.
struct ClientHandler {
    endpoint: String,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            endpoint = %self.endpoint,
            fingerprint = %server_public_key.fingerprint(),
            "Accepting server host key"
        );
        Ok(true)
    }
}

// === Connector ===

/// Opens SSH sessions to the configured endpoint
pub struct SshConnector {
    endpoint: EndpointConfig,
    client_config: Arc<client::Config>,
}

impl std::fmt::Debug for SshConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnector")
            .field("host", &self.endpoint.host)
            .field("port", &self.endpoint.port)
            .field("username", &self.endpoint.username)
            .finish_non_exhaustive()
    }
}

impl SshConnector {
    /// Create a connector for `endpoint` with the given keepalive policy
    pub fn new(endpoint: EndpointConfig, keepalive: &KeepaliveConfig) -> Self {
        let client_config = client::Config {
            // Liveness is handled by keepalives, not by inactivity
            inactivity_timeout: None,
            keepalive_interval: Some(keepalive.interval),
            keepalive_max: keepalive.max_missed,
            ..Default::default()
        };

        Self {
            endpoint,
            client_config: Arc::new(client_config),
        }
    }

    async fn resolve(&self) -> Result<SocketAddr, TransportError> {
        let addrs: Vec<SocketAddr> =
            tokio::net::lookup_host((self.endpoint.host.as_str(), self.endpoint.port))
                .await?
                .collect();

        pick_address(&addrs, self.endpoint.force_ipv4)
            .ok_or_else(|| TransportError::Resolve(self.endpoint.host.clone()))
    }

    async fn authenticate(&self, handle: &mut Handle<ClientHandler>) -> Result<(), TransportError> {
        let user = self.endpoint.username.clone();
        let accepted = match &self.endpoint.credentials {
            Credentials::PrivateKey { path, passphrase } => {
                let key_pair = russh_keys::load_secret_key(path, passphrase.as_deref())?;
                handle.authenticate_publickey(user.clone(), Arc::new(key_pair)).await?
            }
            Credentials::Password { password } => {
                handle.authenticate_password(user.clone(), password.clone()).await?
            }
        };

        if accepted {
            Ok(())
        } else {
            Err(TransportError::AuthRejected { user })
        }
    }
}

/// Choose the address to dial, preferring IPv4 when asked to
fn pick_address(addrs: &[SocketAddr], prefer_ipv4: bool) -> Option<SocketAddr> {
    if prefer_ipv4 {
        if let Some(v4) = addrs.iter().find(|a| a.is_ipv4()) {
            return Some(*v4);
        }
    }
    addrs.first().copied()
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self) -> Result<Arc<dyn RemoteSession>, TransportError> {
        let addr = self.resolve().await?;
        let handler = ClientHandler {
            endpoint: self.endpoint(),
        };

        let mut handle = client::connect(Arc::clone(&self.client_config), addr, handler).await?;

        if let Err(e) = self.authenticate(&mut handle).await {
            // Never leave a half-open session behind
            let _ = handle.disconnect(Disconnect::ByApplication, "authentication failed", "en").await;
            return Err(e);
        }

        info!(endpoint = %self.endpoint(), %addr, "SSH session established");
        Ok(Arc::new(SshSession {
            handle,
            endpoint: self.endpoint(),
        }))
    }

    fn endpoint(&self) -> String {
        format!(
            "{}@{}:{}",
            self.endpoint.username, self.endpoint.host, self.endpoint.port
        )
    }
}

// === Session ===

/// One authenticated SSH session
pub struct SshSession {
    handle: Handle<ClientHandler>,
    endpoint: String,
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn spawn(
        &self,
        command: &str,
        pty: Option<&PtyRequest>,
    ) -> Result<Box<dyn RemoteProcess>, TransportError> {
        let channel = self.handle.channel_open_session().await?;

        if let Some(pty) = pty {
            channel
                .request_pty(
                    false,
                    &pty.term,
                    u32::from(pty.cols),
                    u32::from(pty.rows),
                    0,
                    0,
                    &[],
                )
                .await?;
        }

        channel.exec(true, command).await?;
        debug!(endpoint = %self.endpoint, pty = pty.is_some(), "Remote command started");

        Ok(Box::new(SshProcess {
            channel,
            exit_status: None,
            finished: false,
        }))
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn close(&self) {
        if self.handle.is_closed() {
            return;
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(endpoint = %self.endpoint, error = %e, "Error while disconnecting");
        }
    }
}

// === Process ===

/// A command running on an SSH channel
struct SshProcess {
    channel: Channel<Msg>,
    exit_status: Option<u32>,
    finished: bool,
}

#[async_trait]
impl RemoteProcess for SshProcess {
    async fn next_output(&mut self) -> Option<Result<ProcessOutput, TransportError>> {
        if self.finished {
            return None;
        }

        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { ref data }) => {
                    return Some(Ok(ProcessOutput::Stdout(data.to_vec())));
                }
                Some(ChannelMsg::ExtendedData { ref data, ext }) => {
                    if ext == SSH_EXTENDED_DATA_STDERR {
                        return Some(Ok(ProcessOutput::Stderr(data.to_vec())));
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    // Data may still follow; report the exit once the channel closes
                    self.exit_status = Some(exit_status);
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    debug!(signal = ?signal_name, "Remote process killed by signal");
                }
                Some(_) => {}
                None => {
                    self.finished = true;
                    return match self.exit_status {
                        Some(code) => Some(Ok(ProcessOutput::Exit(code))),
                        None => Some(Err(TransportError::ChannelClosed(
                            "channel closed without an exit status".to_string(),
                        ))),
                    };
                }
            }
        }
    }

    async fn terminate(&mut self) -> Result<(), TransportError> {
        if self.finished {
            return Ok(());
        }
        // Many servers ignore signal requests; closing the channel hangs up the PTY
        if let Err(e) = self.channel.signal(Sig::TERM).await {
            warn!(error = %e, "Failed to signal remote process");
        }
        self.channel.close().await?;
        self.finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_address_prefers_ipv4() {
        let v6: SocketAddr = "[::1]:22".parse().unwrap();
        let v4: SocketAddr = "127.0.0.1:22".parse().unwrap();

        assert_eq!(pick_address(&[v6, v4], true), Some(v4));
        assert_eq!(pick_address(&[v6, v4], false), Some(v6));
        assert_eq!(pick_address(&[v6], true), Some(v6));
        assert_eq!(pick_address(&[], true), None);
    }

    #[test]
    fn test_endpoint_description() {
        let endpoint = EndpointConfig {
            host: "vps.example.com".to_string(),
            port: 2222,
            username: "gateway".to_string(),
            ..EndpointConfig::default()
        };
        let connector = SshConnector::new(endpoint, &KeepaliveConfig::default());
        assert_eq!(connector.endpoint(), "gateway@vps.example.com:2222");
    }
}
