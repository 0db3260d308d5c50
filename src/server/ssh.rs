use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info};
use russh::client::{self, Handle};
use russh::keys::{decode_secret_key, load_secret_key, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect};
use tokio::time::{timeout, Instant};

use crate::server::model::{ConnectSpec, TunnelAuth};

/// Deadline for opening one direct-tcpip channel.
const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Raised when key auth is configured but no usable key can be resolved.
#[derive(Debug, thiserror::Error)]
#[error("no usable private key")]
pub struct NoKeyError;

#[derive(Clone, Debug, Copy)]
pub(crate) struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// One authenticated SSH session. Cloning shares the underlying handle, so
/// SOCKS sessions and the health monitor can open channels concurrently.
#[derive(Clone)]
pub struct SshClient {
    session: Arc<Handle<ClientHandler>>,
}

impl SshClient {
    /// TCP dial under the connect deadline. Authentication is a separate
    /// step so the worker can surface its own state transition in between.
    pub async fn dial(spec: &ConnectSpec) -> Result<Handle<ClientHandler>> {
        let config = Arc::new(client::Config {
            keepalive_interval: Some(spec.keepalive_interval),
            ..Default::default()
        });

        let addr = Self::resolve_addr(&spec.host, spec.ssh_port).await?;
        debug!("dialing {}:{} ({addr})", spec.host, spec.ssh_port);

        let session = timeout(
            spec.connect_timeout,
            client::connect(config, addr, ClientHandler),
        )
        .await
        .context("ssh dial timed out")??;

        Ok(session)
    }

    pub async fn authenticate(
        mut session: Handle<ClientHandler>,
        spec: &ConnectSpec,
    ) -> Result<Self> {
        let auth_res = match &spec.auth {
            TunnelAuth::Password(password) => {
                session
                    .authenticate_password(&spec.username, password)
                    .await?
            }
            TunnelAuth::Key {
                material,
                path,
                passphrase,
            } => {
                let key = if let Some(pem) = material {
                    decode_secret_key(pem, passphrase.as_deref())
                        .context("failed to decode stored private key")
                        .map_err(|e| {
                            debug!("{e:#}");
                            anyhow::Error::new(NoKeyError)
                        })?
                } else if let Some(path) = path {
                    load_secret_key(path, passphrase.as_deref())
                        .context("failed to load private key file")
                        .map_err(|e| {
                            debug!("{e:#}");
                            anyhow::Error::new(NoKeyError)
                        })?
                } else {
                    return Err(NoKeyError.into());
                };

                session
                    .authenticate_publickey(
                        &spec.username,
                        PrivateKeyWithHashAlg::new(
                            Arc::new(key),
                            session.best_supported_rsa_hash().await?.flatten(),
                        ),
                    )
                    .await?
            }
        };

        if !auth_res.success() {
            return Err(russh::Error::NotAuthenticated.into());
        }

        info!("ssh authentication complete for {}@{}", spec.username, spec.host);
        Ok(Self {
            session: Arc::new(session),
        })
    }

    /// Open a forwarding channel to the CONNECT target.
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
    ) -> Result<russh::ChannelStream<client::Msg>> {
        let channel = timeout(
            CHANNEL_OPEN_TIMEOUT,
            self.session
                .channel_open_direct_tcpip(host, port as u32, "0.0.0.0", 0),
        )
        .await
        .context("ssh channel open timed out")?
        .with_context(|| format!("failed to open channel to {host}:{port}"))?;

        Ok(channel.into_stream())
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Liveness probe: run a no-op remote command and time the round trip.
    pub async fn measure_latency(&self, deadline: Duration) -> Result<Duration> {
        let start = Instant::now();
        timeout(deadline, self.exec_noop())
            .await
            .context("latency probe timed out")??;
        Ok(start.elapsed())
    }

    async fn exec_noop(&self) -> Result<()> {
        let mut channel = self.session.channel_open_session().await?;
        channel.exec(true, "true").await?;
        loop {
            match channel.wait().await {
                Some(ChannelMsg::ExitStatus { .. }) | None => break,
                Some(_) => {}
            }
        }
        Ok(())
    }

    pub async fn disconnect(&self) {
        let _ = self
            .session
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }

    async fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr> {
        let target = format!("{host}:{port}");
        let result = tokio::net::lookup_host(&target)
            .await
            .context("failed to resolve hostname")?
            .next()
            .ok_or_else(|| anyhow::anyhow!("hostname resolved but no address found"));
        result
    }
}
