use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::keys::{HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh::ChannelStream;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::config::{Credential, HostKeyPolicy, TargetDescriptor};

const KEEPALIVE_MAX: usize = 3;

/// リモートにチャネルを開く能力
///
/// 複数のタスクから同時に呼ばれる。
#[async_trait]
pub trait ChannelOpener: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn open_channel(&self, target: &TargetDescriptor) -> Result<Self::Stream>;
}

/// セッション確立時のオプション
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub host_key: HostKeyPolicy,
    pub keepalive: Option<Duration>,
}

struct ClientHandler {
    policy: HostKeyPolicy,
    host: String,
    port: u16,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(verify_host_key(
            &self.policy,
            &self.host,
            self.port,
            server_public_key,
        ))
    }
}

/// ホスト鍵をポリシーに照らして判定
fn verify_host_key(policy: &HostKeyPolicy, host: &str, port: u16, key: &PublicKey) -> bool {
    let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();

    match policy {
        HostKeyPolicy::Insecure => {
            warn!(
                "Host key of {}:{} is not verified ({})",
                host, port, fingerprint
            );
            true
        }
        HostKeyPolicy::Fingerprint { fingerprint: expected } => {
            if fingerprint == *expected {
                debug!("Host key matched {}", fingerprint);
                true
            } else {
                warn!(
                    "Host key mismatch for {}:{}: expected {}, got {}",
                    host, port, expected, fingerprint
                );
                false
            }
        }
        HostKeyPolicy::KnownHosts { path } => {
            match russh::keys::check_known_hosts_path(host, port, key, path) {
                Ok(true) => true,
                Ok(false) => {
                    warn!(
                        "Host key of {}:{} ({}) is not in {}",
                        host,
                        port,
                        fingerprint,
                        path.display()
                    );
                    false
                }
                Err(e) => {
                    warn!("Failed to check {}: {}", path.display(), e);
                    false
                }
            }
        }
    }
}

/// 確立済みのSSHセッション
///
/// 下層のTCP接続を専有する。再認証なしで何本でもチャネルを開けるが、
/// 接続が切れた後は全てのチャネルが使えなくなる。
pub struct Session {
    handle: Handle<ClientHandler>,
    remote_addr: String,
}

impl Session {
    /// SSHセッションを確立
    ///
    /// 鍵のパースはネットワーク接続より先に行う。リトライはしない。
    pub async fn establish(
        credential: &Credential,
        remote_addr: &str,
        options: SessionOptions,
    ) -> Result<Self> {
        let key = credential.signing_key()?;
        let (host, port) = split_host_port(remote_addr)?;

        let config = Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: options.keepalive,
            keepalive_max: KEEPALIVE_MAX,
            ..Default::default()
        });
        let handler = ClientHandler {
            policy: options.host_key,
            host: host.clone(),
            port,
        };

        debug!("Connecting to {}", remote_addr);
        let mut handle = client::connect(config, (host.as_str(), port), handler)
            .await
            .with_context(|| format!("Failed to establish SSH connection to {}", remote_addr))?;

        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .context("Failed to negotiate RSA hash")?
            .flatten();
        let auth = handle
            .authenticate_publickey(
                credential.user(),
                PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
            )
            .await
            .with_context(|| format!("Failed to authenticate as {}", credential.user()))?;
        if !auth.success() {
            bail!(
                "Public key authentication rejected for {}@{}",
                credential.user(),
                remote_addr
            );
        }

        info!("SSH session established: {}@{}", credential.user(), remote_addr);

        Ok(Self {
            handle,
            remote_addr: remote_addr.to_string(),
        })
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }
}

#[async_trait]
impl ChannelOpener for Session {
    type Stream = ChannelStream<Msg>;

    async fn open_channel(&self, target: &TargetDescriptor) -> Result<Self::Stream> {
        let channel = match target {
            TargetDescriptor::UnixSocket(path) => self
                .handle
                .channel_open_direct_streamlocal(path.to_string_lossy().into_owned())
                .await
                .with_context(|| format!("Failed to open channel to {}", target))?,
        };
        Ok(channel.into_stream())
    }
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("Missing port in `{}`", addr))?;
    let port = port
        .parse()
        .with_context(|| format!("Invalid port in `{}`", addr))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}
