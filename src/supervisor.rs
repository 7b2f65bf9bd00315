use anyhow::Result;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{DrainPolicy, TargetDescriptor};
use crate::listener::Acceptor;
use crate::relay::relay;
use crate::session::ChannelOpener;

const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_millis(100);

/// スーパーバイザーの動作オプション
#[derive(Debug, Clone, Copy, Default)]
pub struct SupervisorOptions {
    /// 同時接続数の上限（Noneなら無制限）
    pub max_connections: Option<usize>,
    pub drain: DrainPolicy,
}

/// 受け付けループを持ち、接続ごとにチャネルを開いてリレーを起動する
///
/// 接続ごとの失敗は他の接続やリスナーに影響しない。
pub struct Supervisor<O: ChannelOpener> {
    opener: Arc<O>,
    target: Arc<TargetDescriptor>,
    drain: DrainPolicy,
    limiter: Option<Arc<Semaphore>>,
}

impl<O: ChannelOpener> Supervisor<O> {
    pub fn new(opener: Arc<O>, target: TargetDescriptor, options: SupervisorOptions) -> Self {
        Self {
            opener,
            target: Arc::new(target),
            drain: options.drain,
            limiter: options
                .max_connections
                .map(|n| Arc::new(Semaphore::new(n))),
        }
    }

    /// シャットダウン要求まで接続を受け付け続ける
    ///
    /// 終了時はリスナーを閉じ、処理中のリレーはドレインポリシーに従う。
    pub async fn run<A: Acceptor>(
        self,
        mut listener: A,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        // accept失敗が続いてもビジーループにならないように
        let mut backoff = ExponentialBackoff {
            initial_interval: ACCEPT_BACKOFF_INITIAL,
            current_interval: ACCEPT_BACKOFF_INITIAL,
            max_interval: ACCEPT_BACKOFF_MAX,
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut relays = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            backoff.reset();
                            self.dispatch(&mut relays, stream, peer);
                        }
                        Err(e) => {
                            let delay = backoff.next_backoff().unwrap_or(ACCEPT_BACKOFF_MAX);
                            error!("Failed to accept local connection: {}. Retry in {:?}...", e, delay);
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
                Some(joined) = relays.join_next(), if !relays.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Connection task panicked: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Tunnel shutdown requested");
                    break;
                }
            }
        }

        drop(listener);

        match self.drain {
            DrainPolicy::Wait => {
                info!("Waiting for {} connection(s) to finish", relays.len());
                while relays.join_next().await.is_some() {}
            }
            DrainPolicy::Abort => {
                if !relays.is_empty() {
                    info!("Closing {} connection(s)", relays.len());
                }
                relays.shutdown().await;
            }
        }

        Ok(())
    }

    fn dispatch<S>(&self, relays: &mut JoinSet<()>, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let permit = match self.admit() {
            Some(permit) => permit,
            None => {
                warn!("Connection limit reached, closing connection from {}", peer);
                return;
            }
        };

        let opener = self.opener.clone();
        let target = self.target.clone();
        relays.spawn(async move {
            let _permit = permit;
            handle_connection(opener.as_ref(), &target, stream, peer).await;
        });
    }

    // 上限なしならSome(None)、上限に達していればNone
    fn admit(&self) -> Option<Option<OwnedSemaphorePermit>> {
        match &self.limiter {
            Some(limiter) => limiter.clone().try_acquire_owned().ok().map(Some),
            None => Some(None),
        }
    }
}

/// 1接続の処理: Accepted -> ChannelOpening -> Relaying/ChannelOpenFailed -> Closed
async fn handle_connection<O, S>(opener: &O, target: &TargetDescriptor, stream: S, peer: SocketAddr)
where
    O: ChannelOpener,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    debug!("Accepted connection from {}, opening channel to {}", peer, target);

    let remote = match opener.open_channel(target).await {
        Ok(remote) => remote,
        Err(e) => {
            // ローカル接続はここでドロップされて閉じる
            warn!("Failed to open channel for {}: {:#}", peer, e);
            return;
        }
    };

    debug!("Relaying {} <-> {}", peer, target);
    let stats = relay(stream, remote).await;
    debug!(
        "Connection from {} closed ({} finished first, {} bytes up, {} bytes down)",
        peer, stats.first_closed, stats.local_to_remote, stats.remote_to_local
    );
}
