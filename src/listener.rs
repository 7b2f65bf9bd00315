use anyhow::{Context, Result};
use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, trace};

const TCP_KEEPALIVE_TIME: Duration = Duration::from_secs(20);
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(8);

/// 接続を順番に受け付けるもの
#[async_trait]
pub trait Acceptor: Send {
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn accept(&mut self) -> io::Result<(Self::Conn, SocketAddr)>;
}

/// ローカル側のTCPリスナー
///
/// 一度閉じたら再利用できない。再開するには`bind`し直す。
pub struct LocalListener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl LocalListener {
    pub async fn bind(addr: &str) -> Result<Self> {
        let inner = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        let local_addr = inner
            .local_addr()
            .with_context(|| format!("Failed to get local address of {}", addr))?;

        Ok(Self { inner, local_addr })
    }

    /// 実際にバインドされたアドレス（ポート0指定時の確認用）
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 接続を1つ受け付ける
    ///
    /// エラーは一時的なものとして呼び出し側で扱う。
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await?;

        // ソケットオプションはベストエフォート
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        if let Err(e) = try_set_tcp_keepalive(&stream, TCP_KEEPALIVE_TIME, TCP_KEEPALIVE_INTERVAL) {
            debug!("Failed to set TCP keepalive for {}: {}", peer, e);
        }

        Ok((stream, peer))
    }
}

#[async_trait]
impl Acceptor for LocalListener {
    type Conn = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        LocalListener::accept(self).await
    }
}

fn try_set_tcp_keepalive(
    conn: &TcpStream,
    keepalive_duration: Duration,
    keepalive_interval: Duration,
) -> io::Result<()> {
    let s = SockRef::from(conn);
    let keepalive = TcpKeepalive::new()
        .with_time(keepalive_duration)
        .with_interval(keepalive_interval);

    trace!(
        "Set TCP keepalive {:?} {:?}",
        keepalive_duration,
        keepalive_interval
    );

    s.set_tcp_keepalive(&keepalive)
}
