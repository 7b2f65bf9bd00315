use std::fmt::{self, Display, Formatter};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);
const COPY_BUF_SIZE: usize = 8 * 1024;

/// 先に終了したコピー方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    LocalToRemote,
    RemoteToLocal,
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Direction::LocalToRemote => write!(f, "Local -> Remote"),
            Direction::RemoteToLocal => write!(f, "Remote -> Local"),
        }
    }
}

/// リレー終了時の統計
#[derive(Debug)]
pub struct RelayStats {
    /// 最初に終わった方向
    pub first_closed: Direction,
    /// ローカルからリモートへ書き込んだバイト数
    pub local_to_remote: u64,
    /// リモートからローカルへ書き込んだバイト数
    pub remote_to_local: u64,
    /// 最初に終わった方向のエラー（EOFならNone）
    pub error: Option<io::Error>,
}

/// ローカル接続とリモートチャネルの間で双方向コピー
///
/// どちらかの方向が終わった時点で両端を閉じる（ハーフクローズなし）。
/// コピー中のエラーはこのリレーだけを終わらせる。
pub async fn relay<L, R>(local: L, remote: R) -> RelayStats
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let mut local_to_remote = 0u64;
    let mut remote_to_local = 0u64;

    // selectで負けた側のfutureはドロップされるが、カウンタは残る
    let (first_closed, result) = {
        let upstream = copy_counted(&mut local_read, &mut remote_write, &mut local_to_remote);
        let downstream = copy_counted(&mut remote_read, &mut local_write, &mut remote_to_local);

        tokio::select! {
            result = upstream => (Direction::LocalToRemote, result),
            result = downstream => (Direction::RemoteToLocal, result),
        }
    };

    if let Err(e) = &result {
        debug!("{} error: {}", first_closed, e);
    }
    debug!(
        "Local -> Remote: {} bytes, Remote -> Local: {} bytes",
        local_to_remote, remote_to_local
    );

    // ローカル側を先に閉じる。リモートが死んでいてもクライアントは待たされない
    shutdown_write(&mut local_write, "local").await;
    shutdown_write(&mut remote_write, "remote").await;
    drop((local_read, local_write, remote_read, remote_write));

    RelayStats {
        first_closed,
        local_to_remote,
        remote_to_local,
        error: result.err(),
    }
}

/// EOFまでコピーし、書き込みが完了したバイト数を`counter`に積む
async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, counter: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return writer.flush().await;
        }
        writer.write_all(&buf[..n]).await?;
        *counter += n as u64;
    }
}

async fn shutdown_write<W: AsyncWrite + Unpin>(writer: &mut W, side: &str) {
    match timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Failed to shut down {} side: {}", side, e),
        Err(_) => debug!("Timeout shutting down {} side", side),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Instant;
    use tokio::io::{duplex, DuplexStream, ReadBuf};

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_ping_pong() {
        let (local, mut client) = duplex(1024);
        let (remote, mut server) = duplex(1024);

        let handle = tokio::spawn(relay(local, remote));

        client.write_all(b"PING").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING");

        server.write_all(b"PONG!!").await.unwrap();
        let mut reply = [0u8; 6];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"PONG!!");

        // クライアントを閉じたらリモートも閉じられる
        drop(client);
        let n = timeout(TEST_TIMEOUT, server.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        let stats = timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
        assert_eq!(stats.first_closed, Direction::LocalToRemote);
        assert!(stats.error.is_none());
        // 両方向のバイト数が残っている
        assert_eq!(stats.local_to_remote, 4);
        assert_eq!(stats.remote_to_local, 6);
    }

    #[tokio::test]
    async fn test_remote_close_closes_local() {
        let (local, mut client) = duplex(1024);
        let (remote, server) = duplex(1024);

        let handle = tokio::spawn(relay(local, remote));

        drop(server);
        let mut buf = [0u8; 16];
        let n = timeout(TEST_TIMEOUT, client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        let stats = timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
        assert_eq!(stats.first_closed, Direction::RemoteToLocal);
        assert_eq!(stats.local_to_remote, 0);
        assert_eq!(stats.remote_to_local, 0);
    }

    #[tokio::test]
    async fn test_large_payload_both_directions() {
        let (local, client) = duplex(4096);
        let (remote, server) = duplex(4096);

        let handle = tokio::spawn(relay(local, remote));

        let upstream: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
        let downstream: Vec<u8> = (0..128 * 1024).map(|i| (i % 239) as u8).collect();

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        let up = upstream.clone();
        let client_writer = tokio::spawn(async move {
            client_write.write_all(&up).await.unwrap();
            client_write
        });
        let down = downstream.clone();
        let server_writer = tokio::spawn(async move {
            server_write.write_all(&down).await.unwrap();
            server_write
        });

        let mut received_by_server = vec![0u8; upstream.len()];
        server_read.read_exact(&mut received_by_server).await.unwrap();
        let mut received_by_client = vec![0u8; downstream.len()];
        client_read.read_exact(&mut received_by_client).await.unwrap();

        assert_eq!(received_by_server, upstream);
        assert_eq!(received_by_client, downstream);

        let client_write = client_writer.await.unwrap();
        let _server_write = server_writer.await.unwrap();

        drop(client_write);
        drop(client_read);
        let stats = timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
        assert_eq!(stats.local_to_remote, upstream.len() as u64);
        assert_eq!(stats.remote_to_local, downstream.len() as u64);
    }

    /// shutdownが終わらないリモート（切れたSSHセッション相当）
    struct StuckShutdown(DuplexStream);

    impl AsyncRead for StuckShutdown {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for StuckShutdown {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    #[tokio::test]
    async fn test_local_closed_before_stuck_remote() {
        let (local, mut client) = duplex(1024);
        let (remote, server) = duplex(1024);

        let handle = tokio::spawn(relay(local, StuckShutdown(remote)));

        let started = Instant::now();
        drop(server);

        // リモートのshutdownを待たずにクライアントへEOFが届く
        let mut buf = [0u8; 16];
        let n = timeout(TEST_TIMEOUT, client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(started.elapsed() < SHUTDOWN_TIMEOUT);

        let stats = timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
        assert_eq!(stats.first_closed, Direction::RemoteToLocal);
    }
}
