use anyhow::Result;
use clap::Parser;
use socktunnel::{ConfigOverrides, DrainPolicy, FileConfig, HostKeyPolicy, TunnelConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(name = "socktunnel")]
#[clap(about = "Expose a remote Unix socket as a local TCP port over SSH", long_about = None)]
struct Cli {
    /// 設定ファイル (TOML)
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// ローカルの待ち受けアドレス [default: 127.0.0.1:2375]
    #[clap(long)]
    local_addr: Option<String>,

    /// SSHサーバー (例: host:22, ssh://user@host)
    #[clap(long, env = "DOCKER_HOST")]
    remote_addr: Option<String>,

    /// リモートのUnixソケット [default: /var/run/docker.sock]
    #[clap(long)]
    remote_socket: Option<PathBuf>,

    /// SSHユーザー
    #[clap(short, long, env = "SSH_USER")]
    user: Option<String>,

    /// 秘密鍵の内容
    #[clap(long, env = "SSH_PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    /// 秘密鍵ファイル
    #[clap(short, long)]
    identity: Option<PathBuf>,

    /// ホスト鍵のSHA256フィンガープリント (例: SHA256:...)
    #[clap(long)]
    host_key_fingerprint: Option<String>,

    /// known_hostsファイルでホスト鍵を検証
    #[clap(long)]
    known_hosts: Option<PathBuf>,

    /// ホスト鍵を検証しない
    #[clap(long)]
    insecure: bool,

    /// SSHキープアライブ間隔（秒、0で無効）
    #[clap(long)]
    keepalive_secs: Option<u64>,

    /// 同時接続数の上限
    #[clap(long)]
    max_connections: Option<usize>,

    /// 終了時の処理中接続の扱い (wait | abort)
    #[clap(long)]
    drain: Option<DrainPolicy>,
}

impl Cli {
    fn overrides(self) -> ConfigOverrides {
        let host_key = if let Some(fingerprint) = self.host_key_fingerprint {
            Some(HostKeyPolicy::Fingerprint { fingerprint })
        } else if let Some(path) = self.known_hosts {
            Some(HostKeyPolicy::KnownHosts { path })
        } else if self.insecure {
            Some(HostKeyPolicy::Insecure)
        } else {
            None
        };

        ConfigOverrides {
            local_addr: self.local_addr,
            remote_addr: self.remote_addr,
            remote_socket: self.remote_socket,
            user: self.user,
            private_key: self.private_key,
            private_key_file: self.identity,
            host_key,
            keepalive_secs: self.keepalive_secs,
            max_connections: self.max_connections,
            drain: self.drain,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ロギング設定
    let is_atty = atty::is(atty::Stream::Stdout);
    let level = "info";
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::from(level)),
        )
        .with_ansi(is_atty)
        .init();

    #[cfg(not(target_os = "windows"))]
    {
        // 同時接続数に合わせてnofileの上限を上げる
        fdlimit::raise_fd_limit();
    }

    let mut cli = Cli::parse();

    let file = match cli.config.take() {
        Some(path) => FileConfig::from_file(&path).await?,
        None => FileConfig::default(),
    };
    let config = TunnelConfig::resolve(file, cli.overrides())?;

    let tunnel = socktunnel::start_tunnel(config).await?;
    info!("Listening on {}", tunnel.local_addr());

    // Ctrl+Cまで待機
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    tunnel.shutdown().await?;

    Ok(())
}
