use anyhow::{anyhow, bail, Context, Result};
use russh::keys::PrivateKey;
use serde::Deserialize;
use std::fmt::{self, Debug, Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

pub const DEFAULT_LOCAL_ADDR: &str = "127.0.0.1:2375";
pub const DEFAULT_REMOTE_SOCKET: &str = "/var/run/docker.sock";
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_KEEPALIVE_SECS: u64 = 15;

/// SSHの認証情報（ユーザー名 + 秘密鍵）
#[derive(Clone)]
pub struct Credential {
    user: String,
    private_key: String,
}

impl Credential {
    pub fn new(user: impl Into<String>, private_key: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            private_key: private_key.into(),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// 秘密鍵をパースして署名鍵を取得
    pub fn signing_key(&self) -> Result<PrivateKey> {
        russh::keys::decode_secret_key(&self.private_key, None)
            .context("Failed to parse private key")
    }
}

// 鍵の中身はログに出さない
impl Debug for Credential {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user", &self.user)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// リモートホスト上のリソース（host:portではない）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetDescriptor {
    UnixSocket(PathBuf),
}

impl Display for TargetDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TargetDescriptor::UnixSocket(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// ホスト鍵の検証ポリシー
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// 全てのホスト鍵を受け入れる（検証なし）
    #[default]
    Insecure,
    /// SHA256フィンガープリントが一致する鍵のみ受け入れる
    Fingerprint { fingerprint: String },
    /// known_hostsに登録された鍵のみ受け入れる
    KnownHosts { path: PathBuf },
}

/// シャットダウン時に処理中のリレーをどう扱うか
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DrainPolicy {
    /// リレーが自然に終わるまで待つ
    Wait,
    /// リレーを即座に切断する
    #[default]
    Abort,
}

impl FromStr for DrainPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "wait" => Ok(DrainPolicy::Wait),
            "abort" => Ok(DrainPolicy::Abort),
            _ => bail!("Unknown drain policy `{}` (expected `wait` or `abort`)", s),
        }
    }
}

/// 設定ファイル (TOML)
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub local_addr: Option<String>,
    pub remote_addr: Option<String>,
    pub remote_socket: Option<PathBuf>,
    pub user: Option<String>,
    pub private_key: Option<String>,
    pub private_key_file: Option<PathBuf>,
    pub host_key: Option<HostKeyPolicy>,
    pub keepalive_secs: Option<u64>,
    pub max_connections: Option<usize>,
    pub drain: Option<DrainPolicy>,
}

impl FileConfig {
    pub async fn from_file(path: &Path) -> Result<Self> {
        let s = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read the config {}", path.display()))?;
        Self::from_toml(&s).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_toml(s: &str) -> Result<Self> {
        toml::from_str(s).context("Failed to parse the config as TOML")
    }
}

/// コマンドライン・環境変数からの上書き値
#[derive(Debug, Default)]
pub struct ConfigOverrides {
    pub local_addr: Option<String>,
    pub remote_addr: Option<String>,
    pub remote_socket: Option<PathBuf>,
    pub user: Option<String>,
    pub private_key: Option<String>,
    pub private_key_file: Option<PathBuf>,
    pub host_key: Option<HostKeyPolicy>,
    pub keepalive_secs: Option<u64>,
    pub max_connections: Option<usize>,
    pub drain: Option<DrainPolicy>,
}

/// 起動時に一度だけ読み込まれるトンネル設定
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub local_addr: String,
    pub remote_addr: String,
    pub remote_target: TargetDescriptor,
    pub credential: Credential,
    pub host_key: HostKeyPolicy,
    /// Noneならキープアライブ無効
    pub keepalive: Option<Duration>,
    /// Noneなら同時接続数は無制限
    pub max_connections: Option<usize>,
    pub drain: DrainPolicy,
}

impl TunnelConfig {
    /// 設定ファイルと上書き値をマージ（上書き値が優先）
    pub fn resolve(file: FileConfig, overrides: ConfigOverrides) -> Result<Self> {
        let remote = overrides
            .remote_addr
            .or(file.remote_addr)
            .ok_or_else(|| anyhow!("Remote address is not set (--remote-addr, DOCKER_HOST or `remote_addr`)"))?;
        let (url_user, remote_addr) = parse_remote_addr(&remote)?;

        let user = overrides
            .user
            .or(url_user)
            .or(file.user)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| anyhow!("SSH user is not set (--user, SSH_USER or `user`)"))?;

        let private_key = if let Some(path) = overrides.private_key_file {
            read_key_file(&path)?
        } else if let Some(key) = overrides.private_key {
            key
        } else if let Some(path) = file.private_key_file {
            read_key_file(&path)?
        } else if let Some(key) = file.private_key {
            key
        } else {
            bail!("Private key is not set (--identity, SSH_PRIVATE_KEY, `private_key` or `private_key_file`)");
        };

        let max_connections = overrides.max_connections.or(file.max_connections);
        if max_connections == Some(0) {
            bail!("`max_connections` must be greater than 0");
        }

        let keepalive_secs = overrides
            .keepalive_secs
            .or(file.keepalive_secs)
            .unwrap_or(DEFAULT_KEEPALIVE_SECS);

        Ok(TunnelConfig {
            local_addr: overrides
                .local_addr
                .or(file.local_addr)
                .unwrap_or_else(|| DEFAULT_LOCAL_ADDR.to_string()),
            remote_addr,
            remote_target: TargetDescriptor::UnixSocket(
                overrides
                    .remote_socket
                    .or(file.remote_socket)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_REMOTE_SOCKET)),
            ),
            credential: Credential::new(user, private_key),
            host_key: overrides.host_key.or(file.host_key).unwrap_or_default(),
            keepalive: (keepalive_secs > 0).then(|| Duration::from_secs(keepalive_secs)),
            max_connections,
            drain: overrides.drain.or(file.drain).unwrap_or_default(),
        })
    }
}

fn read_key_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read private key {}", path.display()))
}

/// `host:port` または `ssh://user@host:port` を解釈
///
/// URL形式の場合はユーザー名も返す。ポート省略時は22。
pub fn parse_remote_addr(s: &str) -> Result<(Option<String>, String)> {
    if !s.contains("://") {
        if s.is_empty() {
            bail!("Remote address is empty");
        }
        let addr = if s.starts_with('[') {
            if s.contains("]:") {
                s.to_string()
            } else {
                format!("{}:{}", s, DEFAULT_SSH_PORT)
            }
        } else {
            // コロンが2つ以上なら括弧なしのIPv6アドレス
            match s.matches(':').count() {
                0 => format!("{}:{}", s, DEFAULT_SSH_PORT),
                1 => s.to_string(),
                _ => format!("[{}]:{}", s, DEFAULT_SSH_PORT),
            }
        };
        return Ok((None, addr));
    }

    let url = Url::parse(s).with_context(|| format!("Invalid remote address `{}`", s))?;
    if url.scheme() != "ssh" {
        bail!("Unsupported scheme `{}` in `{}`, expected ssh://", url.scheme(), s);
    }
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("Missing host in `{}`", s))?;
    let port = url.port().unwrap_or(DEFAULT_SSH_PORT);
    let user = Some(url.username())
        .filter(|u| !u.is_empty())
        .map(str::to_string);

    Ok((user, format!("{}:{}", host, port)))
}
