// SSH越しにリモートのUnixソケットをローカルのTCPポートとして公開する

mod config;
mod listener;
mod relay;
mod session;
mod supervisor;
mod tunnel;

// パブリックAPI
pub use config::{
    parse_remote_addr, ConfigOverrides, Credential, DrainPolicy, FileConfig, HostKeyPolicy,
    TargetDescriptor, TunnelConfig,
};
pub use listener::{Acceptor, LocalListener};
pub use relay::{relay, Direction, RelayStats};
pub use session::{ChannelOpener, Session, SessionOptions};
pub use supervisor::{Supervisor, SupervisorOptions};
pub use tunnel::{start_tunnel, Tunnel};
