use std::{fmt, net::SocketAddr};

/// 传输协议标识，SIP `Via` 头中的 transport 参数取此值。
pub const PROTOCOL_TAG: &str = "TLS";

/// 通道的本地端点：监听地址与协议标识，启动后不可变。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelEndpoint {
    address: SocketAddr,
}

impl ChannelEndpoint {
    pub fn new(address: SocketAddr) -> Self {
        Self { address }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn protocol(&self) -> &'static str {
        PROTOCOL_TAG
    }

    /// 出站连接绑定的本地地址：沿用端点 IP，端口由内核分配。
    ///
    /// 端点为通配地址或地址族与对端不同时返回 `None`，交由内核选择源地址。
    pub(crate) fn outbound_source(&self, peer: SocketAddr) -> Option<SocketAddr> {
        let ip = self.address.ip();
        if ip.is_unspecified() || ip.is_ipv4() != peer.is_ipv4() {
            return None;
        }
        Some(SocketAddr::new(ip, 0))
    }
}

impl fmt::Display for ChannelEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, PROTOCOL_TAG)
    }
}
