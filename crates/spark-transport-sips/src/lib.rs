#![doc = r#"
# spark-transport-sips

## 设计动机（Why）
- **连接复用**：SIP over TLS（SIPS）要求面向同一对端的流量尽量复用单条加密连接，本 crate 维护
  "对端地址 → 活动连接" 的注册表，入站与出站连接共享同一张表；
- **故障隔离**：握手失败、读写失败、分帧违规只影响所在连接，记录结构化日志后消化，
  不会外溢给上层的发送调用；
- **可运维性**：错误携带稳定错误码，日志字段统一（`channel`、`peer`、`connection_id`、`code`）。

## 核心契约（What）
- [`SipsChannel`]：生命周期入口，`start` 启动监听，`send*` 按对端地址发送，`close` 幂等关闭；
- [`ChannelEventHandler`]：上行事件接口，报告成帧消息与连接关闭，[`ChannelEvents`] 提供 mpsc 实现；
- [`MessageFramer`]：分帧钩子，默认 [`SipStreamFramer`] 依据 `Content-Length` 切分字节流；
- [`PeerValidationPolicy`]：出站证书校验策略，默认宽松（告警放行），可切换为严格。

## 实现策略（How）
- `socket2` 负责地址复用与 backlog，`tokio` 负责接受循环、握手与读写任务；
- `rustls` + `tokio-rustls` 完成双向角色的 TLS 握手；
- `DashMap` 承载注册表，移除按连接标识比较，避免陈旧路径误删新连接。

## 风险与考量（Trade-offs）
- 宽松校验策略下出站连接无法防御中间人，是保留的已知弱点；
- 入站连接的握手、读取与写入有 5 秒截止时间，出站连接默认没有，二者可分别配置；
- 发送只把消息排入连接的写队列，从不等待对端；队列没有上限，停止读取的对端会让排队消息累积；
- 同一对端的并发首发可能各自建连，后注册者覆盖先注册者，被覆盖的连接退出时仍会上报关闭事件。
"#]

mod channel;
mod config;
mod connection;
mod connector;
mod dispatcher;
mod endpoint;
mod error;
mod events;
mod framing;
mod listener;
mod pump;
mod registry;
mod tls;
mod util;

pub use channel::SipsChannel;
pub use config::{ChannelConfig, LISTEN_BACKLOG, PeerValidationPolicy};
pub use connection::{
    CloseReason, ConnectionId, ConnectionRole, ConnectionSnapshot, ConnectionState,
};
pub use dispatcher::{SendOutcome, SendReceipt};
pub use endpoint::{ChannelEndpoint, PROTOCOL_TAG};
pub use error::{FramingError, SipsError};
pub use events::{ChannelEvent, ChannelEventHandler, ChannelEvents};
pub use framing::{FramerFactory, FramingBuffer, MessageFramer, SipStreamFramer, sip_framer_factory};
pub use tls::{ChannelCredentials, ServerIdentity};
