use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::connection::{CloseReason, ConnectionId};

/// 上行事件接收者。
///
/// 回调在接收泵任务内同步执行，实现应尽快返回；需要异步处理时把事件转交给自己的任务，
/// 例如使用 [`ChannelEvents`]。同一连接的 `on_message` 按到达顺序调用，
/// `on_connection_closed` 对每条连接恰好触发一次。
///
/// 连接关闭事件描述的是一条连接实例，而不一定是对端下线：同一对端的新连接覆盖旧连接后，
/// 旧连接退出时仍会上报，此时注册表里已是另一条连接。需要区分两种情况的实现应比较
/// `connection` 与 [`SipsChannel::connections`](crate::SipsChannel::connections) 中该对端的标识。
pub trait ChannelEventHandler: Send + Sync + 'static {
    fn on_message(&self, channel: &str, peer: SocketAddr, message: Bytes);

    fn on_connection_closed(&self, peer: SocketAddr, connection: ConnectionId, reason: CloseReason);
}

/// 以消息形式描述的上行事件。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    MessageReceived {
        channel: Arc<str>,
        peer: SocketAddr,
        message: Bytes,
    },
    ConnectionClosed {
        peer: SocketAddr,
        connection_id: ConnectionId,
        reason: CloseReason,
    },
}

/// 把回调转为无界 mpsc 队列的事件接收者。
///
/// 接收端被丢弃后事件静默丢弃，通道本身不受影响。
#[derive(Debug, Clone)]
pub struct ChannelEvents {
    sender: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelEvents {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ChannelEventHandler for ChannelEvents {
    fn on_message(&self, channel: &str, peer: SocketAddr, message: Bytes) {
        let _ = self.sender.send(ChannelEvent::MessageReceived {
            channel: Arc::from(channel),
            peer,
            message,
        });
    }

    fn on_connection_closed(&self, peer: SocketAddr, connection: ConnectionId, reason: CloseReason) {
        let _ = self.sender.send(ChannelEvent::ConnectionClosed {
            peer,
            connection_id: connection,
            reason,
        });
    }
}
