use std::{
    io,
    net::SocketAddr,
    sync::{Arc, Weak},
};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::{
    channel::ChannelShared,
    connection::{CloseReason, Connection, ConnectionState},
    connector::{self, ReceiptSender},
    error::SipsError,
    tls::{self, ExpectedPeerName},
};

/// 一次发送最终经由哪条路径完成。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// 写入了已注册的连接。
    Reused,
    /// 新建出站连接后写入。
    Established,
}

/// 发送回执：等待后台建连与写入的最终结果。
///
/// 不等待回执时行为与普通 `send` 一致，后台失败只记录日志。
#[derive(Debug)]
pub struct SendReceipt {
    channel: Arc<str>,
    receiver: oneshot::Receiver<Result<SendOutcome, SipsError>>,
}

impl SendReceipt {
    pub async fn outcome(self) -> Result<SendOutcome, SipsError> {
        self.receiver.await.unwrap_or_else(|_| {
            Err(SipsError::ChannelClosed {
                channel: self.channel,
            })
        })
    }
}

/// 排入连接写队列的一次发送。
///
/// `fallback` 保存调用方提供的期望证书名，连接写失败时据此改走出站建连。
pub(crate) struct QueuedWrite {
    peer: SocketAddr,
    message: Bytes,
    fallback: Option<ExpectedPeerName>,
    receipt: Option<ReceiptSender>,
}

/// 路由一次发送。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - 通道已关闭：返回 [`SipsError::ChannelClosed`]；
/// - 期望证书名非法：返回 [`SipsError::Configuration`]；
/// - 存在已注册连接：消息排入该连接的写队列后立即返回，写入在后台完成；
/// - 后台写入失败：按连接标识移除陈旧条目并通知其接收泵退出，随后有期望证书名时转交
///   出站连接器，否则以 [`SipsError::Configuration`] 失败（记录日志，回执收到该错误）；
/// - 不存在连接：必须提供期望证书名，否则返回 [`SipsError::Configuration`]；校验通过后
///   在后台建连。
///
/// ## 风险与权衡（Trade-offs）
/// - 本函数从不等待网络 I/O，停止读取的对端只会让其写队列增长；
/// - 同一对端的并发首发会各自建连，后注册者覆盖先注册者。
pub(crate) fn dispatch(
    shared: &Arc<ChannelShared>,
    peer: SocketAddr,
    message: Bytes,
    peer_name: Option<&str>,
    receipt: Option<ReceiptSender>,
) -> Result<(), SipsError> {
    shared.ensure_open()?;
    let fallback = peer_name
        .map(|name| tls::parse_peer_name(peer, name))
        .transpose()?;
    let write = QueuedWrite {
        peer,
        message,
        fallback,
        receipt,
    };

    if let Some(connection) = shared.registry().lookup(&peer) {
        enqueue(shared, &connection, write);
        return Ok(());
    }
    let QueuedWrite {
        message,
        fallback,
        receipt,
        ..
    } = write;
    let Some(expected) = fallback else {
        return Err(SipsError::missing_identity(peer));
    };
    connector::spawn_connect_and_send(Arc::clone(shared), peer, message, expected, receipt);
    Ok(())
}

pub(crate) fn receipt_pair(channel: Arc<str>) -> (ReceiptSender, SendReceipt) {
    let (sender, receiver) = oneshot::channel();
    (sender, SendReceipt { channel, receiver })
}

/// 放入连接的写队列；首个入队者负责启动该连接的写任务。
fn enqueue(shared: &Arc<ChannelShared>, connection: &Arc<Connection>, write: QueuedWrite) {
    if let Some(queue) = connection.take_write_queue() {
        tokio::spawn(drain_write_queue(
            Arc::clone(shared),
            Arc::downgrade(connection),
            queue,
        ));
    }
    if let Err(rejected) = connection.queue_write(write) {
        let error = not_connected(connection.peer());
        abandon(shared, connection, rejected, error);
    }
}

/// 写任务：按入队顺序逐条写出，连接释放后退出。
///
/// 任务只持有连接的弱引用，队列发送端随连接一起释放，不会形成引用环。
async fn drain_write_queue(
    shared: Arc<ChannelShared>,
    connection: Weak<Connection>,
    mut queue: mpsc::UnboundedReceiver<QueuedWrite>,
) {
    while let Some(write) = queue.recv().await {
        let Some(connection) = connection.upgrade() else {
            // 连接已释放，剩余消息只能改道。
            reroute(&shared, write);
            continue;
        };
        deliver(&shared, &connection, write).await;
    }
}

async fn deliver(shared: &Arc<ChannelShared>, connection: &Arc<Connection>, write: QueuedWrite) {
    let written = if connection.state() == ConnectionState::Active {
        tokio::select! {
            biased;
            _ = connection.closing() => Err(not_connected(connection.peer())),
            written = connection.write(&write.message) => written,
        }
    } else {
        Err(not_connected(connection.peer()))
    };

    match written {
        Ok(()) => {
            if let Some(receipt) = write.receipt {
                let _ = receipt.send(Ok(SendOutcome::Reused));
            }
        }
        Err(error) => abandon(shared, connection, write, error),
    }
}

/// 摘除写失败的连接，再为这条消息另寻出路。
fn abandon(
    shared: &Arc<ChannelShared>,
    connection: &Arc<Connection>,
    write: QueuedWrite,
    error: SipsError,
) {
    let removed = shared.registry().remove_connection(connection);
    connection.request_close(CloseReason::WriteFailed);
    tracing::warn!(
        channel = %shared.name(),
        peer = %connection.peer(),
        connection_id = %connection.id(),
        code = error.code(),
        error = %error,
        removed,
        "write failed; stale connection dropped"
    );
    reroute(shared, write);
}

/// 原连接不可用时的去向：同一对端的新连接、出站建连，或带着错误丢弃。
fn reroute(shared: &Arc<ChannelShared>, write: QueuedWrite) {
    if shared.is_closed() {
        let channel = Arc::clone(shared.name());
        return drop_write(shared, write, SipsError::ChannelClosed { channel });
    }
    if let Some(successor) = shared.registry().lookup(&write.peer) {
        return enqueue(shared, &successor, write);
    }
    match write.fallback {
        Some(expected) => connector::spawn_connect_and_send(
            Arc::clone(shared),
            write.peer,
            write.message,
            expected,
            write.receipt,
        ),
        None => {
            let error = SipsError::missing_identity(write.peer);
            drop_write(shared, write, error);
        }
    }
}

fn drop_write(shared: &ChannelShared, write: QueuedWrite, error: SipsError) {
    tracing::debug!(
        channel = %shared.name(),
        peer = %write.peer,
        code = error.code(),
        bytes = write.message.len(),
        "queued message dropped"
    );
    if let Some(receipt) = write.receipt {
        let _ = receipt.send(Err(error));
    }
}

fn not_connected(peer: SocketAddr) -> SipsError {
    SipsError::Write {
        peer,
        source: io::Error::from(io::ErrorKind::NotConnected),
    }
}
