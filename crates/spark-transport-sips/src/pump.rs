use std::{io, sync::Arc, time::Duration};

use tokio::{io::AsyncReadExt, task::JoinHandle};

use crate::{
    connection::{BoxedReader, CloseReason, Connection},
    error::{self, SipsError},
    events::ChannelEventHandler,
    framing::FramingBuffer,
    registry::ConnectionRegistry,
    util::run_with_deadline,
};

/// 单连接接收泵。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 每条连接独占一个读任务，任何时刻只有一个未完成的读；读完成后先分帧、按序上报，
///   再发起下一次读；
/// - 断开检测集中在这里：EOF、读错误、分帧违规与本地关闭都经由同一出口移除注册表条目
///   并上报 `ConnectionClosed`。
///
/// ## 契约（What）
/// - 读到 0 字节视为对端关闭，读错误视为断开，二者都不会返回给发送方；
/// - `read_timeout` 为 `Some` 时单次读取超时按读失败断开；入站连接默认 5 秒，出站连接不设；
/// - 注册表移除按连接标识比较，写失败路径已经移除时本泵不会误删新连接；
/// - `ConnectionClosed` 每条连接恰好上报一次，携带连接标识。
///
/// ## 风险与权衡（Trade-offs）
/// - 入站读截止时间会断开静默超过时限的健康连接，需要长连接保活的部署应调大或关闭它。
pub(crate) struct ReceivePump {
    channel: Arc<str>,
    connection: Arc<Connection>,
    reader: BoxedReader,
    framing: FramingBuffer,
    read_buffer_size: usize,
    read_timeout: Option<Duration>,
    registry: Arc<ConnectionRegistry>,
    handler: Arc<dyn ChannelEventHandler>,
}

impl ReceivePump {
    pub(crate) fn new(
        channel: Arc<str>,
        connection: Arc<Connection>,
        reader: BoxedReader,
        framing: FramingBuffer,
        read_buffer_size: usize,
        read_timeout: Option<Duration>,
        registry: Arc<ConnectionRegistry>,
        handler: Arc<dyn ChannelEventHandler>,
    ) -> Self {
        Self {
            channel,
            connection,
            reader,
            framing,
            read_buffer_size,
            read_timeout,
            registry,
            handler,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<CloseReason> {
        tokio::spawn(self.run())
    }

    pub(crate) async fn run(mut self) -> CloseReason {
        let reason = self.read_until_closed().await;
        let removed = self.registry.remove_connection(&self.connection);
        self.connection.request_close(reason);
        self.connection.mark_closed();

        let peer = self.connection.peer();
        tracing::debug!(
            channel = %self.channel,
            peer = %peer,
            connection_id = %self.connection.id(),
            role = %self.connection.role(),
            reason = ?reason,
            removed,
            "connection closed"
        );
        self.handler
            .on_connection_closed(peer, self.connection.id(), reason);
        reason
    }

    async fn read_until_closed(&mut self) -> CloseReason {
        loop {
            let target = self.framing.read_target(self.read_buffer_size);
            let read = tokio::select! {
                biased;
                _ = self.connection.shutdown_requested() => {
                    return self
                        .connection
                        .close_reason()
                        .unwrap_or(CloseReason::LocalShutdown);
                }
                read = run_with_deadline(error::READ, self.read_timeout, self.reader.read_buf(target)) => read,
            };

            match read {
                Ok(0) => return CloseReason::PeerClosed,
                Ok(_) => {
                    self.connection.touch();
                    match self.framing.drain_messages() {
                        Ok(messages) => {
                            let peer = self.connection.peer();
                            for message in messages {
                                self.handler.on_message(&self.channel, peer, message);
                            }
                        }
                        Err(framing) => {
                            let error = SipsError::from(framing);
                            tracing::warn!(
                                channel = %self.channel,
                                peer = %self.connection.peer(),
                                code = error.code(),
                                error = %error,
                                "dropping connection after framing violation"
                            );
                            return CloseReason::FramingViolation;
                        }
                    }
                }
                // 对端未发送 close_notify 就关闭了 TCP，仍按对端关闭处理。
                Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
                    return CloseReason::PeerClosed;
                }
                Err(error) => {
                    tracing::debug!(
                        channel = %self.channel,
                        peer = %self.connection.peer(),
                        code = error::READ.code,
                        timed_out = error.kind() == io::ErrorKind::TimedOut,
                        error = %error,
                        "read failed"
                    );
                    return CloseReason::ReadFailed;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Duration};

    use bytes::Bytes;
    use tokio::{
        io::{AsyncWriteExt, DuplexStream},
        sync::mpsc::UnboundedReceiver,
    };

    use super::*;
    use crate::{
        connection::{ConnectionRole, Handshake},
        events::{ChannelEvent, ChannelEvents},
        framing::SipStreamFramer,
    };

    const OPTIONS_40: &[u8] = b"OPTIONS sip:carl@example.com SIP/2.0\r\n\r\n";

    struct Harness {
        remote: DuplexStream,
        connection: Arc<Connection>,
        registry: Arc<ConnectionRegistry>,
        events: UnboundedReceiver<ChannelEvent>,
        pump: JoinHandle<CloseReason>,
    }

    fn peer() -> SocketAddr {
        "198.51.100.20:40123".parse().expect("addr")
    }

    fn harness(max_message_size: usize) -> Harness {
        harness_with(ConnectionRole::Accepted, None, max_message_size)
    }

    fn harness_with(
        role: ConnectionRole,
        read_timeout: Option<Duration>,
        max_message_size: usize,
    ) -> Harness {
        let (local, remote) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(local);
        let connection = Handshake::begin(peer(), role).establish(Box::new(writer), None, None);
        let registry = Arc::new(ConnectionRegistry::new());
        registry.insert(Arc::clone(&connection));
        let (handler, events) = ChannelEvents::channel();

        let pump = ReceivePump::new(
            Arc::from("edge"),
            Arc::clone(&connection),
            Box::new(reader),
            FramingBuffer::new(Box::new(SipStreamFramer::new(max_message_size))),
            16,
            read_timeout,
            Arc::clone(&registry),
            Arc::new(handler),
        )
        .spawn();

        Harness {
            remote,
            connection,
            registry,
            events,
            pump,
        }
    }

    async fn next_event(events: &mut UnboundedReceiver<ChannelEvent>) -> ChannelEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event within deadline")
            .expect("event stream open")
    }

    #[tokio::test]
    async fn single_read_delivers_one_message_with_peer_address() {
        assert_eq!(OPTIONS_40.len(), 40);
        let mut h = harness(1024);
        h.remote.write_all(OPTIONS_40).await.expect("write");

        assert_eq!(
            next_event(&mut h.events).await,
            ChannelEvent::MessageReceived {
                channel: Arc::from("edge"),
                peer: peer(),
                message: Bytes::from_static(OPTIONS_40),
            }
        );
    }

    #[tokio::test]
    async fn partial_reads_are_reassembled_in_order() {
        let mut h = harness(1024);
        let second = b"BYE sip:carl@example.com SIP/2.0\r\nContent-Length: 2\r\n\r\nok";
        let mut stream = OPTIONS_40.to_vec();
        stream.extend_from_slice(second);

        for chunk in stream.chunks(7) {
            h.remote.write_all(chunk).await.expect("write");
            tokio::task::yield_now().await;
        }

        for expected in [OPTIONS_40, &second[..]] {
            match next_event(&mut h.events).await {
                ChannelEvent::MessageReceived { message, .. } => assert_eq!(&message[..], expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn peer_eof_removes_entry_and_reports_once() {
        let mut h = harness(1024);
        drop(h.remote);

        assert_eq!(
            next_event(&mut h.events).await,
            ChannelEvent::ConnectionClosed {
                peer: peer(),
                connection_id: h.connection.id(),
                reason: CloseReason::PeerClosed,
            }
        );
        assert_eq!(h.pump.await.expect("join"), CloseReason::PeerClosed);
        assert!(h.registry.is_empty());
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn oversized_message_is_a_framing_violation() {
        let mut h = harness(24);
        h.remote
            .write_all(b"REGISTER sip:registrar.example.com SIP/2.0\r\n")
            .await
            .expect("write");

        assert_eq!(
            next_event(&mut h.events).await,
            ChannelEvent::ConnectionClosed {
                peer: peer(),
                connection_id: h.connection.id(),
                reason: CloseReason::FramingViolation,
            }
        );
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn local_close_request_stops_the_pump() {
        let mut h = harness(1024);
        h.connection.request_close(CloseReason::LocalShutdown);

        assert_eq!(h.pump.await.expect("join"), CloseReason::LocalShutdown);
        assert_eq!(
            next_event(&mut h.events).await,
            ChannelEvent::ConnectionClosed {
                peer: peer(),
                connection_id: h.connection.id(),
                reason: CloseReason::LocalShutdown,
            }
        );
        drop(h.remote);
    }

    #[tokio::test]
    async fn stale_pump_leaves_successor_registered() {
        let mut h = harness(1024);
        let successor = Handshake::begin(peer(), ConnectionRole::Initiated).establish(
            Box::new(tokio::io::sink()),
            None,
            None,
        );
        h.registry.insert(Arc::clone(&successor));
        drop(h.remote);

        match next_event(&mut h.events).await {
            ChannelEvent::ConnectionClosed { connection_id, .. } => {
                assert_eq!(connection_id, h.connection.id());
                assert_ne!(connection_id, successor.id());
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(
            h.registry.lookup(&peer()).map(|conn| conn.id()),
            Some(successor.id())
        );
    }

    #[tokio::test]
    async fn idle_accepted_connection_hits_read_deadline() {
        let mut h = harness_with(ConnectionRole::Accepted, Some(Duration::from_millis(50)), 1024);

        assert_eq!(
            next_event(&mut h.events).await,
            ChannelEvent::ConnectionClosed {
                peer: peer(),
                connection_id: h.connection.id(),
                reason: CloseReason::ReadFailed,
            }
        );
        assert!(h.registry.is_empty());
        drop(h.remote);
    }

    #[tokio::test]
    async fn idle_initiated_connection_without_deadline_stays_open() {
        let mut h = harness_with(ConnectionRole::Initiated, None, 1024);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.events.try_recv().is_err());
        assert_eq!(h.registry.len(), 1);
        assert!(!h.pump.is_finished());

        // 静默之后的消息照常送达。
        h.remote.write_all(OPTIONS_40).await.expect("write");
        assert!(matches!(
            next_event(&mut h.events).await,
            ChannelEvent::MessageReceived { .. }
        ));
    }
}
