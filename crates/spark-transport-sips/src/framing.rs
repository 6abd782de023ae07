//! 流式分帧：把 TLS 明文字节流切分为离散的 SIP 消息。
//!
//! ## 意图（Why）
//! - 面向连接的传输没有报文边界，接收泵每次读到的字节可能是半条、一条或多条消息；
//! - 分帧规则属于协议层协作者，因此以 [`MessageFramer`] trait 注入，通道只负责缓冲与调度。
//!
//! ## 契约（What）
//! - [`FramingBuffer`]：每个连接一份，持有有界接收缓冲并调用分帧钩子；
//! - [`SipStreamFramer`]：默认实现，遵循 RFC 3261 §18.3，头部以 `CRLFCRLF` 结束，
//!   消息体长度取 `Content-Length`（或紧凑形式 `l`），缺省视为 0；消息之间的 CRLF 保活包被丢弃；
//! - 单条消息（含未结束的头部）超过上限时返回 [`FramingError::MessageTooLarge`]，连接随后被断开。

use std::{fmt, sync::Arc};

use bytes::{Buf, Bytes, BytesMut};

use crate::error::FramingError;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// 分帧钩子：从缓冲头部提取下一条完整消息。
///
/// 实现需要消费已返回消息对应的字节，未成帧的剩余字节保持原样；返回 `Ok(None)` 表示
/// 需要更多数据。实现可以在调用之间保存扫描进度，每个连接独占一个实例。
pub trait MessageFramer: Send {
    fn next_message(&mut self, buffer: &mut BytesMut) -> Result<Option<Bytes>, FramingError>;
}

/// 为每条新连接构造独立分帧器的工厂。
pub type FramerFactory = Arc<dyn Fn() -> Box<dyn MessageFramer> + Send + Sync>;

/// 返回以 [`SipStreamFramer`] 为实现的工厂。
pub fn sip_framer_factory(max_message_size: usize) -> FramerFactory {
    Arc::new(move || Box::new(SipStreamFramer::new(max_message_size)))
}

/// 单连接的有界接收缓冲。
pub struct FramingBuffer {
    buffer: BytesMut,
    framer: Box<dyn MessageFramer>,
}

impl FramingBuffer {
    pub fn new(framer: Box<dyn MessageFramer>) -> Self {
        Self {
            buffer: BytesMut::new(),
            framer,
        }
    }

    /// 预留至少 `additional` 字节空间并返回可供 `read_buf` 写入的缓冲。
    pub fn read_target(&mut self, additional: usize) -> &mut BytesMut {
        self.buffer.reserve(additional);
        &mut self.buffer
    }

    /// 追加一段新到达的字节。
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// 取出当前缓冲中全部完整消息，按到达顺序排列。
    pub fn drain_messages(&mut self) -> Result<Vec<Bytes>, FramingError> {
        let mut messages = Vec::new();
        while let Some(message) = self.framer.next_message(&mut self.buffer)? {
            messages.push(message);
        }
        Ok(messages)
    }

    /// 尚未成帧的字节数。
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

impl fmt::Debug for FramingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramingBuffer")
            .field("pending", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

/// 基于 `Content-Length` 的 SIP 流式分帧器。
#[derive(Debug, Clone)]
pub struct SipStreamFramer {
    max_message_size: usize,
    /// 已确认不含头部终止符的前缀长度，避免对慢速对端重复扫描。
    scanned: usize,
    /// 已解析头部后得到的整条消息长度。
    pending_total: Option<usize>,
}

impl SipStreamFramer {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            scanned: 0,
            pending_total: None,
        }
    }

    fn skip_keepalive(&mut self, buffer: &mut BytesMut) {
        let leading = buffer
            .iter()
            .take_while(|byte| **byte == b'\r' || **byte == b'\n')
            .count();
        if leading > 0 {
            buffer.advance(leading);
            self.scanned = 0;
        }
    }

    fn locate_header_end(&mut self, buffer: &BytesMut) -> Option<usize> {
        // 回退三个字节，终止符可能跨越两次读取。
        let start = self.scanned.saturating_sub(HEADER_TERMINATOR.len() - 1);
        let found = buffer[start..]
            .windows(HEADER_TERMINATOR.len())
            .position(|window| window == HEADER_TERMINATOR)
            .map(|offset| start + offset);
        if found.is_none() {
            self.scanned = buffer.len();
        }
        found
    }

    fn too_large(&self) -> FramingError {
        FramingError::MessageTooLarge {
            limit: self.max_message_size,
        }
    }
}

impl MessageFramer for SipStreamFramer {
    fn next_message(&mut self, buffer: &mut BytesMut) -> Result<Option<Bytes>, FramingError> {
        let total = match self.pending_total {
            Some(total) => total,
            None => {
                self.skip_keepalive(buffer);
                if buffer.is_empty() {
                    return Ok(None);
                }
                let Some(header_len) = self.locate_header_end(buffer) else {
                    if buffer.len() > self.max_message_size {
                        return Err(self.too_large());
                    }
                    return Ok(None);
                };
                let body_len = content_length(&buffer[..header_len])?;
                let total = header_len
                    .checked_add(HEADER_TERMINATOR.len())
                    .and_then(|len| len.checked_add(body_len))
                    .ok_or_else(|| self.too_large())?;
                if total > self.max_message_size {
                    return Err(self.too_large());
                }
                self.pending_total = Some(total);
                total
            }
        };

        if buffer.len() < total {
            return Ok(None);
        }
        self.pending_total = None;
        self.scanned = 0;
        Ok(Some(buffer.split_to(total).freeze()))
    }
}

/// 在头部块中查找 `Content-Length`，缺省返回 0。
fn content_length(headers: &[u8]) -> Result<usize, FramingError> {
    for line in headers.split(|byte| *byte == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        // 折行续行以空白开头，不可能是 Content-Length 的起始行。
        if line.first().is_some_and(|byte| byte.is_ascii_whitespace()) {
            continue;
        }
        let Some(colon) = line.iter().position(|byte| *byte == b':') else {
            continue;
        };
        let name = line[..colon].trim_ascii();
        if name.eq_ignore_ascii_case(b"content-length") || name.eq_ignore_ascii_case(b"l") {
            let raw = line[colon + 1..].trim_ascii();
            return std::str::from_utf8(raw)
                .ok()
                .and_then(|value| value.parse::<usize>().ok())
                .ok_or_else(|| FramingError::InvalidContentLength {
                    value: String::from_utf8_lossy(raw).into_owned(),
                });
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const OPTIONS: &[u8] = b"OPTIONS sip:a SIP/2.0\r\nContent-Length: 0\r\n\r\n";
    const MESSAGE: &[u8] =
        b"MESSAGE sip:bob@example.com SIP/2.0\r\nVia: SIP/2.0/TLS a;branch=z9hG4bK1\r\nContent-Length: 5\r\n\r\nhello";

    fn buffer(limit: usize) -> FramingBuffer {
        FramingBuffer::new(Box::new(SipStreamFramer::new(limit)))
    }

    #[test]
    fn single_message_in_one_chunk() {
        let mut framing = buffer(1024);
        framing.extend(MESSAGE);
        let messages = framing.drain_messages().expect("frame");
        assert_eq!(messages, vec![Bytes::from_static(MESSAGE)]);
        assert_eq!(framing.pending(), 0);
    }

    #[test]
    fn body_spanning_several_reads_waits_for_completion() {
        let mut framing = buffer(1024);
        let (head, tail) = MESSAGE.split_at(MESSAGE.len() - 3);
        framing.extend(head);
        assert!(framing.drain_messages().expect("partial").is_empty());
        framing.extend(&tail[..1]);
        assert!(framing.drain_messages().expect("partial").is_empty());
        framing.extend(&tail[1..]);
        assert_eq!(
            framing.drain_messages().expect("complete"),
            vec![Bytes::from_static(MESSAGE)]
        );
    }

    #[test]
    fn header_terminator_split_across_reads() {
        let mut framing = buffer(1024);
        let split = OPTIONS.len() - 2;
        framing.extend(&OPTIONS[..split]);
        assert!(framing.drain_messages().expect("partial").is_empty());
        framing.extend(&OPTIONS[split..]);
        assert_eq!(framing.drain_messages().expect("complete").len(), 1);
    }

    #[test]
    fn back_to_back_messages_keep_order_and_skip_keepalives() {
        let mut framing = buffer(1024);
        let mut stream = Vec::new();
        stream.extend_from_slice(b"\r\n\r\n");
        stream.extend_from_slice(MESSAGE);
        stream.extend_from_slice(b"\r\n");
        stream.extend_from_slice(OPTIONS);
        framing.extend(&stream);

        let messages = framing.drain_messages().expect("frames");
        assert_eq!(
            messages,
            vec![Bytes::from_static(MESSAGE), Bytes::from_static(OPTIONS)]
        );
    }

    #[test]
    fn compact_and_missing_content_length() {
        let compact = b"INFO sip:a SIP/2.0\r\nl: 2\r\n\r\nokINFO sip:b SIP/2.0\r\n\r\n";
        let mut framing = buffer(1024);
        framing.extend(compact);
        let messages = framing.drain_messages().expect("frames");
        assert_eq!(messages.len(), 2);
        assert_eq!(&messages[0][..], b"INFO sip:a SIP/2.0\r\nl: 2\r\n\r\nok");
        assert_eq!(&messages[1][..], b"INFO sip:b SIP/2.0\r\n\r\n");
    }

    #[test]
    fn oversized_input_is_rejected() {
        let mut unterminated = buffer(16);
        unterminated.extend(b"REGISTER sip:registrar SIP/2.0\r\n");
        assert_eq!(
            unterminated.drain_messages(),
            Err(FramingError::MessageTooLarge { limit: 16 })
        );

        let mut declared = buffer(64);
        declared.extend(b"MESSAGE sip:a SIP/2.0\r\nContent-Length: 4096\r\n\r\n");
        assert_eq!(
            declared.drain_messages(),
            Err(FramingError::MessageTooLarge { limit: 64 })
        );
    }

    #[test]
    fn malformed_content_length_is_reported() {
        let mut framing = buffer(1024);
        framing.extend(b"BYE sip:a SIP/2.0\r\nContent-Length: ten\r\n\r\n");
        assert_eq!(
            framing.drain_messages(),
            Err(FramingError::InvalidContentLength {
                value: "ten".to_owned()
            })
        );
    }

    proptest! {
        /// 任意切分点下，逐段喂入得到的消息序列与整体喂入一致。
        #[test]
        fn arbitrary_read_boundaries_preserve_messages(
            cuts in proptest::collection::vec(0usize..(MESSAGE.len() + OPTIONS.len() * 2), 0..8)
        ) {
            let mut stream = Vec::new();
            stream.extend_from_slice(MESSAGE);
            stream.extend_from_slice(OPTIONS);
            stream.extend_from_slice(b"\r\n");
            stream.extend_from_slice(OPTIONS);

            let mut points: Vec<usize> = cuts.into_iter().filter(|cut| *cut < stream.len()).collect();
            points.push(stream.len());
            points.sort_unstable();
            points.dedup();

            let mut framing = buffer(1024);
            let mut delivered = Vec::new();
            let mut start = 0;
            for end in points {
                framing.extend(&stream[start..end]);
                delivered.extend(framing.drain_messages().expect("valid stream"));
                start = end;
            }

            prop_assert_eq!(
                delivered,
                vec![
                    Bytes::from_static(MESSAGE),
                    Bytes::from_static(OPTIONS),
                    Bytes::from_static(OPTIONS),
                ]
            );
            prop_assert_eq!(framing.pending(), 0);
        }
    }
}
