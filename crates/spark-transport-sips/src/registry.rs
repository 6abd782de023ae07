//! # ConnectionRegistry：对端地址到活动连接的共享表
//!
//! ## 核心意图（Why）
//! - 接受路径、出站连接器、发送路径与每连接接收泵都会触碰同一张表，需要无全局锁的
//!   并发读写；
//! - 同一对端的重复流量复用单条连接，表的键即对端地址。
//!
//! ## 行为契约（What）
//! - `insert`：静默覆盖已有条目并返回被替换的连接，调用方负责记录日志；
//! - `remove`：按地址移除，幂等；
//! - `remove_connection`：按连接标识原子比较并移除，并发的读失败与写失败只有一方返回 `true`；
//! - 所有操作都是短临界区，持有分片锁期间不做任何 I/O。
//!
//! ## 风险提示（Trade-offs）
//! - 同一对端的两次并发出站建连都会插入，后到者覆盖先到者；被覆盖的连接仍在运行，
//!   直到其接收泵察觉断开。该竞态被接受，不做合并。

use std::{net::SocketAddr, sync::Arc};

use dashmap::DashMap;

use crate::connection::Connection;

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<SocketAddr, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册连接；若地址已有条目则覆盖并返回旧连接。
    pub fn insert(&self, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        self.connections.insert(connection.peer(), connection)
    }

    pub fn lookup(&self, peer: &SocketAddr) -> Option<Arc<Connection>> {
        self.connections
            .get(peer)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, peer: &SocketAddr) -> Option<Arc<Connection>> {
        self.connections.remove(peer).map(|(_, connection)| connection)
    }

    /// 仅当地址仍指向同一连接实例时移除。
    ///
    /// - **契约 (What)**：比较发生在分片写锁内，多个调用方竞争时恰有一个得到 `true`；
    /// - **后置条件**：接管同一地址的新连接不会被陈旧路径误删。
    pub fn remove_connection(&self, connection: &Connection) -> bool {
        let id = connection.id();
        self.connections
            .remove_if(&connection.peer(), |_, current| current.id() == id)
            .is_some()
    }

    /// 取出全部连接并清空表。
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let peers = self.peers();
        peers.iter().filter_map(|peer| self.remove(peer)).collect()
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
