use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use tracing::debug;

use crate::config::RpcConfig;
use crate::connection::Connection;
use crate::error::RpcError;

struct PoolInner {
    conf: RpcConfig,
    conns: ArrayQueue<Connection>,
}

/// Bounded pool of broker connections for client-side traffic. Cheap to
/// clone; clones share the pool. Checkout hands back a guard that returns
/// the connection on drop unless it was marked defunct.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(conf: RpcConfig) -> Self {
        let size = conf.pool_size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                conf,
                conns: ArrayQueue::new(size),
            }),
        }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.inner.conf
    }

    /// Check out a connection, opening a fresh one when the pool is empty.
    pub async fn get(&self) -> Result<PooledConnection, RpcError> {
        let conn = match self.inner.conns.pop() {
            Some(conn) => conn,
            None => Connection::open(self.inner.conf.clone()).await?,
        };
        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.clone(),
            defunct: false,
        })
    }

    /// Open a connection that bypasses the pool. Server consume loops hold
    /// their connection for their whole lifetime, so pooling them would
    /// only pin pool slots.
    pub async fn create_connection(&self) -> Result<Connection, RpcError> {
        Connection::open(self.inner.conf.clone()).await
    }

    /// Drop every idle connection.
    pub async fn close(&self) {
        while let Some(mut conn) = self.inner.conns.pop() {
            conn.close().await;
        }
    }

    fn checkin(&self, conn: Connection) {
        if self.inner.conns.push(conn).is_err() {
            debug!("pool full, dropping connection");
        }
    }
}

/// A checked-out connection. Derefs to [`Connection`]; goes back to the
/// pool when dropped.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Pool,
    defunct: bool,
}

impl PooledConnection {
    /// Keep this connection out of the pool when the guard drops.
    pub fn set_defunct(&mut self) {
        self.defunct = true;
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().unwrap()
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().unwrap()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !self.defunct {
                self.pool.checkin(conn);
            }
        }
    }
}
