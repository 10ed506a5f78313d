//! Host-socket provider backed by loopback TCP.
//!
//! Each listened address is bound to an ephemeral port on 127.0.0.1 and
//! recorded in a shared table, so [`LoopbackHvSocket::connect`] can play the
//! guest side.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use uvmlite_shared::errors::{UvmError, UvmResult};

use super::{HvSocketAddr, HvSocketListener, HvSocketProvider, HvSocketStream};

type Registry = Arc<Mutex<HashMap<HvSocketAddr, SocketAddr>>>;

#[derive(Debug, Clone, Default)]
pub struct LoopbackHvSocket {
    registry: Registry,
}

impl LoopbackHvSocket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to a listening address as the guest would.
    pub async fn connect(&self, addr: HvSocketAddr) -> UvmResult<TcpStream> {
        let target = self
            .registry
            .lock()
            .get(&addr)
            .copied()
            .ok_or_else(|| UvmError::HvSocket(format!("connection refused: {addr}")))?;

        TcpStream::connect(target)
            .await
            .map_err(|e| UvmError::HvSocket(format!("connect {addr}: {e}")))
    }

    pub fn is_listening(&self, addr: &HvSocketAddr) -> bool {
        self.registry.lock().contains_key(addr)
    }
}

#[async_trait]
impl HvSocketProvider for LoopbackHvSocket {
    async fn listen(&self, addr: HvSocketAddr) -> UvmResult<Box<dyn HvSocketListener>> {
        if self.is_listening(&addr) {
            return Err(UvmError::HvSocket(format!("address in use: {addr}")));
        }

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| UvmError::HvSocket(format!("listen {addr}: {e}")))?;
        let local = listener.local_addr()?;

        self.registry.lock().insert(addr, local);
        tracing::debug!(addr = %addr, local = %local, "Loopback hvsocket listening");

        Ok(Box::new(LoopbackListener {
            addr,
            listener,
            registry: Arc::clone(&self.registry),
        }))
    }
}

struct LoopbackListener {
    addr: HvSocketAddr,
    listener: TcpListener,
    registry: Registry,
}

#[async_trait]
impl HvSocketListener for LoopbackListener {
    fn addr(&self) -> HvSocketAddr {
        self.addr
    }

    async fn accept(&mut self) -> UvmResult<HvSocketStream> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| UvmError::HvSocket(format!("accept {}: {e}", self.addr)))?;
        tracing::trace!(addr = %self.addr, peer = %peer, "Accepted hvsocket connection");
        Ok(Box::new(stream))
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.addr);
    }
}
