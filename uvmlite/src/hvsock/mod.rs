//! Host-socket (HvSocket) channel between the host and a utility VM.
//!
//! An address is a VM runtime id plus a service id. Service ids for vsock
//! style ports are derived from a fixed base GUID with the port in the first
//! four bytes.

pub mod loopback;

use std::fmt;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use uuid::Uuid;
use uvmlite_shared::errors::UvmResult;

pub use loopback::LoopbackHvSocket;

// Trailing eight bytes of the base service GUID.
const SERVICE_ID_TAIL: [u8; 8] = [0xbd, 0x58, 0x64, 0x00, 0x6a, 0x79, 0x86, 0xd3];

/// A 128-bit host-socket service identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(Uuid);

impl ServiceId {
    /// Service id for a vsock port: the base GUID with `port` stored
    /// little-endian in bytes 0-3 of its Windows byte layout.
    pub const fn from_port(port: u32) -> Self {
        Self(Uuid::from_fields(port, 0xfacb, 0x11e6, &SERVICE_ID_TAIL))
    }

    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Bytes in Windows GUID order.
    pub fn to_bytes_le(&self) -> [u8; 16] {
        self.0.to_bytes_le()
    }

    /// The embedded port, if this id was derived from the base GUID.
    pub fn port(&self) -> Option<u32> {
        let (port, d2, d3, d4) = self.0.as_fields();
        (d2 == 0xfacb && d3 == 0x11e6 && *d4 == SERVICE_ID_TAIL).then_some(port)
    }

    /// The well-known base id, equivalent to port 0.
    pub fn template() -> Self {
        Self::from_port(0)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Address of a host-socket endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HvSocketAddr {
    pub vm_id: Uuid,
    pub service_id: ServiceId,
}

impl fmt::Display for HvSocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.vm_id, self.service_id)
    }
}

/// An accepted connection. Dropping it closes the connection.
pub type HvSocketStream = Box<dyn AsyncRead + Send + Unpin>;

/// Creates listeners on host-socket addresses.
#[async_trait]
pub trait HvSocketProvider: Send + Sync {
    async fn listen(&self, addr: HvSocketAddr) -> UvmResult<Box<dyn HvSocketListener>>;
}

/// A bound listener. Dropping it closes the listener.
#[async_trait]
pub trait HvSocketListener: Send + Sync {
    fn addr(&self) -> HvSocketAddr;

    async fn accept(&mut self) -> UvmResult<HvSocketStream>;
}

impl fmt::Debug for dyn HvSocketListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HvSocketListener")
            .field("addr", &self.addr())
            .finish()
    }
}
