//! An async L2CAP connection oriented channel engine for BLE hosts.
//!
//! The host multiplexes LE credit based and enhanced credit based channels over ACL links
//! provided by a [`Transport`]. It segments and reassembles SDUs, enforces credit based flow
//! control in both directions and accounts for controller buffers shared by all links.
#![no_std]
#![allow(async_fn_in_trait)]

mod fmt;

mod channel_manager;
mod codec;
mod connection_manager;
mod cursor;
mod pdu;

pub mod acl;
pub mod config;
pub mod connection;
pub mod host;
pub mod l2cap;
pub mod packet_pool;
pub mod transport;
pub mod types;

pub use channel_manager::{ChannelKind, ChannelState};
pub use connection::Connection;
pub use host::{HostConfig, HostResources, L2capHost};
pub use l2cap::{CreditFlowPolicy, L2capChannel, L2capChannelConfig, RxMode, Sdu, SduSegment, SduSource, SharedSdu};
pub use packet_pool::{GlobalPacketPool, Packet, PacketPool, Qos, SharedPacket};
pub use transport::{ControllerBuffers, Transport, TransportEvent, TryError};
pub use types::l2cap::{LeCreditConnResultCode, ReconfigResult};

/// Ways the peer broke the L2CAP protocol. All of them are fatal for the channel involved.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// A new PDU started before the previous one on the link was complete.
    Truncated,
    /// A continuation fragment arrived with no PDU in progress.
    UnexpectedContinuation,
    /// More data arrived than the PDU or SDU header announced.
    Overrun,
    /// A PDU larger than the channel MPS.
    PduTooLarge,
    /// An SDU larger than the channel MTU.
    SduTooLarge,
    /// A PDU arrived while the peer had no credits left.
    NoCredits,
    /// A credit grant pushed the credit count past 65535.
    CreditOverflow,
    /// A frame too short to carry its headers.
    Malformed,
}

/// Errors returned by the host.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Error {
    Codec(codec::Error),
    InsufficientSpace,
    InvalidValue,
    InvalidState,
    NotFound,
    NotSupported,
    OutOfMemory,
    /// The operation would have to wait for resources.
    Busy,
    NotConnected,
    /// The channel or link was closed while the operation was pending.
    Disconnected,
    ConnectionRejected(LeCreditConnResultCode),
    CommandRejected(u16),
    ReconfigurationRejected(ReconfigResult),
    Protocol(ProtocolViolation),
}

impl From<codec::Error> for Error {
    fn from(error: codec::Error) -> Self {
        Error::Codec(error)
    }
}

impl From<ProtocolViolation> for Error {
    fn from(violation: ProtocolViolation) -> Self {
        Error::Protocol(violation)
    }
}

/// Errors of operations involving the transport.
#[derive(Debug)]
pub enum L2capHostError<E> {
    Transport(E),
    Host(Error),
}

impl<E> From<Error> for L2capHostError<E> {
    fn from(value: Error) -> Self {
        Self::Host(value)
    }
}

impl<E> From<codec::Error> for L2capHostError<E> {
    fn from(error: codec::Error) -> Self {
        Self::Host(error.into())
    }
}

#[cfg(feature = "defmt")]
impl<E> defmt::Format for L2capHostError<E>
where
    E: defmt::Format,
{
    fn format(&self, fmt: defmt::Formatter) {
        match self {
            L2capHostError::Transport(value) => {
                defmt::write!(fmt, "Transport({})", value)
            }
            L2capHostError::Host(value) => {
                defmt::write!(fmt, "Host({})", value)
            }
        }
    }
}
