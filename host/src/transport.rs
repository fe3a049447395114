//! The link layer seen from the host: an opaque carrier of ACL fragments.
use core::fmt::Debug;

use bt_hci::param::ConnHandle;

use crate::acl::AclFragment;

/// Controller ACL buffer configuration, read once at start up.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerBuffers {
    /// Largest ACL fragment payload the controller accepts.
    pub acl_mtu: u16,
    /// Number of ACL buffers in the controller, shared by all links.
    pub acl_packets: u16,
}

/// Something that happened on the transport.
#[derive(Debug)]
pub enum TransportEvent<'a> {
    /// A link was established.
    LinkUp(ConnHandle),
    /// A link was lost or closed.
    LinkDown(ConnHandle),
    /// An inbound ACL fragment.
    Acl(AclFragment<'a>),
    /// The controller freed `count` buffers previously used for a link.
    BuffersCompleted { handle: ConnHandle, count: u16 },
}

/// Error of a non-blocking transport operation.
#[derive(Debug)]
pub enum TryError<E> {
    /// The transport can not accept the fragment right now.
    Busy,
    Error(E),
}

/// A transport carrying ACL fragments between the host and a controller.
pub trait Transport {
    type Error: Debug;

    /// Read the controller buffer configuration.
    async fn buffers(&self) -> Result<ControllerBuffers, Self::Error>;

    /// Wait for the next event. Fragment data borrows from `buf`.
    async fn read<'a>(&self, buf: &'a mut [u8]) -> Result<TransportEvent<'a>, Self::Error>;

    /// Hand a fragment to the controller.
    async fn write(&self, fragment: &AclFragment<'_>) -> Result<(), Self::Error>;

    /// Hand a fragment to the controller without waiting.
    fn try_write(&self, fragment: &AclFragment<'_>) -> Result<(), TryError<Self::Error>>;

    /// Ask the controller to close a link.
    async fn disconnect(&self, handle: ConnHandle) -> Result<(), Self::Error>;
}
