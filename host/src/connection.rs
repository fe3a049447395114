//! ACL link handle.
use bt_hci::param::ConnHandle;

use crate::connection_manager::DynamicConnectionManager;

/// A link accepted by the application.
///
/// The link stays up while a handle exists. Dropping the last handle asks the transport to
/// close it.
pub struct Connection<'d> {
    index: u8,
    manager: &'d dyn DynamicConnectionManager,
}

impl<'d> Clone for Connection<'d> {
    fn clone(&self) -> Self {
        self.manager.inc_ref(self.index);
        Connection::new(self.index, self.manager)
    }
}

impl<'d> Drop for Connection<'d> {
    fn drop(&mut self) {
        self.manager.dec_ref(self.index);
    }
}

impl<'d> Connection<'d> {
    pub(crate) fn new(index: u8, manager: &'d dyn DynamicConnectionManager) -> Self {
        Self { index, manager }
    }

    /// Check if still connected
    pub fn is_connected(&self) -> bool {
        self.manager.is_connected(self.index)
    }

    /// Connection handle of this link, if it was ever assigned one.
    pub fn handle(&self) -> Option<ConnHandle> {
        self.manager.handle(self.index)
    }

    /// Request the link to be closed.
    pub fn disconnect(&self) {
        self.manager.disconnect(self.index);
    }
}
