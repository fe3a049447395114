use core::cell::RefCell;
use core::future::poll_fn;
use core::task::{Context, Poll};

use bt_hci::param::ConnHandle;
use embassy_sync::waitqueue::{MultiWakerRegistration, WakerRegistration};

use crate::connection::Connection;
use crate::Error;

// Tasks that can wait for the same link before all of them get woken.
const LINK_WAITERS: usize = 4;

struct State<'d> {
    connections: &'d mut [ConnectionStorage],
    accept_waker: WakerRegistration,
    disconnect_waker: WakerRegistration,
    // Controller ACL buffers not in use by any link.
    link_credits: u16,
    link_credit_waker: MultiWakerRegistration<LINK_WAITERS>,
}

impl<'d> State<'d> {
    fn print(&self) {
        for (idx, storage) in self.connections.iter().enumerate() {
            if storage.state != ConnectionState::Disconnected {
                debug!(
                    "[link][idx = {}] state = {:?}, conn = {:?}, in flight = {}",
                    idx, storage.state, storage.handle, storage.in_flight
                );
            }
        }
        debug!("[link] free controller buffers = {}", self.link_credits);
    }

    fn find(&mut self, handle: ConnHandle) -> Option<&mut ConnectionStorage> {
        self.connections
            .iter_mut()
            .find(|storage| storage.handle == Some(handle) && storage.state != ConnectionState::Disconnected)
    }
}

pub(crate) struct ConnectionManager<'d> {
    state: RefCell<State<'d>>,
}

impl<'d> ConnectionManager<'d> {
    pub(crate) fn new(connections: &'d mut [ConnectionStorage]) -> Self {
        Self {
            state: RefCell::new(State {
                connections,
                accept_waker: WakerRegistration::new(),
                disconnect_waker: WakerRegistration::new(),
                link_credits: 0,
                link_credit_waker: MultiWakerRegistration::new(),
            }),
        }
    }

    pub(crate) fn handle(&self, index: u8) -> Option<ConnHandle> {
        self.with_mut(|state| state.connections[index as usize].handle)
    }

    pub(crate) fn is_connected(&self, index: u8) -> bool {
        self.with_mut(|state| state.connections[index as usize].state == ConnectionState::Connected)
    }

    pub(crate) fn request_disconnect(&self, index: u8) {
        self.with_mut(|state| {
            let entry = &mut state.connections[index as usize];
            if entry.state == ConnectionState::Connected {
                entry.state = ConnectionState::DisconnectRequest;
                state.disconnect_waker.wake();
            }
        })
    }

    pub(crate) fn poll_disconnecting<'m>(&'m self, cx: Option<&mut Context<'_>>) -> Poll<DisconnectRequest<'m, 'd>> {
        let mut state = self.state.borrow_mut();
        if let Some(cx) = cx {
            state.disconnect_waker.register(cx.waker());
        }
        for (idx, storage) in state.connections.iter().enumerate() {
            if let (ConnectionState::DisconnectRequest, Some(handle)) = (storage.state, storage.handle) {
                return Poll::Ready(DisconnectRequest {
                    index: idx,
                    handle,
                    state: &self.state,
                });
            }
        }
        Poll::Pending
    }

    /// The link exists and may carry traffic, whether or not the application accepted it yet.
    pub(crate) fn is_handle_connected(&self, h: ConnHandle) -> bool {
        let state = self.state.borrow();
        state
            .connections
            .iter()
            .any(|storage| storage.handle == Some(h) && storage.state.is_active())
    }

    /// The link is gone. Buffers it held in the controller are free again.
    pub(crate) fn disconnected(&self, h: ConnHandle) -> Result<(), Error> {
        let mut state = self.state.borrow_mut();
        let Some(storage) = state.find(h) else {
            trace!("[link][disconnect] connection handle {:?} not found", h);
            return Err(Error::NotFound);
        };
        storage.state = ConnectionState::Disconnected;
        storage.tx_busy = false;
        storage.tx_waker.wake();
        let reclaimed = core::mem::take(&mut storage.in_flight);
        state.link_credits = state.link_credits.saturating_add(reclaimed);
        state.link_credit_waker.wake();
        Ok(())
    }

    pub(crate) fn connect(&self, handle: ConnHandle) -> Result<(), Error> {
        let mut state = self.state.borrow_mut();
        if state.find(handle).is_some() {
            warn!("[link][connect] connection handle {:?} already in use", handle);
            return Err(Error::InvalidState);
        }
        for storage in state.connections.iter_mut() {
            if ConnectionState::Disconnected == storage.state && storage.refcount == 0 {
                storage.state = ConnectionState::Connecting;
                storage.handle.replace(handle);
                storage.in_flight = 0;
                storage.tx_busy = false;
                state.accept_waker.wake();
                return Ok(());
            }
        }
        trace!("[link][connect] no available slot found for handle {:?}", handle);
        Err(Error::NotFound)
    }

    pub(crate) fn poll_accept(&self, cx: Option<&mut Context<'_>>) -> Poll<Connection<'_>> {
        let mut state = self.state.borrow_mut();
        if let Some(cx) = cx {
            state.accept_waker.register(cx.waker());
        }
        for (idx, storage) in state.connections.iter_mut().enumerate() {
            if let ConnectionState::Connecting = storage.state {
                storage.state = ConnectionState::Connected;
                storage.refcount = 1;
                trace!("[link][poll_accept] connection handle {:?} accepted", storage.handle);
                return Poll::Ready(Connection::new(idx as u8, self));
            }
        }
        Poll::Pending
    }

    fn with_mut<F: FnOnce(&mut State<'d>) -> R, R>(&self, f: F) -> R {
        let mut state = self.state.borrow_mut();
        f(&mut state)
    }

    pub(crate) fn log_status(&self) {
        let state = self.state.borrow();
        state.print();
    }

    pub(crate) fn inc_ref(&self, index: u8) {
        self.with_mut(|state| {
            let state = &mut state.connections[index as usize];
            state.refcount = unwrap!(
                state.refcount.checked_add(1),
                "Too many references to the same connection"
            );
        });
    }

    pub(crate) fn dec_ref(&self, index: u8) {
        self.with_mut(|state| {
            let entry = &mut state.connections[index as usize];
            entry.refcount = unwrap!(
                entry.refcount.checked_sub(1),
                "bug: dropping a connection with refcount 0"
            );
            if entry.refcount == 0 && entry.state == ConnectionState::Connected {
                entry.state = ConnectionState::DisconnectRequest;
                state.disconnect_waker.wake();
            }
        });
    }

    pub(crate) async fn accept(&self) -> Connection<'_> {
        poll_fn(move |cx| self.poll_accept(Some(cx))).await
    }

    /// Controller buffer count, read when the host starts.
    pub(crate) fn set_link_credits(&self, credits: u16) {
        let mut state = self.state.borrow_mut();
        state.link_credits = credits;
        state.link_credit_waker.wake();
    }

    /// The controller finished with `packets` fragments of a link.
    pub(crate) fn confirm_sent(&self, handle: ConnHandle, packets: u16) -> Result<(), Error> {
        let mut state = self.state.borrow_mut();
        let Some(storage) = state.find(handle) else {
            return Err(Error::NotFound);
        };
        let packets = if packets > storage.in_flight {
            warn!(
                "[link][conn = {:?}] controller completed {} packets, only {} in flight",
                handle, packets, storage.in_flight
            );
            storage.in_flight
        } else {
            packets
        };
        storage.in_flight -= packets;
        state.link_credits = state.link_credits.saturating_add(packets);
        state.link_credit_waker.wake();
        Ok(())
    }

    /// Take exclusive use of a link so the fragments of one PDU are not interleaved with others.
    pub(crate) fn poll_acquire_tx(&self, handle: ConnHandle, cx: Option<&mut Context<'_>>) -> Poll<Result<LinkTx<'_, 'd>, Error>> {
        let mut state = self.state.borrow_mut();
        let Some(storage) = state.find(handle) else {
            return Poll::Ready(Err(Error::Disconnected));
        };
        if !storage.state.is_active() {
            return Poll::Ready(Err(Error::Disconnected));
        }
        if storage.tx_busy {
            if let Some(cx) = cx {
                storage.tx_waker.register(cx.waker());
            }
            return Poll::Pending;
        }
        storage.tx_busy = true;
        Poll::Ready(Ok(LinkTx {
            state: &self.state,
            handle,
        }))
    }

    pub(crate) fn poll_request_to_send(
        &self,
        handle: ConnHandle,
        packets: u16,
        cx: Option<&mut Context<'_>>,
    ) -> Poll<Result<PacketGrant<'_, 'd>, Error>> {
        let mut state = self.state.borrow_mut();
        if !state.find(handle).is_some_and(|s| s.state.is_active()) {
            trace!("[link][poll_request_to_send] connection {:?} not found", handle);
            return Poll::Ready(Err(Error::Disconnected));
        }
        if packets <= state.link_credits {
            state.link_credits -= packets;
            return Poll::Ready(Ok(PacketGrant::new(&self.state, handle, packets)));
        }
        if let Some(cx) = cx {
            state.link_credit_waker.register(cx.waker());
        }
        trace!(
            "[link][poll_request_to_send][conn = {:?}] requested {} available {}",
            handle,
            packets,
            state.link_credits
        );
        Poll::Pending
    }
}

pub(crate) trait DynamicConnectionManager {
    fn is_connected(&self, index: u8) -> bool;
    fn handle(&self, index: u8) -> Option<ConnHandle>;
    fn inc_ref(&self, index: u8);
    fn dec_ref(&self, index: u8);
    fn disconnect(&self, index: u8);
}

impl<'d> DynamicConnectionManager for ConnectionManager<'d> {
    fn handle(&self, index: u8) -> Option<ConnHandle> {
        ConnectionManager::handle(self, index)
    }
    fn is_connected(&self, index: u8) -> bool {
        ConnectionManager::is_connected(self, index)
    }
    fn inc_ref(&self, index: u8) {
        ConnectionManager::inc_ref(self, index)
    }
    fn dec_ref(&self, index: u8) {
        ConnectionManager::dec_ref(self, index)
    }
    fn disconnect(&self, index: u8) {
        ConnectionManager::request_disconnect(self, index)
    }
}

pub struct DisconnectRequest<'a, 'd> {
    index: usize,
    handle: ConnHandle,
    state: &'a RefCell<State<'d>>,
}

impl<'a, 'd> DisconnectRequest<'a, 'd> {
    pub fn handle(&self) -> ConnHandle {
        self.handle
    }

    pub fn confirm(self) {
        let mut state = self.state.borrow_mut();
        let entry = &mut state.connections[self.index];
        if entry.state == ConnectionState::DisconnectRequest {
            entry.state = ConnectionState::Disconnecting;
        }
    }
}

pub struct ConnectionStorage {
    state: ConnectionState,
    handle: Option<ConnHandle>,
    // Fragments handed to the controller and not completed yet.
    in_flight: u16,
    tx_busy: bool,
    tx_waker: MultiWakerRegistration<LINK_WAITERS>,
    refcount: u8,
}

impl ConnectionStorage {
    #[allow(clippy::declare_interior_mutable_const)]
    pub(crate) const DISCONNECTED: ConnectionStorage = ConnectionStorage {
        state: ConnectionState::Disconnected,
        handle: None,
        in_flight: 0,
        tx_busy: false,
        tx_waker: MultiWakerRegistration::new(),
        refcount: 0,
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionState {
    DisconnectRequest,
    Disconnecting,
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::DisconnectRequest
        )
    }
}

/// Exclusive transmit access to a link, released on drop.
pub struct LinkTx<'a, 'd> {
    state: &'a RefCell<State<'d>>,
    handle: ConnHandle,
}

impl<'a, 'd> Drop for LinkTx<'a, 'd> {
    fn drop(&mut self) {
        let mut state = self.state.borrow_mut();
        if let Some(storage) = state.find(self.handle) {
            storage.tx_busy = false;
            storage.tx_waker.wake();
        }
    }
}

/// Controller buffers reserved for a link. Buffers not confirmed as sent are returned on drop.
pub struct PacketGrant<'a, 'd> {
    state: &'a RefCell<State<'d>>,
    handle: ConnHandle,
    packets: u16,
}

impl<'a, 'd> PacketGrant<'a, 'd> {
    fn new(state: &'a RefCell<State<'d>>, handle: ConnHandle, packets: u16) -> Self {
        Self { state, handle, packets }
    }

    /// `sent` fragments were handed to the controller and occupy its buffers until completed.
    pub(crate) fn confirm(&mut self, sent: u16) {
        let sent = sent.min(self.packets);
        self.packets -= sent;
        let mut state = self.state.borrow_mut();
        match state.find(self.handle) {
            Some(storage) => storage.in_flight += sent,
            // The link went away while sending, the controller dropped the fragments.
            None => state.link_credits = state.link_credits.saturating_add(sent),
        }
    }
}

impl<'a, 'd> Drop for PacketGrant<'a, 'd> {
    fn drop(&mut self) {
        if self.packets > 0 {
            let mut state = self.state.borrow_mut();
            state.link_credits = state.link_credits.saturating_add(self.packets);
            state.link_credit_waker.wake();
        }
    }
}
