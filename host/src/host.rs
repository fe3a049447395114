//! L2capHost
//!
//! The host owns the link, channel and reassembly state and moves data between the transport and
//! channel handles. [`L2capHost::run`] must be polled for anything to happen.
use core::future::poll_fn;
use core::task::Poll;

use bt_hci::param::ConnHandle;
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::once_lock::OnceLock;
use futures::pin_mut;

use crate::acl::{AclFragment, Fragments, ACL_HEADER_LEN};
use crate::channel_manager::{ChannelManager, ChannelStorage, RxChannel, RX_CHANNEL};
use crate::codec::{FixedSize, Type};
use crate::config::{L2CAP_SIGNAL_MTU, MAX_FRAGMENT_SIZE};
use crate::connection::Connection;
use crate::connection_manager::{ConnectionManager, ConnectionStorage, LinkTx, PacketGrant};
use crate::cursor::{ReadCursor, WriteCursor};
use crate::l2cap::sar::{PacketReassembly, Progress, SarType, SignalBuffer, Sink, Violation, EMPTY_SAR};
use crate::packet_pool::{GlobalPacketPool, PacketPool, Qos};
use crate::transport::{ControllerBuffers, Transport, TransportEvent, TryError};
use crate::types::l2cap::{
    is_dynamic, L2capHeader, L2capSignal, L2capSignalHeader, SignalCode, SignalData, L2CAP_CID_LE_U_SIGNAL,
};
use crate::{Error, L2capHostError, ProtocolViolation};

/// HostResources holds the resources used by the host.
///
/// The packet pool is used to reassemble incoming SDUs and to build outgoing PDUs. Every
/// channel slot is a separate client of the pool for the QoS policy.
pub struct HostResources<const CONNS: usize, const CHANNELS: usize, const PACKETS: usize, const L2CAP_MTU: usize> {
    pool: PacketPool<NoopRawMutex, L2CAP_MTU, PACKETS, CHANNELS>,
    connections: [ConnectionStorage; CONNS],
    channels: [ChannelStorage; CHANNELS],
    channels_rx: [RxChannel; CHANNELS],
    sar: [SarType; CONNS],
}

impl<const CONNS: usize, const CHANNELS: usize, const PACKETS: usize, const L2CAP_MTU: usize>
    HostResources<CONNS, CHANNELS, PACKETS, L2CAP_MTU>
{
    /// Create a new instance of host resources with the provided QoS requirements for packets.
    pub fn new(qos: Qos) -> Self {
        Self {
            pool: PacketPool::new(qos),
            connections: [ConnectionStorage::DISCONNECTED; CONNS],
            sar: [EMPTY_SAR; CONNS],
            channels: [ChannelStorage::DISCONNECTED; CHANNELS],
            channels_rx: [RX_CHANNEL; CHANNELS],
        }
    }
}

/// Runtime options of the host.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub struct HostConfig {
    /// Accept and create enhanced credit based channels.
    pub enhanced_credit: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self { enhanced_credit: true }
    }
}

/// An L2CAP host.
///
/// The host performs link management and channel management, and multiplexes data across
/// links and channels.
pub struct L2capHost<'d, T> {
    initialized: OnceLock<ControllerBuffers>,
    pub(crate) transport: T,
    pub(crate) connections: ConnectionManager<'d>,
    pub(crate) reassembly: PacketReassembly<'d>,
    pub(crate) channels: ChannelManager<'d>,
    pub(crate) pool: &'static dyn GlobalPacketPool,
}

impl<'d, T> L2capHost<'d, T>
where
    T: Transport,
{
    /// Create a new instance of the host.
    ///
    /// The resources are created outside the host, but the host is their only accessor.
    pub fn new<const CONNS: usize, const CHANNELS: usize, const PACKETS: usize, const L2CAP_MTU: usize>(
        transport: T,
        host_resources: &'static mut HostResources<CONNS, CHANNELS, PACKETS, L2CAP_MTU>,
        config: HostConfig,
    ) -> Self {
        Self {
            initialized: OnceLock::new(),
            transport,
            connections: ConnectionManager::new(&mut host_resources.connections[..]),
            reassembly: PacketReassembly::new(&mut host_resources.sar[..]),
            channels: ChannelManager::new(
                &host_resources.pool,
                &mut host_resources.channels[..],
                &host_resources.channels_rx[..],
                config.enhanced_credit,
            ),
            pool: &host_resources.pool,
        }
    }

    /// Wait for the next link brought up by the transport.
    pub async fn accept(&self) -> Connection<'_> {
        self.connections.accept().await
    }

    /// Log the state of links and channels.
    pub fn log_status(&self) {
        self.connections.log_status();
        self.channels.log_status();
    }

    pub(crate) fn acl_mtu(&self) -> Option<usize> {
        self.initialized.try_get().map(|buffers| buffers.acl_mtu as usize)
    }

    // Must not wait: every channel and the signalling of all links share the receive loop.
    fn handle_acl(&self, acl: AclFragment<'_>) -> Result<(), Error> {
        let handle = acl.handle();
        if !self.connections.is_handle_connected(handle) {
            warn!("[host] fragment for unknown link {:?}", handle);
            return Err(Error::NotConnected);
        }

        if !acl.is_start() {
            return match self.reassembly.update(handle, acl.data()) {
                Ok(Progress::Channel { channel, complete }) => {
                    self.channels.write_pdu(handle, channel, acl.data())?;
                    if complete {
                        self.channels.end_pdu(handle, channel)?;
                    }
                    Ok(())
                }
                Ok(Progress::Signal(signal)) => self.handle_signal(handle, &signal),
                Ok(Progress::Pending) => Ok(()),
                Err(Violation { channel, kind }) => {
                    warn!("[host] protocol violation on {:?}: {:?}", handle, kind);
                    if let Some(channel) = channel {
                        self.channels.protocol_violation(handle, channel, kind);
                    }
                    Err(Error::Protocol(kind))
                }
            };
        }

        if let Some(stale) = self.reassembly.take(handle) {
            warn!(
                "[host] PDU on {:?} started before the previous one completed ({}/{} bytes)",
                handle, stale.written, stale.length
            );
            if stale.is_channel() {
                self.channels
                    .protocol_violation(handle, stale.channel, ProtocolViolation::Truncated);
            }
        }

        let mut r = ReadCursor::new(acl.data());
        let header: L2capHeader = r.read().map_err(|_| Error::Protocol(ProtocolViolation::Malformed))?;
        let data = r.slice(r.available())?;
        let length = header.length as usize;
        let complete = data.len() == length;
        if data.len() > length {
            warn!("[host] fragment exceeds PDU length {} on cid {}", length, header.channel);
            self.channels
                .protocol_violation(handle, header.channel, ProtocolViolation::Overrun);
            return Err(Error::Protocol(ProtocolViolation::Overrun));
        }

        let sink = match header.channel {
            L2CAP_CID_LE_U_SIGNAL if complete => return self.handle_signal(handle, data),
            L2CAP_CID_LE_U_SIGNAL => {
                let mut buf = SignalBuffer::new();
                if length > L2CAP_SIGNAL_MTU || buf.extend_from_slice(data).is_err() {
                    warn!("[host] signalling PDU of {} bytes exceeds signalling MTU", length);
                    Sink::Discard
                } else {
                    Sink::Signal(buf)
                }
            }
            cid if is_dynamic(cid) => match self.channels.begin_pdu(handle, cid, header.length) {
                Ok(true) => match self.channels.write_pdu(handle, cid, data) {
                    Ok(()) => Sink::Channel,
                    Err(_) => Sink::Discard,
                },
                Ok(false) => Sink::Discard,
                Err(e) => {
                    warn!("[host] dropping PDU for cid {}: {:?}", cid, e);
                    Sink::Discard
                }
            },
            cid => {
                debug!("[host] discarding PDU for unsupported cid {}", cid);
                Sink::Discard
            }
        };

        if complete {
            if let Sink::Channel = sink {
                self.channels.end_pdu(handle, header.channel)?;
            }
            Ok(())
        } else {
            self.reassembly
                .init(handle, header.channel, header.length, data.len() as u16, sink)
        }
    }

    fn handle_signal(&self, handle: ConnHandle, data: &[u8]) -> Result<(), Error> {
        let mut r = ReadCursor::new(data);
        let header: L2capSignalHeader = match r.read() {
            Ok(header) => header,
            Err(_) => {
                warn!("[host] signalling packet too short on {:?}", handle);
                return Err(Error::Protocol(ProtocolViolation::Malformed));
            }
        };
        let decoded = r
            .slice(header.length as usize)
            .map_err(Error::from)
            .and_then(|payload| {
                let code = SignalCode::try_from(header.code)?;
                SignalData::decode_with(code, payload)
            });
        match decoded {
            Ok(signal) => self
                .channels
                .handle_signal(handle, L2capSignal::new(header.identifier, signal)),
            Err(e) => {
                warn!(
                    "[host] rejecting signal code {} (id = {}) on {:?}: {:?}",
                    header.code, header.identifier, handle, e
                );
                if header.code == SignalCode::CommandRejectRes as u8 {
                    return Err(e);
                }
                self.channels.reject(handle, header.identifier)
            }
        }
    }

    /// Run the host.
    ///
    /// Reads the controller buffer configuration, then processes transport events and sends
    /// queued signalling until an unrecoverable transport error occurs.
    pub async fn run(&self) -> Result<(), L2capHostError<T::Error>> {
        // Control future that initializes the host and sends signalling and link requests.
        let control_fut = async {
            let buffers = self.transport.buffers().await.map_err(L2capHostError::Transport)?;
            if buffers.acl_mtu == 0 || buffers.acl_packets == 0 {
                error!("[host] controller reports no ACL buffers: {:?}", buffers);
                return Err(Error::InvalidValue.into());
            }
            info!(
                "[host] controller buffers: {} x {} bytes",
                buffers.acl_packets, buffers.acl_mtu
            );
            self.connections.set_link_credits(buffers.acl_packets);
            let _ = self.initialized.init(buffers);

            loop {
                match select(
                    poll_fn(|cx| self.connections.poll_disconnecting(Some(cx))),
                    poll_fn(|cx| self.channels.poll_pending(cx)),
                )
                .await
                {
                    Either::First(request) => {
                        let handle = request.handle();
                        info!("[host] disconnecting link {:?}", handle);
                        self.transport
                            .disconnect(handle)
                            .await
                            .map_err(L2capHostError::Transport)?;
                        request.confirm();
                    }
                    Either::Second((handle, signal)) => {
                        let result = match self.acl(handle).await {
                            Ok(mut sender) => sender.signal(&signal).await,
                            Err(e) => Err(e),
                        };
                        match result {
                            Ok(()) => {}
                            Err(L2capHostError::Host(e)) => {
                                warn!("[host] dropping signal for {:?}: {:?}", handle, e);
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
            }
        };
        pin_mut!(control_fut);

        loop {
            // Task handling events from the transport.
            let rx_fut = async {
                let mut rx = [0u8; MAX_FRAGMENT_SIZE + ACL_HEADER_LEN];
                match self.transport.read(&mut rx).await {
                    Ok(TransportEvent::Acl(acl)) => {
                        if let Err(e) = self.handle_acl(acl) {
                            info!("[host] error processing ACL fragment: {:?}", e);
                        }
                    }
                    Ok(TransportEvent::LinkUp(handle)) => {
                        if let Err(e) = self.connections.connect(handle) {
                            warn!("[host] refusing link {:?}: {:?}", handle, e);
                            self.transport
                                .disconnect(handle)
                                .await
                                .map_err(L2capHostError::Transport)?;
                        }
                    }
                    Ok(TransportEvent::LinkDown(handle)) => {
                        info!("[host] link {:?} down", handle);
                        let _ = self.connections.disconnected(handle);
                        self.reassembly.disconnected(handle);
                        self.channels.disconnected(handle);
                    }
                    Ok(TransportEvent::BuffersCompleted { handle, count }) => {
                        if let Err(e) = self.connections.confirm_sent(handle, count) {
                            warn!("[host] {} completed buffers for {:?}: {:?}", count, handle, e);
                        }
                    }
                    Err(e) => return Err(L2capHostError::Transport(e)),
                }
                Ok(())
            };

            let result: Result<(), L2capHostError<T::Error>> = match select(&mut control_fut, rx_fut).await {
                Either::First(result) => result,
                Either::Second(result) => result,
            };
            result?;
        }
    }

    // Take the transmit side of a link, waiting for other PDUs on it to finish.
    pub(crate) async fn acl(&self, handle: ConnHandle) -> Result<AclSender<'_, 'd, T>, L2capHostError<T::Error>> {
        let buffers = self.initialized.get().await;
        let link = poll_fn(|cx| self.connections.poll_acquire_tx(handle, Some(cx))).await?;
        Ok(AclSender {
            transport: &self.transport,
            connections: &self.connections,
            handle,
            acl_mtu: buffers.acl_mtu as usize,
            grant: None,
            sent: 0,
            _link: link,
        })
    }

    // Take the transmit side of a link and reserve `n` controller buffers, without waiting.
    pub(crate) fn try_acl(&self, handle: ConnHandle, n: u16) -> Result<AclSender<'_, 'd, T>, L2capHostError<T::Error>> {
        let acl_mtu = self.acl_mtu().ok_or(Error::Busy)?;
        let link = match self.connections.poll_acquire_tx(handle, None) {
            Poll::Ready(link) => link?,
            Poll::Pending => return Err(Error::Busy.into()),
        };
        let grant = match self.connections.poll_request_to_send(handle, n, None) {
            Poll::Ready(grant) => grant?,
            Poll::Pending => return Err(Error::Busy.into()),
        };
        Ok(AclSender {
            transport: &self.transport,
            connections: &self.connections,
            handle,
            acl_mtu,
            grant: Some(grant),
            sent: 0,
            _link: link,
        })
    }
}

/// Exclusive sender of PDUs on one link.
pub(crate) struct AclSender<'a, 'd, T: Transport> {
    transport: &'a T,
    connections: &'a ConnectionManager<'d>,
    handle: ConnHandle,
    acl_mtu: usize,
    // Controller buffers reserved up front by `try_acl`.
    grant: Option<PacketGrant<'a, 'd>>,
    sent: usize,
    _link: LinkTx<'a, 'd>,
}

impl<'a, 'd, T: Transport> AclSender<'a, 'd, T> {
    /// Fragments handed to the transport so far.
    pub(crate) fn sent(&self) -> usize {
        self.sent
    }

    pub(crate) async fn send(&mut self, pdu: &[u8]) -> Result<(), L2capHostError<T::Error>> {
        let connections = self.connections;
        let handle = self.handle;
        for (boundary, data) in Fragments::new(pdu, self.acl_mtu) {
            let mut grant = poll_fn(|cx| connections.poll_request_to_send(handle, 1, Some(cx))).await?;
            self.transport
                .write(&AclFragment::new(handle, boundary, data))
                .await
                .map_err(L2capHostError::Transport)?;
            grant.confirm(1);
            self.sent += 1;
        }
        Ok(())
    }

    pub(crate) fn try_send(&mut self, pdu: &[u8]) -> Result<(), L2capHostError<T::Error>> {
        let Some(grant) = self.grant.as_mut() else {
            return Err(Error::InvalidState.into());
        };
        for (boundary, data) in Fragments::new(pdu, self.acl_mtu) {
            match self.transport.try_write(&AclFragment::new(self.handle, boundary, data)) {
                Ok(()) => {
                    grant.confirm(1);
                    self.sent += 1;
                }
                Err(TryError::Busy) => {
                    warn!("[host] transport busy sending to {:?}", self.handle);
                    return Err(Error::Busy.into());
                }
                Err(TryError::Error(e)) => return Err(L2capHostError::Transport(e)),
            }
        }
        Ok(())
    }

    pub(crate) async fn signal(&mut self, signal: &L2capSignal) -> Result<(), L2capHostError<T::Error>> {
        trace!("[l2cap] sending signal to {:?}: {:?}", self.handle, signal);
        let mut buf = [0u8; L2CAP_SIGNAL_MTU + L2capHeader::SIZE];
        let mut w = WriteCursor::new(&mut buf);
        w.write(L2capHeader {
            length: signal.size() as u16,
            channel: L2CAP_CID_LE_U_SIGNAL,
        })?;
        w.write_ref(signal)?;
        self.send(w.finish()).await
    }
}
