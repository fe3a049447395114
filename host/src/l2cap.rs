//! L2CAP connection oriented channels.
//!
//! A [`L2capChannel`] is a handle to a credit based channel created through [`L2capChannel::create`]
//! or accepted from a peer through [`L2capChannel::accept`]. Data is segmented according to the
//! negotiated MPS when sending, and received SDUs are reassembled in packets taken from the host
//! packet pool.
use core::future::poll_fn;
use core::task::Poll;

use crate::acl::Fragments;
use crate::channel_manager::{ChannelIndices, ChannelInfo, ChannelManager, DynamicChannelManager, TxParams};
use crate::codec::FixedSize;
use crate::connection::Connection;
use crate::cursor::WriteCursor;
use crate::host::L2capHost;
use crate::packet_pool::{AllocId, Packet, SharedPacket};
use crate::pdu::Pdu;
use crate::transport::Transport;
use crate::types::l2cap::L2capHeader;
use crate::{ChannelKind, ChannelState, Error, L2capHostError};

pub(crate) mod sar;

use sar::{segment_count, Segment, Segments};

/// When credits are given back to the peer for received data.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditFlowPolicy {
    /// Grant credits once this many PDUs have been consumed.
    Every(u16),
    /// Grant the consumed credits once the peer holds fewer than this many.
    MinThreshold(u16),
}

impl Default for CreditFlowPolicy {
    fn default() -> Self {
        Self::Every(1)
    }
}

/// How received data is handed to the application.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RxMode {
    /// Whole SDUs are reassembled before delivery. Credits are returned automatically.
    #[default]
    Sdu,
    /// Every PDU is delivered as it arrives. The application returns credits with
    /// [`L2capChannel::give_credits`].
    Segmented,
}

/// Local parameters of a channel. Unset values are derived from the packet pool size.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Default)]
pub struct L2capChannelConfig {
    pub mtu: Option<u16>,
    pub mps: Option<u16>,
    /// Credits wanted for the peer, by default enough for one SDU of the MTU.
    ///
    /// The peer never holds more credits than there are packets reserved for the channel and
    /// room in its receive queue. What can not be granted on connection is granted later.
    pub initial_credits: Option<u16>,
    pub flow_policy: CreditFlowPolicy,
    pub mode: RxMode,
}

/// Provides the bytes of an SDU while it is segmented.
///
/// The sender asks for the data of every PDU right before it is transmitted, so a large SDU can be
/// produced piece by piece without holding all of it in one buffer.
pub trait SduSource {
    /// Total length of the SDU.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill `buf` with the SDU bytes starting at `offset`.
    fn fill(&mut self, offset: usize, buf: &mut [u8]);
}

impl SduSource for &[u8] {
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    fn fill(&mut self, offset: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self[offset..offset + buf.len()]);
    }
}

/// Handle to a connection oriented channel.
///
/// The channel stays open while a handle exists. Dropping the last handle closes it.
pub struct L2capChannel<'d> {
    index: usize,
    manager: &'d dyn DynamicChannelManager,
}

impl Clone for L2capChannel<'_> {
    fn clone(&self) -> Self {
        self.manager.inc_ref(self.index);
        L2capChannel::new(self.index, self.manager)
    }
}

impl Drop for L2capChannel<'_> {
    fn drop(&mut self) {
        self.manager.dec_ref(self.index);
    }
}

// Abandons a connection request if the creating future is dropped.
struct CreateGuard<'a, 'd> {
    channels: &'a ChannelManager<'d>,
    indices: &'a [usize],
}

impl Drop for CreateGuard<'_, '_> {
    fn drop(&mut self) {
        self.channels.abandon(self.indices);
    }
}

// Gives up transmit ownership of a channel.
struct TxGuard<'a, 'd> {
    channels: &'a ChannelManager<'d>,
    index: usize,
}

impl Drop for TxGuard<'_, '_> {
    fn drop(&mut self) {
        self.channels.release_tx(self.index);
    }
}

// Closes the channel if an SDU was left half sent.
struct SendGuard<'a, 'd> {
    channels: &'a ChannelManager<'d>,
    index: usize,
    armed: bool,
}

impl Drop for SendGuard<'_, '_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("[l2cap][idx = {}] SDU partially sent, closing channel", self.index);
            self.channels.request_disconnect(self.index);
        }
    }
}

struct ReconfigGuard<'a, 'd> {
    channels: &'a ChannelManager<'d>,
    index: usize,
}

impl Drop for ReconfigGuard<'_, '_> {
    fn drop(&mut self) {
        self.channels.cancel_reconfigure(self.index);
    }
}

// Writes one PDU of the SDU into `packet`, returning the encoded frame.
fn encode_pdu<'p, S: SduSource + ?Sized>(
    packet: &'p mut Packet,
    tx: &TxParams,
    source: &mut S,
    segment: Segment,
) -> Result<&'p mut [u8], Error> {
    let mut w = WriteCursor::new(packet.as_mut());
    w.write(L2capHeader {
        length: segment.pdu_len() as u16,
        channel: tx.peer_cid,
    })?;
    if segment.first {
        w.append(&(source.len() as u16).to_le_bytes())?;
    }
    if w.available() < segment.len {
        return Err(Error::InsufficientSpace);
    }
    source.fill(segment.offset, &mut w.write_buf()[..segment.len]);
    w.commit(segment.len)?;
    Ok(w.finish())
}

impl<'d> L2capChannel<'d> {
    pub(crate) fn new(index: usize, manager: &'d dyn DynamicChannelManager) -> Self {
        Self { index, manager }
    }

    fn info(&self) -> ChannelInfo {
        self.manager.info(self.index)
    }

    async fn open<T: Transport>(
        host: &L2capHost<'_, T>,
        connection: &Connection<'_>,
        psm: u16,
        config: &L2capChannelConfig,
        kind: ChannelKind,
        count: usize,
    ) -> Result<ChannelIndices, Error> {
        let handle = connection
            .handle()
            .filter(|_| connection.is_connected())
            .ok_or(Error::NotConnected)?;
        let channels = &host.channels;
        let indices = poll_fn(|cx| channels.poll_create(handle, psm, config, kind, count, cx)).await?;
        let guard = CreateGuard {
            channels,
            indices: &indices,
        };
        poll_fn(|cx| channels.poll_created(&indices, cx)).await?;
        core::mem::forget(guard);
        Ok(indices)
    }

    /// Create a LE credit based channel on a link and wait for the peer to accept it.
    pub async fn create<T: Transport>(
        host: &'d L2capHost<'_, T>,
        connection: &Connection<'_>,
        psm: u16,
        config: &L2capChannelConfig,
    ) -> Result<Self, L2capHostError<T::Error>> {
        let indices = Self::open(host, connection, psm, config, ChannelKind::Le, 1).await?;
        Ok(Self::new(indices[0], &host.channels))
    }

    /// Create `N` enhanced credit based channels with a single request.
    ///
    /// Either all channels are connected, or none is.
    pub async fn create_multi<T: Transport, const N: usize>(
        host: &'d L2capHost<'_, T>,
        connection: &Connection<'_>,
        psm: u16,
        config: &L2capChannelConfig,
    ) -> Result<[Self; N], L2capHostError<T::Error>> {
        let indices = Self::open(host, connection, psm, config, ChannelKind::Enhanced, N).await?;
        Ok(core::array::from_fn(|i| Self::new(indices[i], &host.channels)))
    }

    async fn answer<T: Transport>(
        host: &L2capHost<'_, T>,
        connection: &Connection<'_>,
        psms: &[u16],
        config: &L2capChannelConfig,
        count: usize,
    ) -> Result<ChannelIndices, Error> {
        let handle = connection
            .handle()
            .filter(|_| connection.is_connected())
            .ok_or(Error::NotConnected)?;
        let channels = &host.channels;
        poll_fn(|cx| channels.poll_accept(handle, psms, config, count, cx)).await
    }

    /// Wait for the peer to request a single channel on one of `psms` and accept it.
    ///
    /// An empty list accepts any PSM.
    pub async fn accept<T: Transport>(
        host: &'d L2capHost<'_, T>,
        connection: &Connection<'_>,
        psms: &[u16],
        config: &L2capChannelConfig,
    ) -> Result<Self, L2capHostError<T::Error>> {
        let indices = Self::answer(host, connection, psms, config, 1).await?;
        Ok(Self::new(indices[0], &host.channels))
    }

    /// Wait for an enhanced credit based request of exactly `N` channels and accept all of them.
    pub async fn accept_multi<T: Transport, const N: usize>(
        host: &'d L2capHost<'_, T>,
        connection: &Connection<'_>,
        psms: &[u16],
        config: &L2capChannelConfig,
    ) -> Result<[Self; N], L2capHostError<T::Error>> {
        let indices = Self::answer(host, connection, psms, config, N).await?;
        Ok(core::array::from_fn(|i| Self::new(indices[i], &host.channels)))
    }

    /// Send an SDU, waiting for credits and controller buffers as needed.
    ///
    /// Completes once every PDU of the SDU was handed to the transport.
    pub async fn send<T: Transport>(
        &mut self,
        host: &L2capHost<'_, T>,
        buf: &[u8],
    ) -> Result<(), L2capHostError<T::Error>> {
        let mut source = buf;
        self.send_with(host, &mut source).await
    }

    /// Send an SDU produced by `source` one PDU at a time.
    pub async fn send_with<T: Transport, S: SduSource + ?Sized>(
        &mut self,
        host: &L2capHost<'_, T>,
        source: &mut S,
    ) -> Result<(), L2capHostError<T::Error>> {
        let channels = &host.channels;
        let index = self.index;
        let tx = poll_fn(|cx| channels.poll_acquire_tx(index, Some(cx))).await?;
        let _tx = TxGuard { channels, index };
        let len = source.len();
        if len > tx.mtu as usize {
            warn!("[l2cap][idx = {}] SDU of {} bytes exceeds peer MTU {}", index, len, tx.mtu);
            return Err(Error::InsufficientSpace.into());
        }

        let mut packet = poll_fn(|cx| host.pool.poll_alloc(AllocId::from_channel(index), cx)).await;
        let mut guard = SendGuard {
            channels,
            index,
            armed: false,
        };
        for segment in Segments::new(len, tx.mps) {
            let mut credit = poll_fn(|cx| channels.poll_request_to_send(index, 1, Some(cx))).await?;
            let pdu = encode_pdu(&mut packet, &tx, source, segment)?;
            let mut sender = host.acl(tx.conn).await?;
            let result = sender.send(pdu).await;
            guard.armed |= sender.sent() > 0;
            result?;
            credit.confirm(1);
        }
        guard.armed = false;
        Ok(())
    }

    /// Send an SDU only if credits, controller buffers and a packet are available right now.
    ///
    /// Fails with [`Error::Busy`] otherwise, in which case nothing was sent.
    pub fn try_send<T: Transport>(&mut self, host: &L2capHost<'_, T>, buf: &[u8]) -> Result<(), L2capHostError<T::Error>> {
        let channels = &host.channels;
        let index = self.index;
        let tx = match channels.poll_acquire_tx(index, None) {
            Poll::Ready(tx) => tx?,
            Poll::Pending => return Err(Error::Busy.into()),
        };
        let _tx = TxGuard { channels, index };
        if buf.len() > tx.mtu as usize {
            return Err(Error::InsufficientSpace.into());
        }

        let pdus = segment_count(buf.len(), tx.mps) as u16;
        let mut credits = match channels.poll_request_to_send(index, pdus, None) {
            Poll::Ready(credits) => credits?,
            Poll::Pending => return Err(Error::Busy.into()),
        };
        let mut packet = host.pool.alloc(AllocId::from_channel(index)).ok_or(Error::Busy)?;
        let acl_mtu = host.acl_mtu().ok_or(Error::Busy)?;
        let fragments: usize = Segments::new(buf.len(), tx.mps)
            .map(|s| Fragments::count(s.pdu_len() + L2capHeader::SIZE, acl_mtu))
            .sum();
        let mut sender = host.try_acl(tx.conn, fragments as u16)?;

        let mut source = buf;
        let mut guard = SendGuard {
            channels,
            index,
            armed: false,
        };
        for segment in Segments::new(buf.len(), tx.mps) {
            let pdu = encode_pdu(&mut packet, &tx, &mut source, segment)?;
            let result = sender.try_send(pdu);
            guard.armed = sender.sent() > 0;
            result?;
            credits.confirm(1);
        }
        guard.armed = false;
        Ok(())
    }

    /// Receive an SDU into `buf`, returning its length.
    ///
    /// If `buf` is too small the SDU is discarded and [`Error::InsufficientSpace`] returned.
    pub async fn receive<T: Transport>(
        &mut self,
        host: &L2capHost<'_, T>,
        buf: &mut [u8],
    ) -> Result<usize, L2capHostError<T::Error>> {
        let sdu = self.receive_sdu(host).await?;
        let data = sdu.as_ref();
        if data.len() > buf.len() {
            warn!(
                "[l2cap][idx = {}] discarding SDU of {} bytes, buffer holds {}",
                self.index,
                data.len(),
                buf.len()
            );
            return Err(Error::InsufficientSpace.into());
        }
        buf[..data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    /// Receive an SDU without copying it out of the packet it was reassembled in.
    ///
    /// Credits for the SDU go back to the peer when the returned value is dropped.
    pub async fn receive_sdu<T: Transport>(&mut self, host: &L2capHost<'_, T>) -> Result<Sdu<'d>, L2capHostError<T::Error>> {
        self.expect_mode(RxMode::Sdu)?;
        let index = self.index;
        let item = poll_fn(|cx| host.channels.poll_receive(index, cx)).await?;
        Ok(Sdu::new(item.pdu, item.pdus, index, self.manager))
    }

    /// Take an SDU that was already received, failing with [`Error::Busy`] if there is none.
    pub fn try_receive_sdu<T: Transport>(&mut self, host: &L2capHost<'_, T>) -> Result<Sdu<'d>, L2capHostError<T::Error>> {
        self.expect_mode(RxMode::Sdu)?;
        let item = host.channels.try_receive(self.index)?;
        Ok(Sdu::new(item.pdu, item.pdus, self.index, self.manager))
    }

    /// Receive the next piece of an SDU on a channel in segmented mode.
    pub async fn receive_segment<T: Transport>(
        &mut self,
        host: &L2capHost<'_, T>,
    ) -> Result<SduSegment, L2capHostError<T::Error>> {
        self.expect_mode(RxMode::Segmented)?;
        let index = self.index;
        let item = poll_fn(|cx| host.channels.poll_receive(index, cx)).await?;
        Ok(SduSegment {
            pdu: item.pdu,
            sdu_len: item.sdu_len,
            offset: item.offset,
        })
    }

    fn expect_mode(&self, mode: RxMode) -> Result<(), Error> {
        if self.info().mode == mode {
            Ok(())
        } else {
            Err(Error::InvalidState)
        }
    }

    /// Grant the peer `credits` more PDUs.
    ///
    /// The credits are sent as soon as packets can be reserved for them.
    pub fn give_credits<T: Transport>(&mut self, host: &L2capHost<'_, T>, credits: u16) -> Result<(), L2capHostError<T::Error>> {
        host.channels.give_credits(self.index, credits)?;
        Ok(())
    }

    /// Change the local MTU and MPS of an enhanced channel. The MTU can not shrink.
    pub async fn reconfigure<T: Transport>(
        &mut self,
        host: &L2capHost<'_, T>,
        mtu: u16,
        mps: u16,
    ) -> Result<(), L2capHostError<T::Error>> {
        let channels = &host.channels;
        let index = self.index;
        poll_fn(|cx| channels.poll_start_reconfigure(index, mtu, mps, cx)).await?;
        let _guard = ReconfigGuard { channels, index };
        poll_fn(|cx| channels.poll_reconfigured(index, cx)).await?;
        Ok(())
    }

    /// Close the channel and wait until it is closed. Closing a closed channel does nothing.
    pub async fn disconnect<T: Transport>(&mut self, host: &L2capHost<'_, T>) {
        let index = self.index;
        host.channels.request_disconnect(index);
        poll_fn(|cx| host.channels.poll_disconnected(index, cx)).await
    }

    pub fn state(&self) -> ChannelState {
        self.info().state
    }

    pub fn kind(&self) -> ChannelKind {
        self.info().kind
    }

    pub fn psm(&self) -> u16 {
        self.info().psm
    }

    pub fn local_cid(&self) -> u16 {
        self.info().local_cid
    }

    pub fn peer_cid(&self) -> u16 {
        self.info().peer_cid
    }

    /// Largest SDU this side accepts.
    pub fn mtu(&self) -> u16 {
        self.info().mtu
    }

    /// Largest PDU payload this side accepts.
    pub fn mps(&self) -> u16 {
        self.info().mps
    }

    pub fn peer_mtu(&self) -> u16 {
        self.info().peer_mtu
    }

    pub fn peer_mps(&self) -> u16 {
        self.info().peer_mps
    }

    /// PDUs we may still send.
    pub fn tx_credits(&self) -> u16 {
        self.info().tx_credits
    }

    /// PDUs the peer may still send.
    pub fn rx_credits(&self) -> u16 {
        self.info().rx_credits
    }
}

// Returns the credits of a received SDU when dropped.
struct CreditReturn<'d> {
    index: usize,
    pdus: u16,
    manager: &'d dyn DynamicChannelManager,
}

impl Drop for CreditReturn<'_> {
    fn drop(&mut self) {
        self.manager.consumed(self.index, self.pdus);
    }
}

/// A received SDU held in a pool packet.
pub struct Sdu<'d> {
    pdu: Pdu,
    _credits: CreditReturn<'d>,
}

impl<'d> Sdu<'d> {
    fn new(pdu: Pdu, pdus: u16, index: usize, manager: &'d dyn DynamicChannelManager) -> Self {
        Self {
            pdu,
            _credits: CreditReturn { index, pdus, manager },
        }
    }

    pub fn len(&self) -> usize {
        self.pdu.len
    }

    pub fn is_empty(&self) -> bool {
        self.pdu.len == 0
    }

    /// Keep the data around and return the credits now.
    pub fn into_shared(self) -> SharedSdu {
        let Sdu { pdu, _credits } = self;
        SharedSdu {
            packet: pdu.packet.into_shared(),
            start: pdu.start,
            len: pdu.len,
        }
    }
}

impl AsRef<[u8]> for Sdu<'_> {
    fn as_ref(&self) -> &[u8] {
        self.pdu.as_ref()
    }
}

impl AsMut<[u8]> for Sdu<'_> {
    fn as_mut(&mut self) -> &mut [u8] {
        self.pdu.as_mut()
    }
}

/// A received SDU that can be cloned cheaply. The packet stays allocated until the last clone is
/// dropped.
#[derive(Clone)]
pub struct SharedSdu {
    packet: SharedPacket,
    start: usize,
    len: usize,
}

impl AsRef<[u8]> for SharedSdu {
    fn as_ref(&self) -> &[u8] {
        &self.packet.as_ref()[self.start..self.start + self.len]
    }
}

/// Payload of one PDU received in segmented mode.
pub struct SduSegment {
    pdu: Pdu,
    sdu_len: u16,
    offset: u16,
}

impl SduSegment {
    /// Declared length of the SDU this segment belongs to.
    pub fn sdu_len(&self) -> u16 {
        self.sdu_len
    }

    /// Position of this segment within the SDU.
    pub fn offset(&self) -> u16 {
        self.offset
    }

    /// Whether this segment completes the SDU.
    pub fn is_last(&self) -> bool {
        self.offset as usize + self.pdu.len == self.sdu_len as usize
    }

    pub fn data(&self) -> &[u8] {
        self.pdu.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter;

    impl SduSource for Counter {
        fn len(&self) -> usize {
            50
        }

        fn fill(&mut self, offset: usize, buf: &mut [u8]) {
            for (i, b) in buf.iter_mut().enumerate() {
                *b = (offset + i) as u8;
            }
        }
    }

    #[test]
    fn slice_source() {
        let data = [1u8, 2, 3, 4, 5];
        let mut source = &data[..];
        assert_eq!(SduSource::len(&source), 5);
        let mut buf = [0u8; 2];
        source.fill(3, &mut buf);
        assert_eq!(buf, [4, 5]);
    }

    #[test]
    fn pull_source_is_asked_per_segment() {
        let mut source = Counter;
        let mut collected = [0u8; 50];
        for segment in Segments::new(source.len(), 23) {
            source.fill(segment.offset, &mut collected[segment.offset..segment.offset + segment.len]);
        }
        assert!(collected.iter().enumerate().all(|(i, b)| *b == i as u8));
    }
}
