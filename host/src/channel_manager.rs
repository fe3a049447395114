//! Dynamic channel bookkeeping: connection signalling, credits and receive side reassembly.
use core::cell::RefCell;
use core::task::{Context, Poll};

use bt_hci::param::ConnHandle;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::waitqueue::{MultiWakerRegistration, WakerRegistration};
use heapless::{Deque, Vec};

use crate::codec::FixedSize;
use crate::config::{L2CAP_RX_QUEUE_SIZE, L2CAP_SIGNAL_QUEUE_SIZE};
use crate::l2cap::sar::segment_count;
use crate::l2cap::{CreditFlowPolicy, L2capChannelConfig, RxMode};
use crate::packet_pool::{AllocId, GlobalPacketPool, Packet};
use crate::pdu::Pdu;
use crate::types::l2cap::{
    is_dynamic, CommandRejectRes, CreditConnReconfigReq, CreditConnReconfigRes, CreditConnReq, CreditConnRes,
    DisconnectionReq, DisconnectionRes, L2capHeader, L2capSignal, LeCreditConnReq, LeCreditConnRes,
    LeCreditConnResultCode, LeCreditFlowInd, ReconfigResult, SignalData, ECRED_MAX_CHANNELS, ECRED_MIN_MTU,
    L2CAP_CID_DYN_END, L2CAP_CID_DYN_START, LE_MIN_MTU, MAX_MPS, SDU_HEADER_LEN,
};
use crate::{Error, ProtocolViolation};

// Tasks that can wait on the same channel before all of them get woken.
const CHANNEL_WAITERS: usize = 4;

pub(crate) type ChannelIndices = Vec<usize, ECRED_MAX_CHANNELS>;

/// Received data handed from the host to a channel handle.
pub(crate) struct RxItem {
    pub pdu: Pdu,
    /// Declared length of the SDU this data belongs to.
    pub sdu_len: u16,
    /// Offset of `pdu` within the SDU.
    pub offset: u16,
    /// PDUs, and therefore peer credits, this item accounts for.
    pub pdus: u16,
}

pub(crate) type RxChannel = Channel<NoopRawMutex, RxItem, L2CAP_RX_QUEUE_SIZE>;

#[allow(clippy::declare_interior_mutable_const)]
pub(crate) const RX_CHANNEL: RxChannel = Channel::new();

/// The signalling procedure that created a channel.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// LE credit based connection, one channel per request.
    Le,
    /// Enhanced credit based connection, up to five channels per request.
    Enhanced,
}

/// Lifecycle of a channel.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// We sent a connection request and wait for the response.
    ConnectRequested,
    /// The peer sent a connection request that was not accepted yet.
    PeerConnectRequested,
    Connected,
    /// The channel is closing and waits for the disconnection response.
    DisconnectRequested,
    Disconnected,
}

/// Credits granted to the peer for sending to us.
pub(crate) struct CreditFlowControl {
    policy: CreditFlowPolicy,
    // Credits the peer may still use.
    credits: u16,
    // PDUs consumed locally and not given back yet.
    consumed: u16,
}

impl CreditFlowControl {
    pub(crate) const fn new(policy: CreditFlowPolicy, initial: u16) -> Self {
        Self {
            policy,
            credits: initial,
            consumed: 0,
        }
    }

    pub(crate) fn available(&self) -> u16 {
        self.credits
    }

    /// The peer used one credit for a PDU.
    pub(crate) fn received(&mut self) -> Result<(), ProtocolViolation> {
        self.credits = self.credits.checked_sub(1).ok_or(ProtocolViolation::NoCredits)?;
        Ok(())
    }

    /// PDUs were processed locally, returns the credits due back to the peer now.
    pub(crate) fn process(&mut self, pdus: u16) -> Option<u16> {
        self.consumed = self.consumed.saturating_add(pdus);
        let due = match self.policy {
            CreditFlowPolicy::Every(n) => self.consumed >= n,
            CreditFlowPolicy::MinThreshold(n) => self.credits < n,
        };
        if !due || self.consumed == 0 {
            return None;
        }
        Some(core::mem::take(&mut self.consumed))
    }

    /// Grant credits explicitly, capped so the peer never holds more than 65535.
    pub(crate) fn grant(&mut self, credits: u16) -> u16 {
        let granted = credits.min(u16::MAX - self.credits);
        self.credits += granted;
        granted
    }
}

// Receive progress of a channel. In SDU mode one packet collects a whole SDU prefixed by its
// length. In segmented mode every PDU gets its own packet.
struct RxState {
    packet: Option<Packet>,
    // Bytes written to `packet`.
    written: usize,
    // `packet` starts with the SDU length header.
    header: bool,
    sdu_len: Option<u16>,
    // SDU bytes already handed out in segmented mode.
    delivered: u16,
    // PDUs in the SDU so far.
    pdus: u16,
    in_pdu: bool,
    pdu_start: usize,
    pdu_remaining: u16,
}

impl RxState {
    const IDLE: RxState = RxState {
        packet: None,
        written: 0,
        header: false,
        sdu_len: None,
        delivered: 0,
        pdus: 0,
        in_pdu: false,
        pdu_start: 0,
        pdu_remaining: 0,
    };

    fn expects_header(&self) -> bool {
        self.sdu_len.is_none()
    }

    // Between two PDUs of an unfinished SDU the next PDU continues the packet in hand.
    fn continues_sdu(&self, mode: RxMode) -> bool {
        mode == RxMode::Sdu && self.packet.is_some() && !self.in_pdu
    }

    fn begin(&mut self, len: u16, packet: Option<Packet>) {
        if let Some(packet) = packet {
            self.packet = Some(packet);
            self.written = 0;
            self.header = self.expects_header();
        }
        self.in_pdu = true;
        self.pdu_start = self.written;
        self.pdu_remaining = len;
        self.pdus += 1;
    }

    fn sdu_bytes(&self) -> usize {
        let start = if self.header { SDU_HEADER_LEN } else { 0 };
        self.delivered as usize + self.written.saturating_sub(start)
    }

    fn write(&mut self, data: &[u8], mtu: u16) -> Result<(), ProtocolViolation> {
        if data.len() > self.pdu_remaining as usize {
            return Err(ProtocolViolation::Overrun);
        }
        let Some(packet) = self.packet.as_mut() else {
            return Err(ProtocolViolation::Malformed);
        };
        let buf = packet.as_mut();
        let end = self.written + data.len();
        if end > buf.len() {
            return Err(ProtocolViolation::SduTooLarge);
        }
        buf[self.written..end].copy_from_slice(data);
        self.written = end;
        self.pdu_remaining -= data.len() as u16;

        if self.sdu_len.is_none() && self.written - self.pdu_start >= SDU_HEADER_LEN {
            let len = u16::from_le_bytes([buf[self.pdu_start], buf[self.pdu_start + 1]]);
            if len > mtu {
                return Err(ProtocolViolation::SduTooLarge);
            }
            self.sdu_len = Some(len);
        }
        match self.sdu_len {
            Some(len) if self.sdu_bytes() > len as usize => Err(ProtocolViolation::Overrun),
            _ => Ok(()),
        }
    }

    fn finish(&mut self, mode: RxMode) -> Option<RxItem> {
        self.in_pdu = false;
        let sdu_len = self.sdu_len?;
        match mode {
            RxMode::Sdu => {
                if self.sdu_bytes() != sdu_len as usize {
                    return None;
                }
                let packet = self.packet.take()?;
                let item = RxItem {
                    pdu: Pdu::new(packet, SDU_HEADER_LEN, sdu_len as usize),
                    sdu_len,
                    offset: 0,
                    pdus: self.pdus,
                };
                *self = RxState::IDLE;
                Some(item)
            }
            RxMode::Segmented => {
                let packet = self.packet.take()?;
                let start = if self.header { SDU_HEADER_LEN } else { 0 };
                let len = self.written - start;
                let item = RxItem {
                    pdu: Pdu::new(packet, start, len),
                    sdu_len,
                    offset: self.delivered,
                    pdus: 1,
                };
                self.delivered += len as u16;
                self.written = 0;
                self.header = false;
                if self.delivered == sdu_len {
                    *self = RxState::IDLE;
                }
                Some(item)
            }
        }
    }
}

struct Reconfig {
    ident: u8,
    mtu: u16,
    mps: u16,
    result: Option<Result<(), Error>>,
}

pub(crate) struct ChannelStorage {
    state: ChannelState,
    // Identifier of the signalling request in flight, 0 when none was sent.
    ident: u8,
    conn: Option<ConnHandle>,
    kind: ChannelKind,
    psm: u16,
    mode: RxMode,

    mtu: u16,
    mps: u16,
    flow: CreditFlowControl,
    // Credits owed to the peer, sent once packets back them.
    pending_credits: u16,
    rx: RxState,

    peer_cid: u16,
    peer_mtu: u16,
    peer_mps: u16,
    peer_credits: u16,
    tx_busy: bool,

    reconfig: Option<Reconfig>,
    reason: Option<Error>,
    abandoned: bool,
    refcount: u8,
    waker: MultiWakerRegistration<CHANNEL_WAITERS>,
}

impl ChannelStorage {
    #[allow(clippy::declare_interior_mutable_const)]
    pub(crate) const DISCONNECTED: ChannelStorage = ChannelStorage {
        state: ChannelState::Disconnected,
        ident: 0,
        conn: None,
        kind: ChannelKind::Le,
        psm: 0,
        mode: RxMode::Sdu,
        mtu: 0,
        mps: 0,
        flow: CreditFlowControl::new(CreditFlowPolicy::Every(1), 0),
        pending_credits: 0,
        rx: RxState::IDLE,
        peer_cid: 0,
        peer_mtu: 0,
        peer_mps: 0,
        peer_credits: 0,
        tx_busy: false,
        reconfig: None,
        reason: None,
        abandoned: false,
        refcount: 0,
        waker: MultiWakerRegistration::new(),
    };

    fn is_free(&self) -> bool {
        self.state == ChannelState::Disconnected && self.refcount == 0
    }

    fn connected(&mut self, peer_cid: u16, mtu: u16, mps: u16, credits: u16) {
        self.state = ChannelState::Connected;
        self.ident = 0;
        self.peer_cid = peer_cid;
        self.peer_mtu = mtu;
        self.peer_mps = mps;
        self.peer_credits = credits;
        self.waker.wake();
    }

    fn start_disconnect(&mut self, reason: Error) {
        self.state = ChannelState::DisconnectRequested;
        self.ident = 0;
        self.reason.get_or_insert(reason);
        self.rx = RxState::IDLE;
        self.pending_credits = 0;
        self.fail_reconfig();
        self.waker.wake();
    }

    fn close(&mut self, reason: Error) {
        self.state = ChannelState::Disconnected;
        self.ident = 0;
        self.reason.get_or_insert(reason);
        self.rx = RxState::IDLE;
        self.pending_credits = 0;
        self.fail_reconfig();
        self.waker.wake();
    }

    fn fail_reconfig(&mut self) {
        if let Some(reconfig) = self.reconfig.as_mut() {
            reconfig.result.get_or_insert(Err(Error::Disconnected));
        }
    }

    fn error(&self) -> Error {
        self.reason.unwrap_or(Error::Disconnected)
    }
}

/// Snapshot of a channel for handles.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChannelInfo {
    pub state: ChannelState,
    pub kind: ChannelKind,
    pub conn: Option<ConnHandle>,
    pub psm: u16,
    pub local_cid: u16,
    pub peer_cid: u16,
    pub mtu: u16,
    pub mps: u16,
    pub peer_mtu: u16,
    pub peer_mps: u16,
    pub tx_credits: u16,
    pub rx_credits: u16,
    pub mode: RxMode,
}

/// Parameters for transmitting one SDU, fixed for the duration of the send.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TxParams {
    pub conn: ConnHandle,
    pub peer_cid: u16,
    pub mtu: u16,
    pub mps: u16,
}

struct State<'d> {
    next_ident: u8,
    channels: &'d mut [ChannelStorage],
    pending: Deque<(ConnHandle, L2capSignal), L2CAP_SIGNAL_QUEUE_SIZE>,
    accept_waker: MultiWakerRegistration<CHANNEL_WAITERS>,
    space_waker: MultiWakerRegistration<CHANNEL_WAITERS>,
    signal_waker: WakerRegistration,
    enhanced_credit: bool,
}

impl<'d> State<'d> {
    fn print(&self) {
        for (idx, storage) in self.channels.iter().enumerate() {
            if storage.state != ChannelState::Disconnected {
                debug!(
                    "[l2cap][idx = {}] state = {:?}, peer cid = {}, credits = {}/{}",
                    idx,
                    storage.state,
                    storage.peer_cid,
                    storage.peer_credits,
                    storage.flow.available()
                );
            }
        }
    }

    fn next_ident(&mut self) -> u8 {
        self.next_ident = self.next_ident.wrapping_add(1);
        if self.next_ident == 0 {
            self.next_ident = 1;
        }
        self.next_ident
    }

    fn queue(&mut self, conn: ConnHandle, signal: L2capSignal) -> Result<(), Error> {
        self.pending.push_back((conn, signal)).map_err(|_| Error::Busy)?;
        self.signal_waker.wake();
        Ok(())
    }

    fn index_of(&self, cid: u16) -> Option<usize> {
        if !is_dynamic(cid) {
            return None;
        }
        let idx = (cid - L2CAP_CID_DYN_START) as usize;
        (idx < self.channels.len()).then_some(idx)
    }

    fn connected_index(&self, conn: ConnHandle, cid: u16) -> Option<usize> {
        self.index_of(cid).filter(|idx| {
            let storage = &self.channels[*idx];
            storage.conn == Some(conn) && storage.state == ChannelState::Connected
        })
    }

    fn peer_cid_in_use(&self, conn: ConnHandle, peer_cid: u16) -> bool {
        self.channels.iter().any(|storage| {
            storage.conn == Some(conn)
                && storage.peer_cid == peer_cid
                && matches!(
                    storage.state,
                    ChannelState::Connected | ChannelState::PeerConnectRequested | ChannelState::DisconnectRequested
                )
        })
    }

    fn free_slots(&self, count: usize) -> Option<ChannelIndices> {
        let mut slots = ChannelIndices::new();
        for (idx, storage) in self.channels.iter().enumerate() {
            if slots.len() == count {
                break;
            }
            if storage.is_free() {
                let _ = slots.push(idx);
            }
        }
        (slots.len() == count).then_some(slots)
    }
}

fn cid(index: usize) -> u16 {
    L2CAP_CID_DYN_START + index as u16
}

pub(crate) struct ChannelManager<'d> {
    pool: &'static dyn GlobalPacketPool,
    state: RefCell<State<'d>>,
    inbound: &'d [RxChannel],
}

impl<'d> ChannelManager<'d> {
    pub(crate) fn new(
        pool: &'static dyn GlobalPacketPool,
        channels: &'d mut [ChannelStorage],
        inbound: &'d [RxChannel],
        enhanced_credit: bool,
    ) -> Self {
        assert!(channels.len() <= (L2CAP_CID_DYN_END - L2CAP_CID_DYN_START + 1) as usize);
        assert!(inbound.len() == channels.len());
        Self {
            pool,
            state: RefCell::new(State {
                next_ident: 0,
                channels,
                pending: Deque::new(),
                accept_waker: MultiWakerRegistration::new(),
                space_waker: MultiWakerRegistration::new(),
                signal_waker: WakerRegistration::new(),
                enhanced_credit,
            }),
            inbound,
        }
    }

    // Drop everything received for a channel and give its reserved packets back.
    fn reset_rx(&self, index: usize) {
        while self.inbound[index].try_receive().is_ok() {}
        self.pool.unreserve(AllocId::from_channel(index), usize::MAX);
    }

    fn fail(&self, state: &mut State<'d>, index: usize, reason: Error) {
        warn!("[l2cap][cid = {}] closing channel: {:?}", cid(index), reason);
        state.channels[index].start_disconnect(reason);
        self.reset_rx(index);
        state.signal_waker.wake();
    }

    // Reserve the packets backing the initial credits of new channels. All channels of one
    // request start with the same credits, at most `wanted`.
    fn reserve_initial(&self, indices: &[usize], wanted: u16) -> u16 {
        let wanted = (wanted as usize).min(L2CAP_RX_QUEUE_SIZE);
        let mut credits = 0;
        while credits < wanted {
            for (n, idx) in indices.iter().enumerate() {
                if self.pool.reserve(AllocId::from_channel(*idx), 1) == 0 {
                    for idx in indices[..n].iter() {
                        self.pool.unreserve(AllocId::from_channel(*idx), 1);
                    }
                    return credits as u16;
                }
            }
            credits += 1;
        }
        credits as u16
    }

    // Credits that can be sent to the peer now. Every credit the peer holds has a free slot in
    // the receive queue and a reserved packet, except for one continuing an unfinished SDU.
    fn grantable(&self, index: usize, storage: &ChannelStorage) -> u16 {
        let credits = storage.flow.available() as usize;
        let room = L2CAP_RX_QUEUE_SIZE.saturating_sub(self.inbound[index].len() + credits);
        let wanted = (storage.pending_credits as usize).min(room);
        if wanted == 0 {
            return 0;
        }
        let id = AllocId::from_channel(index);
        let mut backed = self.pool.reserved(id) + usize::from(storage.rx.continues_sdu(storage.mode));
        if backed < credits + wanted {
            backed += self.pool.reserve(id, credits + wanted - backed);
        }
        backed.saturating_sub(credits).min(wanted) as u16
    }

    // Reservations beyond the credits the peer holds go back to the pool.
    fn trim_reservation(&self, index: usize, storage: &ChannelStorage) {
        let keep = match storage.state {
            ChannelState::ConnectRequested | ChannelState::Connected => storage.flow.available() as usize,
            _ => 0,
        };
        let id = AllocId::from_channel(index);
        let reserved = self.pool.reserved(id);
        if reserved > keep {
            self.pool.unreserve(id, reserved - keep);
        }
    }

    pub(crate) fn log_status(&self) {
        self.state.borrow().print();
    }

    // Local receive parameters: MTU, MPS and the credits wanted for the peer.
    fn local_params(&self, config: &L2capChannelConfig, kind: ChannelKind) -> Result<(u16, u16, u16), Error> {
        let pool = self.pool.mtu().min(u16::MAX as usize) as u16;
        let min = match kind {
            ChannelKind::Le => LE_MIN_MTU,
            ChannelKind::Enhanced => ECRED_MIN_MTU,
        };
        let mtu = config.mtu.unwrap_or(pool.saturating_sub(SDU_HEADER_LEN as u16));
        let mps = config.mps.unwrap_or(mtu.min(pool));
        if mtu < min || mps < min || mps > MAX_MPS || mps > mtu {
            return Err(Error::InvalidValue);
        }
        let fits = match config.mode {
            RxMode::Sdu => mtu as usize + SDU_HEADER_LEN <= pool as usize,
            RxMode::Segmented => mps <= pool,
        };
        if !fits {
            return Err(Error::InsufficientSpace);
        }
        let credits = match config.initial_credits {
            Some(credits) => credits,
            None => segment_count(mtu as usize, mps).min(u16::MAX as usize) as u16,
        };
        Ok((mtu, mps, credits))
    }

    /// Allocate `count` channels and queue the connection request for them.
    pub(crate) fn poll_create(
        &self,
        conn: ConnHandle,
        psm: u16,
        config: &L2capChannelConfig,
        kind: ChannelKind,
        count: usize,
        cx: &mut Context<'_>,
    ) -> Poll<Result<ChannelIndices, Error>> {
        let (mtu, mps, credits) = match self.local_params(config, kind) {
            Ok(params) => params,
            Err(e) => return Poll::Ready(Err(e)),
        };
        let mut state = self.state.borrow_mut();
        if kind == ChannelKind::Enhanced && !state.enhanced_credit {
            return Poll::Ready(Err(Error::NotSupported));
        }
        if count == 0 || count > ECRED_MAX_CHANNELS || (kind == ChannelKind::Le && count != 1) {
            return Poll::Ready(Err(Error::InvalidValue));
        }
        if state.pending.is_full() {
            state.space_waker.register(cx.waker());
            return Poll::Pending;
        }
        let Some(indices) = state.free_slots(count) else {
            warn!("[l2cap] no free channel for {} new channels", count);
            return Poll::Ready(Err(Error::OutOfMemory));
        };

        for idx in indices.iter().copied() {
            self.reset_rx(idx);
        }
        let wanted = credits;
        let credits = self.reserve_initial(&indices, wanted);
        let ident = state.next_ident();
        let mut scids = Vec::new();
        for idx in indices.iter().copied() {
            state.channels[idx] = ChannelStorage {
                state: ChannelState::ConnectRequested,
                ident,
                conn: Some(conn),
                kind,
                psm,
                mode: config.mode,
                mtu,
                mps,
                flow: CreditFlowControl::new(config.flow_policy, credits),
                pending_credits: wanted - credits,
                ..ChannelStorage::DISCONNECTED
            };
            let _ = scids.push(cid(idx));
        }
        let data = match kind {
            ChannelKind::Le => SignalData::LeCreditConnReq(LeCreditConnReq {
                psm,
                scid: scids[0],
                mtu,
                mps,
                credits,
            }),
            ChannelKind::Enhanced => SignalData::CreditConnReq(CreditConnReq {
                psm,
                mtu,
                mps,
                credits,
                scids,
            }),
        };
        debug!(
            "[l2cap][conn = {:?}] requesting {} channels on psm {} (mtu = {}, mps = {}, credits = {})",
            conn, count, psm, mtu, mps, credits
        );
        // Room was checked above.
        let _ = state.queue(conn, L2capSignal::new(ident, data));
        Poll::Ready(Ok(indices))
    }

    /// Completes when all channels of a request are connected, or when the request failed for
    /// all of them.
    pub(crate) fn poll_created(&self, indices: &[usize], cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        let mut state = self.state.borrow_mut();
        if indices
            .iter()
            .any(|idx| state.channels[*idx].state == ChannelState::ConnectRequested)
        {
            for idx in indices.iter() {
                state.channels[*idx].waker.register(cx.waker());
            }
            return Poll::Pending;
        }

        if indices
            .iter()
            .all(|idx| state.channels[*idx].state == ChannelState::Connected)
        {
            for idx in indices.iter() {
                state.channels[*idx].refcount = 1;
            }
            return Poll::Ready(Ok(()));
        }

        let reason = indices
            .iter()
            .find_map(|idx| state.channels[*idx].reason)
            .unwrap_or(Error::Disconnected);
        for idx in indices.iter().copied() {
            if state.channels[idx].state == ChannelState::Connected {
                self.fail(&mut state, idx, reason);
            }
        }
        Poll::Ready(Err(reason))
    }

    /// The creator went away before the request completed.
    pub(crate) fn abandon(&self, indices: &[usize]) {
        let mut state = self.state.borrow_mut();
        for idx in indices.iter().copied() {
            let storage = &mut state.channels[idx];
            match storage.state {
                ChannelState::ConnectRequested => storage.abandoned = true,
                ChannelState::Connected if storage.refcount == 0 => self.fail(&mut state, idx, Error::Disconnected),
                _ => {}
            }
        }
    }

    /// Accept a pending connection request of exactly `count` channels for one of `psms`.
    pub(crate) fn poll_accept(
        &self,
        conn: ConnHandle,
        psms: &[u16],
        config: &L2capChannelConfig,
        count: usize,
        cx: &mut Context<'_>,
    ) -> Poll<Result<ChannelIndices, Error>> {
        let mut state = self.state.borrow_mut();
        state.accept_waker.register(cx.waker());

        let requested = |storage: &ChannelStorage| {
            storage.state == ChannelState::PeerConnectRequested && storage.conn == Some(conn)
        };
        let mut found = None;
        for storage in state.channels.iter() {
            if requested(storage) && (psms.is_empty() || psms.contains(&storage.psm)) {
                let size = state
                    .channels
                    .iter()
                    .filter(|s| requested(s) && s.ident == storage.ident)
                    .count();
                if size == count {
                    found = Some((storage.ident, storage.kind));
                    break;
                }
            }
        }
        let Some((ident, kind)) = found else {
            return Poll::Pending;
        };
        if state.pending.is_full() {
            state.space_waker.register(cx.waker());
            return Poll::Pending;
        }
        let (mtu, mps, credits) = match self.local_params(config, kind) {
            Ok(params) => params,
            Err(e) => return Poll::Ready(Err(e)),
        };

        let mut indices = ChannelIndices::new();
        let mut dcids = Vec::new();
        for (idx, storage) in state.channels.iter().enumerate() {
            if requested(storage) && storage.ident == ident {
                let _ = indices.push(idx);
                let _ = dcids.push(cid(idx));
            }
        }
        let wanted = credits;
        let credits = self.reserve_initial(&indices, wanted);
        for idx in indices.iter().copied() {
            let storage = &mut state.channels[idx];
            storage.state = ChannelState::Connected;
            storage.ident = 0;
            storage.mtu = mtu;
            storage.mps = mps;
            storage.mode = config.mode;
            storage.flow = CreditFlowControl::new(config.flow_policy, credits);
            storage.pending_credits = wanted - credits;
            storage.refcount = 1;
        }
        let data = match kind {
            ChannelKind::Le => SignalData::LeCreditConnRes(LeCreditConnRes {
                dcid: dcids[0],
                mtu,
                mps,
                credits,
                result: LeCreditConnResultCode::Success,
            }),
            ChannelKind::Enhanced => SignalData::CreditConnRes(CreditConnRes {
                mtu,
                mps,
                credits,
                result: LeCreditConnResultCode::Success,
                dcids,
            }),
        };
        debug!("[l2cap][conn = {:?}] accepted {} channels", conn, count);
        let _ = state.queue(conn, L2capSignal::new(ident, data));
        Poll::Ready(Ok(indices))
    }

    /// Process a signalling command received on a link.
    ///
    /// Never waits: when the signalling queue is full, the answer to a request is dropped with
    /// [`Error::Busy`] and the peer has to retry.
    pub(crate) fn handle_signal(&self, conn: ConnHandle, signal: L2capSignal) -> Result<(), Error> {
        trace!("[l2cap][conn = {:?}] signal: {:?}", conn, signal);
        let L2capSignal { identifier, data } = signal;
        let mut state = self.state.borrow_mut();
        match data {
            SignalData::LeCreditConnReq(req) => self.le_request(&mut state, conn, identifier, req),
            SignalData::LeCreditConnRes(res) => {
                self.le_response(&mut state, conn, identifier, res);
                Ok(())
            }
            SignalData::CreditConnReq(req) => self.enhanced_request(&mut state, conn, identifier, req),
            SignalData::CreditConnRes(res) => {
                self.enhanced_response(&mut state, conn, identifier, res);
                Ok(())
            }
            SignalData::LeCreditFlowInd(ind) => {
                self.credits_received(&mut state, conn, ind);
                Ok(())
            }
            SignalData::DisconnectionReq(req) => self.disconnect_request(&mut state, conn, identifier, req),
            SignalData::DisconnectionRes(res) => {
                if let Some(idx) = state.index_of(res.scid) {
                    let storage = &mut state.channels[idx];
                    if storage.conn == Some(conn)
                        && storage.state == ChannelState::DisconnectRequested
                        && storage.ident == identifier
                    {
                        debug!("[l2cap][cid = {}] disconnected", res.scid);
                        storage.close(Error::Disconnected);
                        self.reset_rx(idx);
                    }
                }
                Ok(())
            }
            SignalData::CreditConnReconfigReq(req) => self.reconfigure_request(&mut state, conn, identifier, req),
            SignalData::CreditConnReconfigRes(res) => {
                for storage in state.channels.iter_mut().filter(|s| s.conn == Some(conn)) {
                    if let Some(reconfig) = storage.reconfig.as_mut() {
                        if reconfig.ident == identifier && reconfig.result.is_none() {
                            if res.result == ReconfigResult::Success {
                                storage.mtu = reconfig.mtu;
                                storage.mps = reconfig.mps;
                                reconfig.result = Some(Ok(()));
                            } else {
                                reconfig.result = Some(Err(Error::ReconfigurationRejected(res.result)));
                            }
                            storage.waker.wake();
                        }
                    }
                }
                Ok(())
            }
            SignalData::CommandReject(reject) => {
                warn!("[l2cap][conn = {:?}] command {} rejected: {:?}", conn, identifier, reject);
                for (idx, storage) in state.channels.iter_mut().enumerate() {
                    if storage.conn != Some(conn) {
                        continue;
                    }
                    match storage.state {
                        ChannelState::ConnectRequested if storage.ident == identifier => {
                            storage.close(Error::CommandRejected(reject.reason));
                            self.reset_rx(idx);
                        }
                        ChannelState::DisconnectRequested if storage.ident == identifier => {
                            storage.close(Error::Disconnected);
                            self.reset_rx(idx);
                        }
                        _ => {}
                    }
                    if let Some(reconfig) = storage.reconfig.as_mut() {
                        if reconfig.ident == identifier && reconfig.result.is_none() {
                            reconfig.result = Some(Err(Error::CommandRejected(reject.reason)));
                            storage.waker.wake();
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn le_request(&self, state: &mut State<'d>, conn: ConnHandle, ident: u8, req: LeCreditConnReq) -> Result<(), Error> {
        let result = if !is_dynamic(req.scid) {
            LeCreditConnResultCode::InvalidSourceId
        } else if state.peer_cid_in_use(conn, req.scid) {
            LeCreditConnResultCode::ScidAlreadyAllocated
        } else if req.mtu < LE_MIN_MTU || req.mps < LE_MIN_MTU || req.mps > MAX_MPS {
            LeCreditConnResultCode::UnacceptableParameters
        } else if let Some(slots) = state.free_slots(1) {
            let idx = slots[0];
            state.channels[idx] = ChannelStorage {
                state: ChannelState::PeerConnectRequested,
                ident,
                conn: Some(conn),
                kind: ChannelKind::Le,
                psm: req.psm,
                peer_cid: req.scid,
                peer_mtu: req.mtu,
                peer_mps: req.mps,
                peer_credits: req.credits,
                ..ChannelStorage::DISCONNECTED
            };
            self.reset_rx(idx);
            state.accept_waker.wake();
            debug!(
                "[l2cap][conn = {:?}] connection request on psm {} from cid {}",
                conn, req.psm, req.scid
            );
            return Ok(());
        } else {
            LeCreditConnResultCode::NoResources
        };

        warn!("[l2cap][conn = {:?}] rejecting connection request: {:?}", conn, result);
        let res = LeCreditConnRes {
            dcid: 0,
            mtu: 0,
            mps: 0,
            credits: 0,
            result,
        };
        state.queue(conn, L2capSignal::new(ident, SignalData::LeCreditConnRes(res)))
    }

    fn le_response(&self, state: &mut State<'d>, conn: ConnHandle, ident: u8, res: LeCreditConnRes) {
        let Some(idx) = state.channels.iter().position(|s| {
            s.state == ChannelState::ConnectRequested
                && s.conn == Some(conn)
                && s.ident == ident
                && s.kind == ChannelKind::Le
        }) else {
            warn!("[l2cap][conn = {:?}] unexpected connection response {}", conn, ident);
            return;
        };

        if res.result != LeCreditConnResultCode::Success {
            warn!("[l2cap][cid = {}] connection rejected: {:?}", cid(idx), res.result);
            state.channels[idx].close(Error::ConnectionRejected(res.result));
            self.reset_rx(idx);
            return;
        }
        let valid = is_dynamic(res.dcid)
            && !state.peer_cid_in_use(conn, res.dcid)
            && res.mtu >= LE_MIN_MTU
            && res.mps >= LE_MIN_MTU
            && res.mps <= MAX_MPS;
        let storage = &mut state.channels[idx];
        if !valid {
            warn!("[l2cap][cid = {}] invalid connection response: {:?}", cid(idx), res);
            if is_dynamic(res.dcid) {
                storage.peer_cid = res.dcid;
                self.fail(state, idx, Error::InvalidValue);
            } else {
                storage.close(Error::InvalidValue);
                self.reset_rx(idx);
            }
            return;
        }

        storage.connected(res.dcid, res.mtu, res.mps, res.credits);
        debug!(
            "[l2cap][cid = {}] connected to {} (mtu = {}, mps = {}, credits = {})",
            cid(idx),
            res.dcid,
            res.mtu,
            res.mps,
            res.credits
        );
        if storage.abandoned {
            self.fail(state, idx, Error::Disconnected);
        }
    }

    fn enhanced_request(&self, state: &mut State<'d>, conn: ConnHandle, ident: u8, req: CreditConnReq) -> Result<(), Error> {
        if !state.enhanced_credit {
            let reject = CommandRejectRes::not_understood();
            return state.queue(conn, L2capSignal::new(ident, SignalData::CommandReject(reject)));
        }

        let mut result = LeCreditConnResultCode::Success;
        if req.scids.is_empty() {
            result = LeCreditConnResultCode::InvalidParameters;
        } else if req.mtu < ECRED_MIN_MTU || req.mps < ECRED_MIN_MTU || req.mps > MAX_MPS {
            result = LeCreditConnResultCode::UnacceptableParameters;
        } else {
            for (i, scid) in req.scids.iter().enumerate() {
                if !is_dynamic(*scid) {
                    result = LeCreditConnResultCode::InvalidSourceId;
                    break;
                }
                if state.peer_cid_in_use(conn, *scid) || req.scids[..i].contains(scid) {
                    result = LeCreditConnResultCode::ScidAlreadyAllocated;
                    break;
                }
            }
        }
        let slots = match result {
            LeCreditConnResultCode::Success => state.free_slots(req.scids.len()),
            _ => None,
        };
        let Some(slots) = slots else {
            if result == LeCreditConnResultCode::Success {
                result = LeCreditConnResultCode::NoResources;
            }
            warn!("[l2cap][conn = {:?}] rejecting enhanced connection request: {:?}", conn, result);
            let mut dcids = Vec::new();
            for _ in req.scids.iter() {
                let _ = dcids.push(0);
            }
            let res = CreditConnRes {
                mtu: 0,
                mps: 0,
                credits: 0,
                result,
                dcids,
            };
            return state.queue(conn, L2capSignal::new(ident, SignalData::CreditConnRes(res)));
        };

        for (idx, scid) in slots.iter().copied().zip(req.scids.iter().copied()) {
            state.channels[idx] = ChannelStorage {
                state: ChannelState::PeerConnectRequested,
                ident,
                conn: Some(conn),
                kind: ChannelKind::Enhanced,
                psm: req.psm,
                peer_cid: scid,
                peer_mtu: req.mtu,
                peer_mps: req.mps,
                peer_credits: req.credits,
                ..ChannelStorage::DISCONNECTED
            };
            self.reset_rx(idx);
        }
        debug!(
            "[l2cap][conn = {:?}] enhanced connection request for {} channels on psm {}",
            conn,
            slots.len(),
            req.psm
        );
        state.accept_waker.wake();
        Ok(())
    }

    fn enhanced_response(&self, state: &mut State<'d>, conn: ConnHandle, ident: u8, res: CreditConnRes) {
        let mut slots = ChannelIndices::new();
        for (idx, storage) in state.channels.iter().enumerate() {
            if storage.state == ChannelState::ConnectRequested
                && storage.conn == Some(conn)
                && storage.ident == ident
                && storage.kind == ChannelKind::Enhanced
            {
                let _ = slots.push(idx);
            }
        }
        if slots.is_empty() {
            warn!("[l2cap][conn = {:?}] unexpected enhanced connection response {}", conn, ident);
            return;
        }

        let params = res.mtu >= ECRED_MIN_MTU && res.mps >= ECRED_MIN_MTU && res.mps <= MAX_MPS;
        let accepted = res.result == LeCreditConnResultCode::Success
            && params
            && res.dcids.len() == slots.len()
            && res.dcids.iter().all(|dcid| is_dynamic(*dcid) && !state.peer_cid_in_use(conn, *dcid));
        let reason = match res.result {
            LeCreditConnResultCode::Success if params => Error::ConnectionRejected(LeCreditConnResultCode::NoResources),
            LeCreditConnResultCode::Success => Error::InvalidValue,
            other => Error::ConnectionRejected(other),
        };
        if !accepted {
            warn!(
                "[l2cap][conn = {:?}] enhanced connection of {} channels failed: {:?}",
                conn,
                slots.len(),
                reason
            );
        }

        for (n, idx) in slots.iter().copied().enumerate() {
            let dcid = res.dcids.get(n).copied().unwrap_or(0);
            let storage = &mut state.channels[idx];
            if accepted {
                storage.connected(dcid, res.mtu, res.mps, res.credits);
                debug!("[l2cap][cid = {}] connected to {}", cid(idx), dcid);
                if storage.abandoned {
                    self.fail(state, idx, Error::Disconnected);
                }
            } else if is_dynamic(dcid) {
                // The peer allocated this one, it has to be torn down on its side too.
                storage.peer_cid = dcid;
                self.fail(state, idx, reason);
            } else {
                storage.close(reason);
                self.reset_rx(idx);
            }
        }
    }

    fn credits_received(&self, state: &mut State<'d>, conn: ConnHandle, ind: LeCreditFlowInd) {
        let Some(idx) = state.channels.iter().position(|s| {
            s.state == ChannelState::Connected && s.conn == Some(conn) && s.peer_cid == ind.cid
        }) else {
            debug!("[l2cap][conn = {:?}] credits for unknown cid {}", conn, ind.cid);
            return;
        };
        let storage = &mut state.channels[idx];
        match storage.peer_credits.checked_add(ind.credits) {
            Some(credits) => {
                trace!("[l2cap][cid = {}] {} credits received, now {}", cid(idx), ind.credits, credits);
                storage.peer_credits = credits;
                storage.waker.wake();
            }
            None => self.fail(state, idx, Error::Protocol(ProtocolViolation::CreditOverflow)),
        }
    }

    fn disconnect_request(&self, state: &mut State<'d>, conn: ConnHandle, ident: u8, req: DisconnectionReq) -> Result<(), Error> {
        let found = state.index_of(req.dcid).filter(|idx| {
            let storage = &state.channels[*idx];
            storage.conn == Some(conn)
                && storage.peer_cid == req.scid
                && matches!(
                    storage.state,
                    ChannelState::Connected | ChannelState::DisconnectRequested
                )
        });
        let data = match found {
            Some(idx) => {
                debug!("[l2cap][cid = {}] disconnected by peer", req.dcid);
                state.channels[idx].close(Error::Disconnected);
                self.reset_rx(idx);
                SignalData::DisconnectionRes(DisconnectionRes {
                    dcid: req.dcid,
                    scid: req.scid,
                })
            }
            None => {
                warn!("[l2cap][conn = {:?}] disconnect request for unknown cid {}", conn, req.dcid);
                SignalData::CommandReject(CommandRejectRes::invalid_cid(req.dcid, req.scid))
            }
        };
        state.queue(conn, L2capSignal::new(ident, data))
    }

    fn reconfigure_request(
        &self,
        state: &mut State<'d>,
        conn: ConnHandle,
        ident: u8,
        req: CreditConnReconfigReq,
    ) -> Result<(), Error> {
        let mut result = ReconfigResult::Success;
        let mut indices = ChannelIndices::new();
        for scid in req.scids.iter() {
            match state.channels.iter().position(|s| {
                s.state == ChannelState::Connected
                    && s.conn == Some(conn)
                    && s.peer_cid == *scid
                    && s.kind == ChannelKind::Enhanced
            }) {
                Some(idx) => {
                    let _ = indices.push(idx);
                }
                None => {
                    result = ReconfigResult::InvalidDestinationCid;
                    break;
                }
            }
        }
        if result == ReconfigResult::Success {
            if indices.iter().any(|idx| req.mtu < state.channels[*idx].peer_mtu) {
                result = ReconfigResult::MtuReductionNotAllowed;
            } else if indices.len() > 1 && indices.iter().any(|idx| req.mps < state.channels[*idx].peer_mps) {
                result = ReconfigResult::MpsReductionNotAllowed;
            } else if indices.is_empty() || req.mtu < ECRED_MIN_MTU || req.mps < ECRED_MIN_MTU || req.mps > MAX_MPS {
                result = ReconfigResult::UnacceptableParameters;
            }
        }

        if result == ReconfigResult::Success {
            for idx in indices.iter().copied() {
                let storage = &mut state.channels[idx];
                storage.peer_mtu = req.mtu;
                storage.peer_mps = req.mps;
                storage.waker.wake();
            }
            debug!(
                "[l2cap][conn = {:?}] peer reconfigured {} channels (mtu = {}, mps = {})",
                conn,
                indices.len(),
                req.mtu,
                req.mps
            );
        } else {
            warn!("[l2cap][conn = {:?}] rejecting reconfiguration: {:?}", conn, result);
        }
        let res = CreditConnReconfigRes { result };
        state.queue(conn, L2capSignal::new(ident, SignalData::CreditConnReconfigRes(res)))
    }

    /// Start receiving a PDU of `len` bytes.
    ///
    /// Returns false if the PDU should be discarded. Never waits: a PDU starting an SDU takes one
    /// of the packets reserved when the credit it uses was granted.
    pub(crate) fn begin_pdu(&self, conn: ConnHandle, cid: u16, len: u16) -> Result<bool, Error> {
        let mut state = self.state.borrow_mut();
        let Some(idx) = state.connected_index(conn, cid) else {
            trace!("[l2cap][conn = {:?}] discarding PDU for cid {}", conn, cid);
            return Ok(false);
        };
        let violation = {
            let storage = &state.channels[idx];
            if len > storage.mps {
                Some(ProtocolViolation::PduTooLarge)
            } else if storage.flow.available() == 0 {
                Some(ProtocolViolation::NoCredits)
            } else if storage.rx.expects_header() && (len as usize) < SDU_HEADER_LEN {
                Some(ProtocolViolation::Malformed)
            } else {
                None
            }
        };
        if let Some(violation) = violation {
            self.fail(&mut state, idx, Error::Protocol(violation));
            return Err(Error::Protocol(violation));
        }

        let packet = if state.channels[idx].rx.packet.is_none() {
            let id = AllocId::from_channel(idx);
            match self.pool.alloc_reserved(id).or_else(|| self.pool.alloc(id)) {
                Some(packet) => Some(packet),
                None => {
                    self.fail(&mut state, idx, Error::OutOfMemory);
                    return Err(Error::OutOfMemory);
                }
            }
        } else {
            // The reservation behind this credit is no longer needed.
            state.signal_waker.wake();
            None
        };
        let storage = &mut state.channels[idx];
        // Credits were checked above.
        let _ = storage.flow.received();
        storage.rx.begin(len, packet);
        Ok(true)
    }

    /// Append PDU payload for a channel, ignored if the channel is no longer receiving.
    pub(crate) fn write_pdu(&self, conn: ConnHandle, cid: u16, data: &[u8]) -> Result<(), Error> {
        let mut state = self.state.borrow_mut();
        let Some(idx) = state.connected_index(conn, cid) else {
            return Ok(());
        };
        let storage = &mut state.channels[idx];
        if !storage.rx.in_pdu {
            return Ok(());
        }
        let mtu = storage.mtu;
        if let Err(violation) = storage.rx.write(data, mtu) {
            self.fail(&mut state, idx, Error::Protocol(violation));
            return Err(Error::Protocol(violation));
        }
        Ok(())
    }

    /// The PDU in progress is complete, deliver whatever it completed to the channel handle.
    pub(crate) fn end_pdu(&self, conn: ConnHandle, cid: u16) -> Result<(), Error> {
        let mut state = self.state.borrow_mut();
        let Some(idx) = state.connected_index(conn, cid) else {
            return Ok(());
        };
        let storage = &mut state.channels[idx];
        if !storage.rx.in_pdu {
            return Ok(());
        }
        if storage.rx.pdu_remaining != 0 {
            self.fail(&mut state, idx, Error::Protocol(ProtocolViolation::Truncated));
            return Err(Error::Protocol(ProtocolViolation::Truncated));
        }
        let mode = storage.mode;
        let Some(item) = storage.rx.finish(mode) else {
            return Ok(());
        };
        // Credits are only granted while the queue has room for everything they can deliver.
        if self.inbound[idx].try_send(item).is_err() {
            self.fail(&mut state, idx, Error::OutOfMemory);
            return Err(Error::OutOfMemory);
        }
        Ok(())
    }

    /// Close a channel after the peer violated the protocol on it.
    pub(crate) fn protocol_violation(&self, conn: ConnHandle, cid: u16, violation: ProtocolViolation) {
        let mut state = self.state.borrow_mut();
        if let Some(idx) = state.connected_index(conn, cid) {
            self.fail(&mut state, idx, Error::Protocol(violation));
        }
    }

    /// The link is gone, every channel on it fails.
    pub(crate) fn disconnected(&self, conn: ConnHandle) {
        let mut state = self.state.borrow_mut();
        for idx in 0..state.channels.len() {
            let storage = &mut state.channels[idx];
            if storage.conn == Some(conn) && storage.state != ChannelState::Disconnected {
                storage.close(Error::Disconnected);
                self.reset_rx(idx);
            }
        }
        for _ in 0..state.pending.len() {
            if let Some(entry) = state.pending.pop_front() {
                if entry.0 != conn {
                    let _ = state.pending.push_back(entry);
                }
            }
        }
        state.space_waker.wake();
        state.accept_waker.wake();
        state.print();
    }

    /// Next signalling command to send: queued commands first, then credit grants and
    /// disconnection requests.
    ///
    /// Credits owed to a peer are only granted once packets are reserved for them, so a grant
    /// may wait for packets to be released.
    pub(crate) fn poll_pending(&self, cx: &mut Context<'_>) -> Poll<(ConnHandle, L2capSignal)> {
        let mut state = self.state.borrow_mut();
        if let Some(entry) = state.pending.pop_front() {
            state.space_waker.wake();
            return Poll::Ready(entry);
        }
        let mut deferred = false;
        for idx in 0..state.channels.len() {
            let storage = &state.channels[idx];
            self.trim_reservation(idx, storage);
            let Some(conn) = storage.conn else {
                continue;
            };
            if storage.state == ChannelState::Connected && storage.pending_credits > 0 {
                let credits = self.grantable(idx, storage);
                if credits > 0 {
                    let storage = &mut state.channels[idx];
                    let credits = storage.flow.grant(credits);
                    storage.pending_credits -= credits;
                    let ident = state.next_ident();
                    trace!("[l2cap][cid = {}] granting {} credits", cid(idx), credits);
                    let data = SignalData::LeCreditFlowInd(LeCreditFlowInd { cid: cid(idx), credits });
                    return Poll::Ready((conn, L2capSignal::new(ident, data)));
                }
                deferred = true;
            }
            let storage = &state.channels[idx];
            if storage.state == ChannelState::DisconnectRequested && storage.ident == 0 {
                let peer_cid = storage.peer_cid;
                let ident = state.next_ident();
                state.channels[idx].ident = ident;
                let data = SignalData::DisconnectionReq(DisconnectionReq {
                    dcid: peer_cid,
                    scid: cid(idx),
                });
                return Poll::Ready((conn, L2capSignal::new(ident, data)));
            }
        }
        state.signal_waker.register(cx.waker());
        if deferred {
            self.pool.register_waker(cx.waker());
        }
        Poll::Pending
    }

    /// Take ownership of the transmit side of a channel.
    pub(crate) fn poll_acquire_tx(&self, index: usize, cx: Option<&mut Context<'_>>) -> Poll<Result<TxParams, Error>> {
        let max_mps = (self.pool.mtu() - L2capHeader::SIZE).min(u16::MAX as usize) as u16;
        let mut state = self.state.borrow_mut();
        let storage = &mut state.channels[index];
        match (storage.state, storage.conn) {
            (ChannelState::Connected, Some(conn)) => {
                if storage.tx_busy {
                    if let Some(cx) = cx {
                        storage.waker.register(cx.waker());
                    }
                    return Poll::Pending;
                }
                storage.tx_busy = true;
                Poll::Ready(Ok(TxParams {
                    conn,
                    peer_cid: storage.peer_cid,
                    mtu: storage.peer_mtu.min(storage.mtu),
                    mps: storage.peer_mps.min(storage.mps).min(max_mps),
                }))
            }
            _ => Poll::Ready(Err(storage.error())),
        }
    }

    pub(crate) fn release_tx(&self, index: usize) {
        let mut state = self.state.borrow_mut();
        let storage = &mut state.channels[index];
        storage.tx_busy = false;
        storage.waker.wake();
    }

    /// Take `credits` transmit credits, waiting for the peer to grant them.
    pub(crate) fn poll_request_to_send(
        &self,
        index: usize,
        credits: u16,
        cx: Option<&mut Context<'_>>,
    ) -> Poll<Result<CreditGrant<'_, 'd>, Error>> {
        let mut state = self.state.borrow_mut();
        let storage = &mut state.channels[index];
        if storage.state != ChannelState::Connected {
            return Poll::Ready(Err(storage.error()));
        }
        if storage.peer_credits >= credits {
            storage.peer_credits -= credits;
            Poll::Ready(Ok(CreditGrant {
                state: &self.state,
                index,
                credits,
            }))
        } else {
            if let Some(cx) = cx {
                storage.waker.register(cx.waker());
            }
            trace!(
                "[l2cap][cid = {}] requested {} credits, available {}",
                cid(index),
                credits,
                storage.peer_credits
            );
            Poll::Pending
        }
    }

    pub(crate) fn poll_receive(&self, index: usize, cx: &mut Context<'_>) -> Poll<Result<RxItem, Error>> {
        let mut state = self.state.borrow_mut();
        let storage = &mut state.channels[index];
        if storage.state != ChannelState::Connected {
            return Poll::Ready(Err(storage.error()));
        }
        match self.inbound[index].poll_receive(cx) {
            Poll::Ready(item) => {
                if storage.pending_credits > 0 {
                    state.signal_waker.wake();
                }
                Poll::Ready(Ok(item))
            }
            Poll::Pending => {
                storage.waker.register(cx.waker());
                Poll::Pending
            }
        }
    }

    pub(crate) fn try_receive(&self, index: usize) -> Result<RxItem, Error> {
        let mut state = self.state.borrow_mut();
        let storage = &state.channels[index];
        if storage.state != ChannelState::Connected {
            return Err(storage.error());
        }
        let item = self.inbound[index].try_receive().map_err(|_| Error::Busy)?;
        if storage.pending_credits > 0 {
            state.signal_waker.wake();
        }
        Ok(item)
    }

    /// Received PDUs were processed, credits go back to the peer according to the policy.
    pub(crate) fn consumed(&self, index: usize, pdus: u16) {
        let mut state = self.state.borrow_mut();
        let storage = &mut state.channels[index];
        if storage.state != ChannelState::Connected || storage.mode != RxMode::Sdu {
            return;
        }
        if let Some(credits) = storage.flow.process(pdus) {
            storage.pending_credits = storage.pending_credits.saturating_add(credits);
            state.signal_waker.wake();
        }
    }

    pub(crate) fn give_credits(&self, index: usize, credits: u16) -> Result<(), Error> {
        let mut state = self.state.borrow_mut();
        let storage = &mut state.channels[index];
        if storage.state != ChannelState::Connected {
            return Err(storage.error());
        }
        let room = u16::MAX - storage.flow.available();
        storage.pending_credits = storage.pending_credits.saturating_add(credits).min(room);
        state.signal_waker.wake();
        Ok(())
    }

    /// Start closing a channel. Closing twice is a no-op.
    pub(crate) fn request_disconnect(&self, index: usize) {
        let mut state = self.state.borrow_mut();
        match state.channels[index].state {
            ChannelState::Connected => {
                debug!("[l2cap][cid = {}] disconnecting", cid(index));
                state.channels[index].start_disconnect(Error::Disconnected);
                self.reset_rx(index);
                state.signal_waker.wake();
            }
            ChannelState::ConnectRequested => state.channels[index].abandoned = true,
            _ => {}
        }
    }

    pub(crate) fn poll_disconnected(&self, index: usize, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.state.borrow_mut();
        let storage = &mut state.channels[index];
        if storage.state == ChannelState::Disconnected {
            Poll::Ready(())
        } else {
            storage.waker.register(cx.waker());
            Poll::Pending
        }
    }

    /// Queue a reconfiguration request raising the local MTU and changing the MPS.
    pub(crate) fn poll_start_reconfigure(
        &self,
        index: usize,
        mtu: u16,
        mps: u16,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), Error>> {
        let pool = self.pool.mtu();
        let mut state = self.state.borrow_mut();
        let conn = {
            let storage = &state.channels[index];
            if storage.kind != ChannelKind::Enhanced {
                return Poll::Ready(Err(Error::NotSupported));
            }
            let Some(conn) = storage.conn.filter(|_| storage.state == ChannelState::Connected) else {
                return Poll::Ready(Err(storage.error()));
            };
            if storage.reconfig.as_ref().is_some_and(|r| r.result.is_none()) {
                return Poll::Ready(Err(Error::Busy));
            }
            let fits = match storage.mode {
                RxMode::Sdu => mtu as usize + SDU_HEADER_LEN <= pool,
                RxMode::Segmented => mps as usize <= pool,
            };
            if mtu < storage.mtu || mps < ECRED_MIN_MTU || mps > MAX_MPS || mps > mtu || !fits {
                return Poll::Ready(Err(Error::InvalidValue));
            }
            conn
        };
        if state.pending.is_full() {
            state.space_waker.register(cx.waker());
            return Poll::Pending;
        }
        let ident = state.next_ident();
        state.channels[index].reconfig = Some(Reconfig {
            ident,
            mtu,
            mps,
            result: None,
        });
        let mut scids = Vec::new();
        let _ = scids.push(cid(index));
        let req = CreditConnReconfigReq { mtu, mps, scids };
        Poll::Ready(state.queue(conn, L2capSignal::new(ident, SignalData::CreditConnReconfigReq(req))))
    }

    pub(crate) fn poll_reconfigured(&self, index: usize, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        let mut state = self.state.borrow_mut();
        let storage = &mut state.channels[index];
        match storage.reconfig.as_ref().map(|r| r.result) {
            None => Poll::Ready(Ok(())),
            Some(Some(result)) => {
                storage.reconfig = None;
                Poll::Ready(result)
            }
            Some(None) => {
                storage.waker.register(cx.waker());
                Poll::Pending
            }
        }
    }

    /// The requester went away. A request still in flight stays registered so the response
    /// updates the channel parameters.
    pub(crate) fn cancel_reconfigure(&self, index: usize) {
        let mut state = self.state.borrow_mut();
        let storage = &mut state.channels[index];
        if storage.reconfig.as_ref().is_some_and(|r| r.result.is_some()) {
            storage.reconfig = None;
        }
    }

    /// Answer a command that could not be understood.
    pub(crate) fn reject(&self, conn: ConnHandle, identifier: u8) -> Result<(), Error> {
        let mut state = self.state.borrow_mut();
        let reject = CommandRejectRes::not_understood();
        state.queue(conn, L2capSignal::new(identifier, SignalData::CommandReject(reject)))
    }

    pub(crate) fn info(&self, index: usize) -> ChannelInfo {
        let state = self.state.borrow();
        let storage = &state.channels[index];
        ChannelInfo {
            state: storage.state,
            kind: storage.kind,
            conn: storage.conn,
            psm: storage.psm,
            local_cid: cid(index),
            peer_cid: storage.peer_cid,
            mtu: storage.mtu,
            mps: storage.mps,
            peer_mtu: storage.peer_mtu,
            peer_mps: storage.peer_mps,
            tx_credits: storage.peer_credits,
            rx_credits: storage.flow.available(),
            mode: storage.mode,
        }
    }

    pub(crate) fn inc_ref(&self, index: usize) {
        let mut state = self.state.borrow_mut();
        let storage = &mut state.channels[index];
        storage.refcount = unwrap!(storage.refcount.checked_add(1), "too many references to the same channel");
    }

    pub(crate) fn dec_ref(&self, index: usize) {
        let mut state = self.state.borrow_mut();
        let storage = &mut state.channels[index];
        storage.refcount = unwrap!(storage.refcount.checked_sub(1), "bug: dropping a channel with refcount 0");
        if storage.refcount == 0 {
            match storage.state {
                ChannelState::Connected => self.fail(&mut state, index, Error::Disconnected),
                ChannelState::ConnectRequested => storage.abandoned = true,
                _ => {}
            }
            self.reset_rx(index);
        }
    }
}

pub(crate) trait DynamicChannelManager {
    fn inc_ref(&self, index: usize);
    fn dec_ref(&self, index: usize);
    fn consumed(&self, index: usize, pdus: u16);
    fn info(&self, index: usize) -> ChannelInfo;
}

impl<'d> DynamicChannelManager for ChannelManager<'d> {
    fn inc_ref(&self, index: usize) {
        ChannelManager::inc_ref(self, index)
    }
    fn dec_ref(&self, index: usize) {
        ChannelManager::dec_ref(self, index)
    }
    fn consumed(&self, index: usize, pdus: u16) {
        ChannelManager::consumed(self, index, pdus)
    }
    fn info(&self, index: usize) -> ChannelInfo {
        ChannelManager::info(self, index)
    }
}

/// Transmit credits taken from a channel. Credits that were not confirmed as sent go back to
/// the channel when dropped.
pub(crate) struct CreditGrant<'a, 'd> {
    state: &'a RefCell<State<'d>>,
    index: usize,
    credits: u16,
}

impl<'a, 'd> CreditGrant<'a, 'd> {
    pub(crate) fn confirm(&mut self, sent: u16) {
        self.credits = self.credits.saturating_sub(sent);
    }
}

impl<'a, 'd> Drop for CreditGrant<'a, 'd> {
    fn drop(&mut self) {
        if self.credits > 0 {
            let mut state = self.state.borrow_mut();
            let storage = &mut state.channels[self.index];
            if storage.state == ChannelState::Connected {
                storage.peer_credits = storage.peer_credits.saturating_add(self.credits);
                storage.waker.wake();
            }
        }
    }
}
