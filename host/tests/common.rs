#![allow(dead_code)]
//! A loopback transport connecting two hosts, or a host and a scripted peer.
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::{poll_fn, Future};
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use bt_hci::data::AclPacketBoundary;
use bt_hci::param::ConnHandle;
use embassy_sync::waitqueue::WakerRegistration;
use trouble_l2cap::acl::{AclFragment, Fragments};
use trouble_l2cap::transport::{ControllerBuffers, Transport, TransportEvent, TryError};
use trouble_l2cap::{HostConfig, HostResources, L2capHost, Qos};

pub const PSM: u16 = 0x0081;
pub const SIGNAL_CID: u16 = 0x0005;

pub mod code {
    pub const COMMAND_REJECT: u8 = 0x01;
    pub const DISCONNECTION_REQ: u8 = 0x06;
    pub const DISCONNECTION_RES: u8 = 0x07;
    pub const ECHO_REQ: u8 = 0x08;
    pub const LE_CONN_REQ: u8 = 0x14;
    pub const LE_CONN_RES: u8 = 0x15;
    pub const FLOW_IND: u8 = 0x16;
    pub const ECRED_CONN_REQ: u8 = 0x17;
    pub const ECRED_CONN_RES: u8 = 0x18;
}

pub fn handle() -> ConnHandle {
    ConnHandle::new(1)
}

pub fn buffers(acl_mtu: u16, acl_packets: u16) -> ControllerBuffers {
    ControllerBuffers { acl_mtu, acl_packets }
}

/// Little endian encoding of a list of 16 bit fields.
pub fn le16(fields: &[u16]) -> Vec<u8> {
    fields.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// One ACL fragment as seen on the wire.
#[derive(Debug, Clone)]
pub struct Frame {
    pub handle: ConnHandle,
    pub start: bool,
    pub data: Vec<u8>,
}

impl Frame {
    fn boundary(&self) -> AclPacketBoundary {
        if self.start {
            AclPacketBoundary::FirstNonFlushable
        } else {
            AclPacketBoundary::Continuing
        }
    }
}

enum Event {
    LinkUp(ConnHandle),
    LinkDown(ConnHandle),
    Acl(Frame),
    Completed(ConnHandle, u16),
}

struct Endpoint {
    buffers: ControllerBuffers,
    inbound: RefCell<VecDeque<Event>>,
    waker: RefCell<WakerRegistration>,
    written: RefCell<Vec<Frame>>,
    busy: Cell<bool>,
    auto_complete: Cell<bool>,
}

impl Endpoint {
    fn new(buffers: ControllerBuffers) -> Self {
        Self {
            buffers,
            inbound: RefCell::new(VecDeque::new()),
            waker: RefCell::new(WakerRegistration::new()),
            written: RefCell::new(Vec::new()),
            busy: Cell::new(false),
            auto_complete: Cell::new(true),
        }
    }

    fn push(&self, event: Event) {
        self.inbound.borrow_mut().push_back(event);
        self.waker.borrow_mut().wake();
    }

    fn poll_next(&self, cx: &mut Context<'_>) -> Poll<Event> {
        match self.inbound.borrow_mut().pop_front() {
            Some(event) => Poll::Ready(event),
            None => {
                self.waker.borrow_mut().register(cx.waker());
                Poll::Pending
            }
        }
    }
}

/// Two controllers connected back to back.
pub struct Wire {
    ends: [Endpoint; 2],
}

impl Wire {
    pub fn new(a: ControllerBuffers, b: ControllerBuffers) -> Rc<Self> {
        Rc::new(Self {
            ends: [Endpoint::new(a), Endpoint::new(b)],
        })
    }

    pub fn transport(self: &Rc<Self>, side: usize) -> LoopbackTransport {
        LoopbackTransport {
            wire: self.clone(),
            side,
        }
    }

    pub fn peer(self: &Rc<Self>, side: usize) -> RawPeer {
        RawPeer {
            wire: self.clone(),
            side,
        }
    }

    pub fn link_up(&self, handle: ConnHandle) {
        for end in self.ends.iter() {
            end.push(Event::LinkUp(handle));
        }
    }

    pub fn link_down(&self, handle: ConnHandle) {
        for end in self.ends.iter() {
            end.push(Event::LinkDown(handle));
        }
    }

    /// Every fragment written by one side so far.
    pub fn written(&self, side: usize) -> Vec<Frame> {
        self.ends[side].written.borrow().clone()
    }

    /// Make non-blocking writes of one side fail with busy.
    pub fn set_busy(&self, side: usize, busy: bool) {
        self.ends[side].busy.set(busy);
    }

    /// Whether the controller of one side reports written fragments as completed right away.
    pub fn set_auto_complete(&self, side: usize, enabled: bool) {
        self.ends[side].auto_complete.set(enabled);
    }

    /// Report `count` fragments of one side as completed.
    pub fn complete(&self, side: usize, handle: ConnHandle, count: u16) {
        self.ends[side].push(Event::Completed(handle, count));
    }

    fn deliver(&self, from: usize, frame: Frame) {
        let end = &self.ends[from];
        assert!(
            frame.data.len() <= end.buffers.acl_mtu as usize,
            "fragment of {} bytes exceeds ACL MTU {}",
            frame.data.len(),
            end.buffers.acl_mtu
        );
        end.written.borrow_mut().push(frame.clone());
        if end.auto_complete.get() {
            end.push(Event::Completed(frame.handle, 1));
        }
        self.ends[from ^ 1].push(Event::Acl(frame));
    }
}

#[derive(Debug)]
pub struct LinkError;

pub struct LoopbackTransport {
    wire: Rc<Wire>,
    side: usize,
}

impl LoopbackTransport {
    fn end(&self) -> &Endpoint {
        &self.wire.ends[self.side]
    }

    fn frame(fragment: &AclFragment<'_>) -> Frame {
        Frame {
            handle: fragment.handle(),
            start: fragment.is_start(),
            data: fragment.data().to_vec(),
        }
    }
}

impl Transport for LoopbackTransport {
    type Error = LinkError;

    async fn buffers(&self) -> Result<ControllerBuffers, LinkError> {
        Ok(self.end().buffers)
    }

    async fn read<'a>(&self, buf: &'a mut [u8]) -> Result<TransportEvent<'a>, LinkError> {
        let end = self.end();
        let event = poll_fn(|cx| end.poll_next(cx)).await;
        Ok(match event {
            Event::LinkUp(handle) => TransportEvent::LinkUp(handle),
            Event::LinkDown(handle) => TransportEvent::LinkDown(handle),
            Event::Completed(handle, count) => TransportEvent::BuffersCompleted { handle, count },
            Event::Acl(frame) => {
                let len = frame.data.len();
                buf[..len].copy_from_slice(&frame.data);
                TransportEvent::Acl(AclFragment::new(frame.handle, frame.boundary(), &buf[..len]))
            }
        })
    }

    async fn write(&self, fragment: &AclFragment<'_>) -> Result<(), LinkError> {
        self.wire.deliver(self.side, Self::frame(fragment));
        Ok(())
    }

    fn try_write(&self, fragment: &AclFragment<'_>) -> Result<(), TryError<LinkError>> {
        if self.end().busy.get() {
            return Err(TryError::Busy);
        }
        self.wire.deliver(self.side, Self::frame(fragment));
        Ok(())
    }

    async fn disconnect(&self, handle: ConnHandle) -> Result<(), LinkError> {
        self.wire.link_down(handle);
        Ok(())
    }
}

/// A decoded signalling command.
#[derive(Debug, Clone)]
pub struct Signal {
    pub code: u8,
    pub ident: u8,
    pub payload: Vec<u8>,
}

impl Signal {
    /// 16 bit field at byte `offset` of the payload.
    pub fn u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.payload[offset], self.payload[offset + 1]])
    }
}

/// A scripted peer speaking raw L2CAP on one side of the wire.
pub struct RawPeer {
    wire: Rc<Wire>,
    side: usize,
}

impl RawPeer {
    fn end(&self) -> &Endpoint {
        &self.wire.ends[self.side]
    }

    /// Next fragment sent to this peer.
    pub async fn frame(&self) -> Frame {
        loop {
            if let Event::Acl(frame) = poll_fn(|cx| self.end().poll_next(cx)).await {
                return frame;
            }
        }
    }

    /// Fragments received and not read yet.
    pub fn pending_frames(&self) -> usize {
        self.end()
            .inbound
            .borrow()
            .iter()
            .filter(|e| matches!(e, Event::Acl(_)))
            .count()
    }

    /// Next complete PDU sent to this peer, as channel id and payload.
    pub async fn pdu(&self) -> (u16, Vec<u8>) {
        let first = self.frame().await;
        assert!(first.start, "PDU must start with a start fragment");
        let len = u16::from_le_bytes([first.data[0], first.data[1]]) as usize;
        let cid = u16::from_le_bytes([first.data[2], first.data[3]]);
        let mut payload = first.data[4..].to_vec();
        while payload.len() < len {
            let next = self.frame().await;
            assert!(!next.start, "PDU interrupted by another PDU");
            payload.extend_from_slice(&next.data);
        }
        assert_eq!(payload.len(), len);
        (cid, payload)
    }

    /// Next signalling command, skipping data PDUs.
    pub async fn signal(&self) -> Signal {
        loop {
            let (cid, payload) = self.pdu().await;
            if cid == SIGNAL_CID {
                let len = u16::from_le_bytes([payload[2], payload[3]]) as usize;
                assert_eq!(payload.len(), 4 + len);
                return Signal {
                    code: payload[0],
                    ident: payload[1],
                    payload: payload[4..].to_vec(),
                };
            }
        }
    }

    pub fn send_frame(&self, start: bool, data: &[u8]) {
        self.wire.deliver(
            self.side,
            Frame {
                handle: handle(),
                start,
                data: data.to_vec(),
            },
        );
    }

    /// Send a PDU, fragmented at this side's ACL MTU.
    pub fn send_pdu(&self, cid: u16, payload: &[u8]) {
        let mut pdu = le16(&[payload.len() as u16, cid]);
        pdu.extend_from_slice(payload);
        for (boundary, data) in Fragments::new(&pdu, self.end().buffers.acl_mtu as usize) {
            self.send_frame(!matches!(boundary, AclPacketBoundary::Continuing), data);
        }
    }

    /// Send an SDU on a channel, segmented at `mps`.
    pub fn send_sdu(&self, cid: u16, sdu: &[u8], mps: usize) {
        let mut first = le16(&[sdu.len() as u16]);
        let n = sdu.len().min(mps - 2);
        first.extend_from_slice(&sdu[..n]);
        self.send_pdu(cid, &first);
        for chunk in sdu[n..].chunks(mps) {
            self.send_pdu(cid, chunk);
        }
    }

    pub fn send_signal(&self, code: u8, ident: u8, payload: &[u8]) {
        let mut signal = vec![code, ident];
        signal.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        signal.extend_from_slice(payload);
        self.send_pdu(SIGNAL_CID, &signal);
    }
}

/// Create a host on one side of the wire.
pub fn host<const CHANNELS: usize, const PACKETS: usize, const MTU: usize>(
    wire: &Rc<Wire>,
    side: usize,
    qos: Qos,
) -> L2capHost<'static, LoopbackTransport> {
    let resources = Box::leak(Box::new(HostResources::<2, CHANNELS, PACKETS, MTU>::new(qos)));
    L2capHost::new(wire.transport(side), resources, HostConfig::default())
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Run a host while `body` runs.
pub async fn run_single<F: Future>(host: &L2capHost<'_, LoopbackTransport>, body: F) -> F::Output {
    let fut = async {
        tokio::select! {
            r = host.run() => panic!("host stopped: {:?}", r),
            out = body => out,
        }
    };
    tokio::time::timeout(TEST_TIMEOUT, fut).await.expect("test timed out")
}

/// Run two hosts while `body` runs.
pub async fn run_pair<F: Future>(
    a: &L2capHost<'_, LoopbackTransport>,
    b: &L2capHost<'_, LoopbackTransport>,
    body: F,
) -> F::Output {
    let fut = async {
        tokio::select! {
            r = a.run() => panic!("host a stopped: {:?}", r),
            r = b.run() => panic!("host b stopped: {:?}", r),
            out = body => out,
        }
    };
    tokio::time::timeout(TEST_TIMEOUT, fut).await.expect("test timed out")
}

/// Let the hosts process everything that is queued.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
