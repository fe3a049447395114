use core::cell::RefCell;

use bt_hci::param::ConnHandle;
use heapless::Vec;

use crate::config::L2CAP_SIGNAL_MTU;
use crate::types::l2cap::SDU_HEADER_LEN;
use crate::{Error, ProtocolViolation};

pub(crate) type SignalBuffer = Vec<u8, L2CAP_SIGNAL_MTU>;
pub(crate) type SarType = Option<(ConnHandle, AssemblyState)>;

pub(crate) const EMPTY_SAR: SarType = None;

/// Where the bytes of a PDU in progress go.
pub(crate) enum Sink {
    /// Signalling packets are collected here, they never touch the packet pool.
    Signal(SignalBuffer),
    /// Bytes are streamed into the channel receiving the PDU.
    Channel,
    /// The rest of the PDU is dropped.
    Discard,
}

pub(crate) struct AssemblyState {
    // Target channel of current assembly.
    pub channel: u16,
    // Target length of the assembly.
    pub length: u16,
    pub written: u16,
    pub sink: Sink,
}

impl AssemblyState {
    pub(crate) fn is_channel(&self) -> bool {
        matches!(self.sink, Sink::Channel)
    }
}

/// Outcome of feeding a continuation fragment.
pub(crate) enum Progress {
    /// The fragment belongs to a channel PDU, `complete` when it was the last one.
    Channel { channel: u16, complete: bool },
    /// A signalling packet was completed.
    Signal(SignalBuffer),
    /// Nothing to deliver yet.
    Pending,
}

#[derive(Debug, PartialEq)]
pub(crate) struct Violation {
    /// Channel of the PDU that was being reassembled, if any.
    pub channel: Option<u16>,
    pub kind: ProtocolViolation,
}

// Handles reassembling of L2CAP PDUs from ACL fragments, one PDU per link at a time.
pub(crate) struct PacketReassembly<'d> {
    handles: RefCell<&'d mut [SarType]>,
}

impl<'d> PacketReassembly<'d> {
    pub fn new(handles: &'d mut [SarType]) -> Self {
        Self {
            handles: RefCell::new(handles),
        }
    }

    /// Initializes a reassembly where `written` bytes arrived with the first fragment.
    ///
    /// Returns OutOfMemory if there is no space for this reassembly.
    pub fn init(&self, handle: ConnHandle, channel: u16, length: u16, written: u16, sink: Sink) -> Result<(), Error> {
        let mut handles = self.handles.borrow_mut();
        let state = AssemblyState {
            channel,
            length,
            written,
            sink,
        };
        for entry in handles.iter_mut() {
            if entry.is_none() {
                entry.replace((handle, state));
                return Ok(());
            }
        }
        Err(Error::OutOfMemory)
    }

    /// Removes an in progress reassembly for the link, called when a new PDU starts.
    pub fn take(&self, handle: ConnHandle) -> Option<AssemblyState> {
        let mut handles = self.handles.borrow_mut();
        for entry in handles.iter_mut() {
            match entry {
                Some((h, _)) if *h == handle => return entry.take().map(|(_, state)| state),
                _ => {}
            }
        }
        None
    }

    /// Deletes any reassemblies for the disconnected handle.
    pub fn disconnected(&self, handle: ConnHandle) {
        let _ = self.take(handle);
    }

    pub fn in_progress(&self, handle: ConnHandle) -> bool {
        let handles = self.handles.borrow();
        handles.iter().any(|entry| matches!(entry, Some((h, _)) if *h == handle))
    }

    /// Updates any in progress packet assembly for the connection with a continuation fragment.
    pub fn update(&self, handle: ConnHandle, data: &[u8]) -> Result<Progress, Violation> {
        let mut handles = self.handles.borrow_mut();
        let Some(entry) = handles.iter_mut().find(|e| matches!(e, Some((h, _)) if *h == handle)) else {
            return Err(Violation {
                channel: None,
                kind: ProtocolViolation::UnexpectedContinuation,
            });
        };
        let Some((_, state)) = entry.as_mut() else {
            return Err(Violation {
                channel: None,
                kind: ProtocolViolation::UnexpectedContinuation,
            });
        };

        let written = state.written as usize + data.len();
        if written > state.length as usize {
            let channel = state.is_channel().then_some(state.channel);
            *entry = None;
            return Err(Violation {
                channel,
                kind: ProtocolViolation::Overrun,
            });
        }
        state.written = written as u16;
        let overflow = match &mut state.sink {
            Sink::Signal(buf) => buf.extend_from_slice(data).is_err(),
            _ => false,
        };
        if overflow {
            *entry = None;
            return Err(Violation {
                channel: None,
                kind: ProtocolViolation::PduTooLarge,
            });
        }

        let complete = state.written == state.length;
        let channel = state.channel;
        if !complete {
            return Ok(match state.sink {
                Sink::Channel => Progress::Channel {
                    channel,
                    complete: false,
                },
                _ => Progress::Pending,
            });
        }

        let Some((_, state)) = entry.take() else {
            return Ok(Progress::Pending);
        };
        Ok(match state.sink {
            Sink::Channel => Progress::Channel { channel, complete: true },
            Sink::Signal(buf) => Progress::Signal(buf),
            Sink::Discard => Progress::Pending,
        })
    }
}

/// A slice of an SDU carried by one PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Segment {
    /// Offset of the first SDU byte in this PDU.
    pub offset: usize,
    /// Number of SDU bytes in this PDU.
    pub len: usize,
    /// The first PDU also carries the SDU length.
    pub first: bool,
}

impl Segment {
    /// Length of the PDU payload, including the SDU header on the first segment.
    pub fn pdu_len(&self) -> usize {
        if self.first {
            self.len + SDU_HEADER_LEN
        } else {
            self.len
        }
    }
}

/// Splits an SDU into segments that fit the peer MPS.
pub(crate) struct Segments {
    total: usize,
    mps: usize,
    offset: usize,
    first: bool,
}

impl Segments {
    pub fn new(total: usize, mps: u16) -> Self {
        let mps = mps as usize;
        assert!(mps > SDU_HEADER_LEN);
        Self {
            total,
            mps,
            offset: 0,
            first: true,
        }
    }
}

impl Iterator for Segments {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        if !self.first && self.offset >= self.total {
            return None;
        }
        let room = if self.first { self.mps - SDU_HEADER_LEN } else { self.mps };
        let len = (self.total - self.offset).min(room);
        let segment = Segment {
            offset: self.offset,
            len,
            first: self.first,
        };
        self.first = false;
        self.offset += len;
        Some(segment)
    }
}

/// Number of PDUs needed to carry an SDU of `len` bytes.
pub(crate) fn segment_count(len: usize, mps: u16) -> usize {
    (len + SDU_HEADER_LEN).div_ceil(mps as usize)
}
