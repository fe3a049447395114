//! ACL data fragments exchanged with the transport.
use bt_hci::data::AclPacketBoundary;
use bt_hci::param::ConnHandle;

/// Size of the HCI ACL data header.
pub const ACL_HEADER_LEN: usize = 4;

/// One link layer sized piece of an L2CAP PDU.
#[derive(Debug, Clone, Copy)]
pub struct AclFragment<'a> {
    handle: ConnHandle,
    boundary: AclPacketBoundary,
    data: &'a [u8],
}

impl<'a> AclFragment<'a> {
    pub fn new(handle: ConnHandle, boundary: AclPacketBoundary, data: &'a [u8]) -> Self {
        Self { handle, boundary, data }
    }

    pub fn handle(&self) -> ConnHandle {
        self.handle
    }

    pub fn boundary(&self) -> AclPacketBoundary {
        self.boundary
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Whether this fragment starts a new PDU.
    pub fn is_start(&self) -> bool {
        !matches!(self.boundary, AclPacketBoundary::Continuing)
    }
}

/// Splits a PDU into fragments no larger than the controller ACL buffer size.
///
/// The first fragment is tagged as a first non-flushable packet, the rest as continuations.
pub struct Fragments<'a> {
    pdu: &'a [u8],
    mtu: usize,
    first: bool,
}

impl<'a> Fragments<'a> {
    pub fn new(pdu: &'a [u8], mtu: usize) -> Self {
        assert!(mtu > 0);
        Self { pdu, mtu, first: true }
    }

    /// Number of fragments a PDU of `len` bytes occupies.
    pub fn count(len: usize, mtu: usize) -> usize {
        len.div_ceil(mtu).max(1)
    }
}

impl<'a> Iterator for Fragments<'a> {
    type Item = (AclPacketBoundary, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pdu.is_empty() && !self.first {
            return None;
        }
        let n = self.pdu.len().min(self.mtu);
        let (data, rest) = self.pdu.split_at(n);
        self.pdu = rest;
        let boundary = if self.first {
            AclPacketBoundary::FirstNonFlushable
        } else {
            AclPacketBoundary::Continuing
        };
        self.first = false;
        Some((boundary, data))
    }
}
