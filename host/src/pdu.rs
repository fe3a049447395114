use crate::packet_pool::Packet;

/// A region of a pool packet holding received payload.
pub(crate) struct Pdu {
    pub packet: Packet,
    pub start: usize,
    pub len: usize,
}

impl Pdu {
    pub(crate) fn new(packet: Packet, start: usize, len: usize) -> Self {
        Self { packet, start, len }
    }
}

impl AsRef<[u8]> for Pdu {
    fn as_ref(&self) -> &[u8] {
        &self.packet.as_ref()[self.start..self.start + self.len]
    }
}

impl AsMut<[u8]> for Pdu {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.packet.as_mut()[self.start..self.start + self.len]
    }
}
