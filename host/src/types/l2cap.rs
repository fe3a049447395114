//! L2CAP frame headers and LE signalling packets.
use heapless::Vec;
use trouble_l2cap_macros::Codec;

use crate::codec::{Decode, Encode, Error, FixedSize, Type};
use crate::cursor::{ReadCursor, WriteCursor};

pub(crate) const L2CAP_CID_LE_U_SIGNAL: u16 = 0x0005;
pub(crate) const L2CAP_CID_DYN_START: u16 = 0x0040;
pub(crate) const L2CAP_CID_DYN_END: u16 = 0x007F;

/// Smallest MTU and MPS an LE credit based channel may use.
pub const LE_MIN_MTU: u16 = 23;
/// Smallest MTU and MPS an enhanced credit based channel may use.
pub const ECRED_MIN_MTU: u16 = 64;
/// Largest MPS allowed by the LE credit based modes.
pub const MAX_MPS: u16 = 65533;
/// Largest number of channels in one enhanced credit based request.
pub const ECRED_MAX_CHANNELS: usize = 5;

/// Size of the SDU length field carried by the first PDU of every SDU.
pub(crate) const SDU_HEADER_LEN: usize = 2;

pub(crate) fn is_dynamic(cid: u16) -> bool {
    (L2CAP_CID_DYN_START..=L2CAP_CID_DYN_END).contains(&cid)
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SignalCode {
    CommandRejectRes = 0x01,
    DisconnectionReq = 0x06,
    DisconnectionRes = 0x07,
    EchoReq = 0x08,
    EchoRes = 0x09,
    InformationReq = 0x0A,
    InformationRes = 0x0B,
    ConnParamUpdateReq = 0x12,
    ConnParamUpdateRes = 0x13,
    LeCreditConnReq = 0x14,
    LeCreditConnRes = 0x15,
    LeCreditFlowInd = 0x16,
    CreditConnReq = 0x17,
    CreditConnRes = 0x18,
    CreditConnReconfigReq = 0x19,
    CreditConnReconfigRes = 0x1A,
}

impl TryFrom<u8> for SignalCode {
    type Error = Error;
    fn try_from(val: u8) -> Result<Self, Error> {
        Ok(match val {
            0x01 => Self::CommandRejectRes,
            0x06 => Self::DisconnectionReq,
            0x07 => Self::DisconnectionRes,
            0x08 => Self::EchoReq,
            0x09 => Self::EchoRes,
            0x0A => Self::InformationReq,
            0x0B => Self::InformationRes,
            0x12 => Self::ConnParamUpdateReq,
            0x13 => Self::ConnParamUpdateRes,
            0x14 => Self::LeCreditConnReq,
            0x15 => Self::LeCreditConnRes,
            0x16 => Self::LeCreditFlowInd,
            0x17 => Self::CreditConnReq,
            0x18 => Self::CreditConnRes,
            0x19 => Self::CreditConnReconfigReq,
            0x1A => Self::CreditConnReconfigRes,
            _ => return Err(Error::InvalidValue),
        })
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Codec)]
pub struct L2capHeader {
    pub length: u16,
    pub channel: u16,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Codec)]
pub struct L2capSignalHeader {
    pub code: u8,
    pub identifier: u8,
    pub length: u16,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq, Codec)]
pub struct LeCreditConnReq {
    pub psm: u16,
    pub scid: u16,
    pub mtu: u16,
    pub mps: u16,
    pub credits: u16,
}

/// Result carried by LE and enhanced credit based connection responses.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum LeCreditConnResultCode {
    Success = 0x0000,
    SpsmNotSupported = 0x0002,
    NoResources = 0x0004,
    InsufficientAuthentication = 0x0005,
    InsufficientAuthorization = 0x0006,
    EncryptionKeyTooShort = 0x0007,
    InsufficientEncryption = 0x0008,
    InvalidSourceId = 0x0009,
    ScidAlreadyAllocated = 0x000A,
    UnacceptableParameters = 0x000B,
    InvalidParameters = 0x000C,
}

impl TryFrom<u16> for LeCreditConnResultCode {
    type Error = Error;
    fn try_from(val: u16) -> Result<Self, Error> {
        Ok(match val {
            0x0000 => Self::Success,
            0x0002 => Self::SpsmNotSupported,
            0x0004 => Self::NoResources,
            0x0005 => Self::InsufficientAuthentication,
            0x0006 => Self::InsufficientAuthorization,
            0x0007 => Self::EncryptionKeyTooShort,
            0x0008 => Self::InsufficientEncryption,
            0x0009 => Self::InvalidSourceId,
            0x000A => Self::ScidAlreadyAllocated,
            0x000B => Self::UnacceptableParameters,
            0x000C => Self::InvalidParameters,
            _ => return Err(Error::InvalidValue),
        })
    }
}

impl FixedSize for LeCreditConnResultCode {
    const SIZE: usize = 2;
}

impl Encode for LeCreditConnResultCode {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        (*self as u16).encode(dest)
    }
}

impl Decode<'_> for LeCreditConnResultCode {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        u16::decode(src)?.try_into()
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq, Codec)]
pub struct LeCreditConnRes {
    pub dcid: u16,
    pub mtu: u16,
    pub mps: u16,
    pub credits: u16,
    pub result: LeCreditConnResultCode,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq, Codec)]
pub struct LeCreditFlowInd {
    pub cid: u16,
    pub credits: u16,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq, Codec)]
pub struct DisconnectionReq {
    pub dcid: u16,
    pub scid: u16,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq, Codec)]
pub struct DisconnectionRes {
    pub dcid: u16,
    pub scid: u16,
}

/// Reason code of a command reject.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RejectReason {
    NotUnderstood = 0x0000,
    MtuExceeded = 0x0001,
    InvalidCid = 0x0002,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRejectRes {
    pub reason: u16,
    /// Reason specific data, the local and remote CID for `InvalidCid`.
    pub data: Vec<u8, 4>,
}

impl CommandRejectRes {
    pub(crate) fn not_understood() -> Self {
        Self {
            reason: RejectReason::NotUnderstood as u16,
            data: Vec::new(),
        }
    }

    pub(crate) fn invalid_cid(local: u16, remote: u16) -> Self {
        let mut data = Vec::new();
        let _ = data.extend_from_slice(&local.to_le_bytes());
        let _ = data.extend_from_slice(&remote.to_le_bytes());
        Self {
            reason: RejectReason::InvalidCid as u16,
            data,
        }
    }
}

impl Type for CommandRejectRes {
    fn size(&self) -> usize {
        2 + self.data.len()
    }
}

impl Encode for CommandRejectRes {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        let mut w = WriteCursor::new(dest);
        w.write(self.reason)?;
        w.append(&self.data[..])?;
        Ok(())
    }
}

impl Decode<'_> for CommandRejectRes {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        let mut r = ReadCursor::new(src);
        let reason: u16 = r.read()?;
        let rest = r.remaining();
        // Reason data longer than we care about is ignored.
        let data = Vec::from_slice(&rest[..rest.len().min(4)]).map_err(|_| Error::InsufficientSpace)?;
        Ok(Self { reason, data })
    }
}

fn encode_cids(w: &mut WriteCursor<'_>, cids: &[u16]) -> Result<(), Error> {
    for cid in cids {
        w.write(*cid)?;
    }
    Ok(())
}

fn decode_cids(r: &mut ReadCursor<'_>) -> Result<Vec<u16, ECRED_MAX_CHANNELS>, Error> {
    if r.available() % 2 != 0 {
        return Err(Error::InvalidValue);
    }
    let mut cids = Vec::new();
    while r.available() > 0 {
        cids.push(r.read()?).map_err(|_| Error::InvalidValue)?;
    }
    Ok(cids)
}

/// Enhanced credit based connection request, one source CID per channel.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditConnReq {
    pub psm: u16,
    pub mtu: u16,
    pub mps: u16,
    pub credits: u16,
    pub scids: Vec<u16, ECRED_MAX_CHANNELS>,
}

impl Type for CreditConnReq {
    fn size(&self) -> usize {
        8 + 2 * self.scids.len()
    }
}

impl Encode for CreditConnReq {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        let mut w = WriteCursor::new(dest);
        w.write(self.psm)?;
        w.write(self.mtu)?;
        w.write(self.mps)?;
        w.write(self.credits)?;
        encode_cids(&mut w, &self.scids)
    }
}

impl Decode<'_> for CreditConnReq {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        let mut r = ReadCursor::new(src);
        Ok(Self {
            psm: r.read()?,
            mtu: r.read()?,
            mps: r.read()?,
            credits: r.read()?,
            scids: decode_cids(&mut r)?,
        })
    }
}

/// Enhanced credit based connection response. A destination CID of zero marks a refused channel.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditConnRes {
    pub mtu: u16,
    pub mps: u16,
    pub credits: u16,
    pub result: LeCreditConnResultCode,
    pub dcids: Vec<u16, ECRED_MAX_CHANNELS>,
}

impl Type for CreditConnRes {
    fn size(&self) -> usize {
        8 + 2 * self.dcids.len()
    }
}

impl Encode for CreditConnRes {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        let mut w = WriteCursor::new(dest);
        w.write(self.mtu)?;
        w.write(self.mps)?;
        w.write(self.credits)?;
        w.write(self.result)?;
        encode_cids(&mut w, &self.dcids)
    }
}

impl Decode<'_> for CreditConnRes {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        let mut r = ReadCursor::new(src);
        Ok(Self {
            mtu: r.read()?,
            mps: r.read()?,
            credits: r.read()?,
            result: r.read()?,
            dcids: decode_cids(&mut r)?,
        })
    }
}

/// Reconfiguration request. `scids` are the channel endpoints of the requesting side.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditConnReconfigReq {
    pub mtu: u16,
    pub mps: u16,
    pub scids: Vec<u16, ECRED_MAX_CHANNELS>,
}

impl Type for CreditConnReconfigReq {
    fn size(&self) -> usize {
        4 + 2 * self.scids.len()
    }
}

impl Encode for CreditConnReconfigReq {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        let mut w = WriteCursor::new(dest);
        w.write(self.mtu)?;
        w.write(self.mps)?;
        encode_cids(&mut w, &self.scids)
    }
}

impl Decode<'_> for CreditConnReconfigReq {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        let mut r = ReadCursor::new(src);
        Ok(Self {
            mtu: r.read()?,
            mps: r.read()?,
            scids: decode_cids(&mut r)?,
        })
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ReconfigResult {
    Success = 0x0000,
    MtuReductionNotAllowed = 0x0001,
    MpsReductionNotAllowed = 0x0002,
    InvalidDestinationCid = 0x0003,
    UnacceptableParameters = 0x0004,
}

impl TryFrom<u16> for ReconfigResult {
    type Error = Error;
    fn try_from(val: u16) -> Result<Self, Error> {
        Ok(match val {
            0x0000 => Self::Success,
            0x0001 => Self::MtuReductionNotAllowed,
            0x0002 => Self::MpsReductionNotAllowed,
            0x0003 => Self::InvalidDestinationCid,
            0x0004 => Self::UnacceptableParameters,
            _ => return Err(Error::InvalidValue),
        })
    }
}

impl FixedSize for ReconfigResult {
    const SIZE: usize = 2;
}

impl Encode for ReconfigResult {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        (*self as u16).encode(dest)
    }
}

impl Decode<'_> for ReconfigResult {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        u16::decode(src)?.try_into()
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq, Codec)]
pub struct CreditConnReconfigRes {
    pub result: ReconfigResult,
}

/// Payload of a signalling packet on the LE signalling channel.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalData {
    CommandReject(CommandRejectRes),
    DisconnectionReq(DisconnectionReq),
    DisconnectionRes(DisconnectionRes),
    LeCreditConnReq(LeCreditConnReq),
    LeCreditConnRes(LeCreditConnRes),
    LeCreditFlowInd(LeCreditFlowInd),
    CreditConnReq(CreditConnReq),
    CreditConnRes(CreditConnRes),
    CreditConnReconfigReq(CreditConnReconfigReq),
    CreditConnReconfigRes(CreditConnReconfigRes),
}

impl SignalData {
    pub fn code(&self) -> SignalCode {
        match self {
            Self::CommandReject(_) => SignalCode::CommandRejectRes,
            Self::DisconnectionReq(_) => SignalCode::DisconnectionReq,
            Self::DisconnectionRes(_) => SignalCode::DisconnectionRes,
            Self::LeCreditConnReq(_) => SignalCode::LeCreditConnReq,
            Self::LeCreditConnRes(_) => SignalCode::LeCreditConnRes,
            Self::LeCreditFlowInd(_) => SignalCode::LeCreditFlowInd,
            Self::CreditConnReq(_) => SignalCode::CreditConnReq,
            Self::CreditConnRes(_) => SignalCode::CreditConnRes,
            Self::CreditConnReconfigReq(_) => SignalCode::CreditConnReconfigReq,
            Self::CreditConnReconfigRes(_) => SignalCode::CreditConnReconfigRes,
        }
    }

    /// Decode the payload of a signal whose header announced `code`.
    ///
    /// Returns `NotSupported` for codes this host does not handle, which callers answer with a
    /// command reject.
    pub fn decode_with(code: SignalCode, payload: &[u8]) -> Result<Self, crate::Error> {
        Ok(match code {
            SignalCode::CommandRejectRes => Self::CommandReject(CommandRejectRes::decode(payload)?),
            SignalCode::DisconnectionReq => Self::DisconnectionReq(DisconnectionReq::decode(payload)?),
            SignalCode::DisconnectionRes => Self::DisconnectionRes(DisconnectionRes::decode(payload)?),
            SignalCode::LeCreditConnReq => Self::LeCreditConnReq(LeCreditConnReq::decode(payload)?),
            SignalCode::LeCreditConnRes => Self::LeCreditConnRes(LeCreditConnRes::decode(payload)?),
            SignalCode::LeCreditFlowInd => Self::LeCreditFlowInd(LeCreditFlowInd::decode(payload)?),
            SignalCode::CreditConnReq => Self::CreditConnReq(CreditConnReq::decode(payload)?),
            SignalCode::CreditConnRes => Self::CreditConnRes(CreditConnRes::decode(payload)?),
            SignalCode::CreditConnReconfigReq => Self::CreditConnReconfigReq(CreditConnReconfigReq::decode(payload)?),
            SignalCode::CreditConnReconfigRes => Self::CreditConnReconfigRes(CreditConnReconfigRes::decode(payload)?),
            _ => return Err(crate::Error::NotSupported),
        })
    }

    fn payload_size(&self) -> usize {
        match self {
            Self::CommandReject(s) => s.size(),
            Self::DisconnectionReq(s) => s.size(),
            Self::DisconnectionRes(s) => s.size(),
            Self::LeCreditConnReq(s) => s.size(),
            Self::LeCreditConnRes(s) => s.size(),
            Self::LeCreditFlowInd(s) => s.size(),
            Self::CreditConnReq(s) => s.size(),
            Self::CreditConnRes(s) => s.size(),
            Self::CreditConnReconfigReq(s) => s.size(),
            Self::CreditConnReconfigRes(s) => s.size(),
        }
    }

    fn encode_payload(&self, w: &mut WriteCursor<'_>) -> Result<(), Error> {
        match self {
            Self::CommandReject(s) => w.write_ref(s),
            Self::DisconnectionReq(s) => w.write_ref(s),
            Self::DisconnectionRes(s) => w.write_ref(s),
            Self::LeCreditConnReq(s) => w.write_ref(s),
            Self::LeCreditConnRes(s) => w.write_ref(s),
            Self::LeCreditFlowInd(s) => w.write_ref(s),
            Self::CreditConnReq(s) => w.write_ref(s),
            Self::CreditConnRes(s) => w.write_ref(s),
            Self::CreditConnReconfigReq(s) => w.write_ref(s),
            Self::CreditConnReconfigRes(s) => w.write_ref(s),
        }
    }
}

/// A signalling command with its identifier, encoded with the signalling header.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2capSignal {
    pub identifier: u8,
    pub data: SignalData,
}

impl L2capSignal {
    pub fn new(identifier: u8, data: SignalData) -> Self {
        Self { identifier, data }
    }
}

impl Type for L2capSignal {
    fn size(&self) -> usize {
        L2capSignalHeader::SIZE + self.data.payload_size()
    }
}

impl Encode for L2capSignal {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        let mut w = WriteCursor::new(dest);
        w.write(L2capSignalHeader {
            code: self.data.code() as u8,
            identifier: self.identifier,
            length: self.data.payload_size() as u16,
        })?;
        self.data.encode_payload(&mut w)
    }
}
