use crate::encoding::{Reader, Writer};
use crate::pdu::{Request, Response, MAX_PDU_LEN};
use crate::{DecodeError, EncodeError, FrameError};

pub const MBAP_HEADER_LEN: usize = 7;
/// Transaction id, protocol id and length: everything before the counted bytes.
pub const MBAP_PREFIX_LEN: usize = 6;
pub const MAX_ADU_LEN: usize = MBAP_HEADER_LEN + MAX_PDU_LEN;
pub const MODBUS_PROTOCOL_ID: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Length includes unit-id byte + PDU length.
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_be_u16(self.transaction_id)?;
        w.write_be_u16(self.protocol_id)?;
        w.write_be_u16(self.length)?;
        w.write_u8(self.unit_id)?;
        Ok(())
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let transaction_id = r.read_be_u16()?;
        let protocol_id = r.read_be_u16()?;
        if protocol_id != MODBUS_PROTOCOL_ID {
            return Err(DecodeError::InvalidProtocolId(protocol_id));
        }
        let length = r.read_be_u16()?;
        // Unit id plus at least a function code, at most a full PDU.
        if length < 2 || usize::from(length) > MAX_PDU_LEN + 1 {
            return Err(DecodeError::InvalidLength);
        }
        let unit_id = r.read_u8()?;

        Ok(Self {
            transaction_id,
            protocol_id,
            length,
            unit_id,
        })
    }

    pub fn pdu_len(&self) -> usize {
        usize::from(self.length).saturating_sub(1)
    }
}

pub fn encode_frame(
    w: &mut Writer<'_>,
    transaction_id: u16,
    unit_id: u8,
    pdu: &[u8],
) -> Result<(), EncodeError> {
    if pdu.is_empty() || pdu.len() > MAX_PDU_LEN {
        return Err(EncodeError::InvalidLength);
    }
    let length = u16::try_from(pdu.len() + 1).map_err(|_| EncodeError::ValueOutOfRange)?;

    let header = MbapHeader {
        transaction_id,
        protocol_id: MODBUS_PROTOCOL_ID,
        length,
        unit_id,
    };
    header.encode(w)?;
    w.write_all(pdu)?;
    Ok(())
}

/// Serializes `request` as a complete MBAP frame.
pub fn encode_request(
    w: &mut Writer<'_>,
    transaction_id: u16,
    unit_id: u8,
    request: &Request<'_>,
) -> Result<(), EncodeError> {
    let mut pdu = [0u8; MAX_PDU_LEN];
    let mut pdu_writer = Writer::new(&mut pdu);
    request.encode(&mut pdu_writer)?;
    encode_frame(w, transaction_id, unit_id, pdu_writer.as_written())
}

/// Reads exactly one frame, failing with `UnexpectedEof` on short input.
pub fn decode_frame<'a>(r: &mut Reader<'a>) -> Result<(MbapHeader, &'a [u8]), DecodeError> {
    let header = MbapHeader::decode(r)?;
    let pdu = r.read_exact(header.pdu_len())?;
    Ok((header, pdu))
}

/// A response frame cut out of a receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseFrame<'a> {
    pub header: MbapHeader,
    pub response: Response<'a>,
}

impl<'a> ResponseFrame<'a> {
    pub fn transaction_id(&self) -> u16 {
        self.header.transaction_id
    }

    pub fn unit_id(&self) -> u8 {
        self.header.unit_id
    }
}

/// Total length of the frame at the head of `buf`, once its length field
/// has arrived.
pub fn frame_len(buf: &[u8]) -> Option<usize> {
    let length = buf.get(4..MBAP_PREFIX_LEN)?;
    Some(MBAP_PREFIX_LEN + usize::from(u16::from_be_bytes([length[0], length[1]])))
}

/// Decodes the response frame at the head of a stream buffer.
///
/// Returns the frame together with the number of bytes it occupies so the
/// caller can drop exactly that span. While the buffer is shorter than the
/// declared frame the result is [`FrameError::Incomplete`] no matter what
/// the partial bytes contain; only a complete frame is validated.
pub fn decode_response(buf: &[u8]) -> Result<(ResponseFrame<'_>, usize), FrameError> {
    let total = frame_len(buf).ok_or(FrameError::Incomplete)?;
    if buf.len() < total {
        return Err(FrameError::Incomplete);
    }

    let mut r = Reader::new(&buf[..total]);
    let (header, pdu) = decode_frame(&mut r)?;

    let mut pdu_reader = Reader::new(pdu);
    let response = Response::decode(&mut pdu_reader).map_err(|err| match err {
        // The length field promised more than the PDU holds.
        DecodeError::UnexpectedEof => DecodeError::InvalidLength,
        other => other,
    })?;
    if !pdu_reader.is_empty() {
        return Err(FrameError::Malformed(DecodeError::TrailingBytes(
            pdu_reader.remaining(),
        )));
    }

    Ok((ResponseFrame { header, response }, total))
}
