use crate::prelude::*;

use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio_util::codec::{Decoder, Encoder};

/// MBAP header is 7 bytes including the unit id.
pub const MBAP_LEN: usize = 7;
const MAX_PDU_LEN: usize = 253;
const EXCEPTION_BIT: u8 = 0x80;

pub const MAX_READ_COUNT: u16 = 125;
pub const MAX_WRITE_COUNT: u16 = 123;

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FunctionCode {
    ReadHolding = 0x03,
    WriteSingle = 0x06,
    WriteMultiple = 0x10,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    ReadHolding { address: u16, count: u16 },
    WriteSingle { address: u16, value: u16 },
    WriteMultiple { address: u16, values: Vec<u16> },
}

impl Request {
    pub fn function(&self) -> FunctionCode {
        match self {
            Self::ReadHolding { .. } => FunctionCode::ReadHolding,
            Self::WriteSingle { .. } => FunctionCode::WriteSingle,
            Self::WriteMultiple { .. } => FunctionCode::WriteMultiple,
        }
    }

    fn pdu(&self) -> Result<Vec<u8>, FrameError> {
        let mut pdu = vec![self.function().into()];

        match self {
            Self::ReadHolding { address, count } => {
                if *count == 0 || *count > MAX_READ_COUNT {
                    return Err(FrameError::new(format!("cannot read {} registers", count)));
                }
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&count.to_be_bytes());
            }
            Self::WriteSingle { address, value } => {
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&value.to_be_bytes());
            }
            Self::WriteMultiple { address, values } => {
                let count = values.len();
                if count == 0 || count > MAX_WRITE_COUNT as usize {
                    return Err(FrameError::new(format!("cannot write {} registers", count)));
                }
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&(count as u16).to_be_bytes());
                pdu.push((count * 2) as u8);
                for v in values {
                    pdu.extend_from_slice(&v.to_be_bytes());
                }
            }
        }

        Ok(pdu)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    ReadHolding(Vec<u16>),
    WriteSingle { address: u16, value: u16 },
    WriteMultiple { address: u16, count: u16 },
    Exception { function: u8, code: u8 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestFrame {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub request: Request,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseFrame {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub response: Response,
}

pub fn encode(frame: &RequestFrame) -> Result<Vec<u8>, FrameError> {
    let pdu = frame.request.pdu()?;
    let mut out = Vec::with_capacity(MBAP_LEN + pdu.len());
    out.extend_from_slice(&frame.transaction_id.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&(pdu.len() as u16 + 1).to_be_bytes());
    out.push(frame.unit_id);
    out.extend_from_slice(&pdu);
    Ok(out)
}

/// Some v3 firmware answers with a 9 byte exception frame whose MBAP length says 4, one more
/// than the unit id, function and exception code it actually carries. Left alone, the decoder
/// waits for a byte that never comes and the stream desynchronizes.
///
/// Rewrites the length in place and returns true only for that exact shape.
pub fn repair_exception_length(header: &mut [u8]) -> bool {
    if header.len() < MBAP_LEN + 1 {
        return false;
    }

    let declared = u16::from_be_bytes([header[4], header[5]]);
    if declared == 4 && header[7] & EXCEPTION_BIT != 0 {
        header[4] = 0;
        header[5] = 3;
        return true;
    }

    false
}

/// Decode one complete frame. `data` must hold exactly the bytes the MBAP length announces.
pub fn decode(data: &[u8]) -> Result<ResponseFrame, FrameError> {
    if data.len() < MBAP_LEN + 1 {
        return Err(FrameError::new(format!("frame too short ({} bytes)", data.len())));
    }

    let transaction_id = u16::from_be_bytes([data[0], data[1]]);
    let protocol = u16::from_be_bytes([data[2], data[3]]);
    let length = u16::from_be_bytes([data[4], data[5]]) as usize;
    let unit_id = data[6];

    if protocol != 0 {
        return Err(FrameError::new(format!("unexpected protocol id {}", protocol)));
    }
    if length != data.len() - 6 {
        return Err(FrameError::new(format!(
            "length field {} does not match {} bytes of payload",
            length,
            data.len() - 6
        )));
    }

    let function = data[7];
    let pdu = &data[8..];

    let response = if function & EXCEPTION_BIT != 0 {
        if pdu.len() != 1 {
            return Err(FrameError::new("exception pdu must carry exactly one code"));
        }
        Response::Exception {
            function: function & !EXCEPTION_BIT,
            code: pdu[0],
        }
    } else {
        match FunctionCode::try_from(function) {
            Ok(FunctionCode::ReadHolding) => {
                let byte_count = *pdu
                    .first()
                    .ok_or_else(|| FrameError::new("read response without byte count"))?
                    as usize;
                if byte_count % 2 != 0 || pdu.len() != byte_count + 1 {
                    return Err(FrameError::new(format!(
                        "byte count {} inconsistent with {} byte pdu",
                        byte_count,
                        pdu.len()
                    )));
                }
                let words = pdu[1..]
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                Response::ReadHolding(words)
            }
            Ok(FunctionCode::WriteSingle) | Ok(FunctionCode::WriteMultiple) => {
                if pdu.len() != 4 {
                    return Err(FrameError::new(format!("write echo has {} bytes", pdu.len())));
                }
                let address = u16::from_be_bytes([pdu[0], pdu[1]]);
                let value = u16::from_be_bytes([pdu[2], pdu[3]]);
                if function == u8::from(FunctionCode::WriteSingle) {
                    Response::WriteSingle { address, value }
                } else {
                    Response::WriteMultiple {
                        address,
                        count: value,
                    }
                }
            }
            Err(_) => {
                return Err(FrameError::new(format!("unsupported function {:#04x}", function)))
            }
        }
    };

    Ok(ResponseFrame {
        transaction_id,
        unit_id,
        response,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Streaming codec for the client side of a Modbus-TCP connection.
#[derive(Clone, Debug, Default)]
pub struct ModbusCodec {
    repair_exception_length: bool,
}

impl ModbusCodec {
    pub fn new(version: BatteryVersion) -> Self {
        Self {
            repair_exception_length: version.repairs_exception_length(),
        }
    }
}

impl Decoder for ModbusCodec {
    type Item = ResponseFrame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < MBAP_LEN + 1 {
            return Ok(None);
        }

        if self.repair_exception_length && repair_exception_length(&mut src[..]) {
            debug!("repaired exception frame length: {:?}", &src[..MBAP_LEN + 1]);
        }

        let length = u16::from_be_bytes([src[4], src[5]]) as usize;
        if length < 2 || length > MAX_PDU_LEN + 1 {
            return Err(FrameError::new(format!("invalid length field {}", length)).into());
        }

        let total = 6 + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total);
        Ok(Some(decode(&frame)?))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !src.is_empty() {
                    warn!("discarding {} trailing bytes at eof", src.len());
                    src.advance(src.len());
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<RequestFrame> for ModbusCodec {
    type Error = CodecError;

    fn encode(&mut self, item: RequestFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = encode(&item)?;
        dst.reserve(bytes.len());
        dst.put_slice(&bytes);
        Ok(())
    }
}
