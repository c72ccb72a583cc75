//! FESL and Theater packet framing: the shared 12-byte header shape, body
//! tail convention, and the two families' differing transmission-type and
//! transaction-id placement.

use crate::constants::HEADER_LENGTH;
use crate::error::{Error, Result};
use crate::payload::Payload;

const FESL_TAGS: [&[u8; 4]; 4] = [b"fsys", b"acct", b"rank", b"recp"];
const THEATER_TAGS: [&[u8; 4]; 9] = [
    b"CONN", b"USER", b"LLST", b"LDAT", b"GLST", b"GDAT", b"GDET", b"PDAT", b"PING",
];
const THEATER_ERROR_TAGS: [&[u8; 4]; 4] = [b"ngam", b"nrom", b"ntfn", b"bpar"];

/// FESL's single transmission-type byte (header byte 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeslTransmissionType {
    Ping,
    SinglePacketResponse,
    MultiPacketResponse,
    SinglePacketRequest,
    MultiPacketRequest,
}

impl FeslTransmissionType {
    fn to_byte(self) -> u8 {
        match self {
            FeslTransmissionType::Ping => 0x00,
            FeslTransmissionType::SinglePacketResponse => 0x80,
            FeslTransmissionType::MultiPacketResponse => 0xB0,
            FeslTransmissionType::SinglePacketRequest => 0xC0,
            FeslTransmissionType::MultiPacketRequest => 0xF0,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(FeslTransmissionType::Ping),
            0x80 => Some(FeslTransmissionType::SinglePacketResponse),
            0xB0 => Some(FeslTransmissionType::MultiPacketResponse),
            0xC0 => Some(FeslTransmissionType::SinglePacketRequest),
            0xF0 => Some(FeslTransmissionType::MultiPacketRequest),
            _ => None,
        }
    }
}

/// Theater's four-byte transmission discriminator (header bytes 4-7).
/// Error responses carry one of [`THEATER_ERROR_TAGS`]; the exact tag is
/// kept so callers can map it to a [`crate::error::NotFoundKind`] or
/// `Parameter` error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TheaterTransmissionType {
    Request,
    OkResponse,
    ErrorResponse([u8; 4]),
}

/// A complete FESL packet: header bytes plus a body already trailed with
/// `\n\x00`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeslPacket {
    pub header: [u8; HEADER_LENGTH],
    pub body: Vec<u8>,
}

/// Body content accepted by [`FeslPacket::build`]/[`TheaterPacket::build`]:
/// either a pre-serialized byte string, or a [`Payload`] to serialize.
pub enum Body<'a> {
    Raw(&'a [u8]),
    Payload(&'a Payload),
}

impl<'a> Body<'a> {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            Body::Raw(b) => b.to_vec(),
            Body::Payload(p) => p.to_bytes(),
        }
    }
}

fn int_to_be(value: u32, len: usize) -> Vec<u8> {
    value.to_be_bytes()[4 - len..].to_vec()
}

fn be_to_int(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf[4 - bytes.len()..].copy_from_slice(bytes);
    u32::from_be_bytes(buf)
}

impl FeslPacket {
    /// Builds a packet from a 4-byte type tag, body content, transmission
    /// type, and optional transaction id. Computes the length indicator
    /// and transmission/tid header bytes.
    pub fn build(
        tag: &[u8; 4],
        body: Body<'_>,
        transmission_type: FeslTransmissionType,
        tid: Option<u32>,
    ) -> Self {
        let mut header = [0u8; HEADER_LENGTH];
        header[0..4].copy_from_slice(tag);

        let mut body = body.into_bytes();
        body.extend_from_slice(b"\n\x00");

        let mut packet = FeslPacket { header, body };
        if let Some(tid) = tid {
            packet.set_tid(tid);
        }
        packet.set_transmission_type(transmission_type);
        packet.set_length_indicators();
        packet
    }

    pub fn set_tid(&mut self, tid: u32) {
        self.header[5..8].copy_from_slice(&int_to_be(tid, 3));
    }

    pub fn tid(&self) -> u32 {
        be_to_int(&self.header[5..8])
    }

    pub fn set_transmission_type(&mut self, ty: FeslTransmissionType) {
        self.header[4] = ty.to_byte();
    }

    pub fn transmission_type(&self) -> Result<FeslTransmissionType> {
        FeslTransmissionType::from_byte(self.header[4])
            .ok_or_else(|| Error::Protocol(format!("unknown FESL transmission type {:#x}", self.header[4])))
    }

    fn set_length_indicators(&mut self) {
        let len = (self.header.len() + self.body.len()) as u32;
        self.header[8..12].copy_from_slice(&len.to_be_bytes());
    }

    pub fn indicated_length(&self) -> u32 {
        be_to_int(&self.header[8..12])
    }

    pub fn validate_header(&self) -> Result<()> {
        if self.indicated_length() == 0 {
            return Err(Error::Protocol("packet header is not valid".to_string()));
        }
        let tag: &[u8; 4] = self.header[0..4].try_into().unwrap();
        let tag_ok = FESL_TAGS.contains(&tag);
        let tx_ok = matches!(self.header[4], 0x00 | 0x80 | 0xB0 | 0xC0 | 0xF0);
        if !tag_ok || !tx_ok {
            return Err(Error::Protocol("packet header is not valid".to_string()));
        }
        Ok(())
    }

    pub fn validate_body(&self) -> Result<()> {
        let actual = (self.header.len() + self.body.len()) as u32;
        if self.indicated_length() != actual {
            return Err(Error::Protocol("received packet with invalid body".to_string()));
        }
        Ok(())
    }

    /// Body bytes without the trailing `\x00`. The `\n` immediately
    /// before it is left in place; `Payload::from_bytes` skips the
    /// resulting empty line.
    pub fn data(&self) -> &[u8] {
        match self.body.last() {
            Some(0) => &self.body[..self.body.len() - 1],
            _ => &self.body,
        }
    }

    /// Reassembles a packet from raw header/body bytes read off the wire.
    pub fn from_parts(header: [u8; HEADER_LENGTH], body: Vec<u8>) -> Self {
        FeslPacket { header, body }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header.len() + self.body.len());
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.body);
        out
    }
}

/// A complete Theater packet. Unlike FESL, the transaction id lives in the
/// body, not the header, so `set_tid` rewrites the body tail.
#[derive(Debug, Clone, PartialEq)]
pub struct TheaterPacket {
    pub header: [u8; HEADER_LENGTH],
    pub body: Vec<u8>,
}

impl TheaterPacket {
    pub fn build(
        tag: &[u8; 4],
        body: Body<'_>,
        transmission_type: TheaterTransmissionType,
        tid: Option<u32>,
    ) -> Self {
        let mut header = [0u8; HEADER_LENGTH];
        header[0..4].copy_from_slice(tag);

        let mut body = body.into_bytes();
        body.extend_from_slice(b"\n\x00");

        let mut packet = TheaterPacket { header, body };
        if let Some(tid) = tid {
            packet.set_tid(tid);
        }
        packet.set_transmission_type(transmission_type);
        packet.set_length_indicators();
        packet
    }

    /// Strips the `\n\x00` tail, appends `\nTID=<n>\n\x00`, then recomputes
    /// the length indicator.
    pub fn set_tid(&mut self, tid: u32) {
        self.body.truncate(self.body.len().saturating_sub(2));
        self.body.extend_from_slice(b"\nTID=");
        self.body.extend_from_slice(tid.to_string().as_bytes());
        self.body.extend_from_slice(b"\n\x00");
        self.set_length_indicators();
    }

    /// Scans body lines for one containing `TID=`; returns 0 if absent or
    /// non-numeric (matching the ground-truth client's leniency, since
    /// Theater ping packets carry no tid at all).
    pub fn tid(&self) -> u32 {
        for line in self.data().split(|&b| b == b'\n') {
            if let Some(pos) = find_subslice(line, b"TID=") {
                let digits = &line[pos + 4..];
                if !digits.is_empty() && digits.iter().all(|b| b.is_ascii_digit()) {
                    if let Ok(s) = std::str::from_utf8(digits) {
                        if let Ok(n) = s.parse() {
                            return n;
                        }
                    }
                }
                return 0;
            }
        }
        0
    }

    pub fn set_transmission_type(&mut self, ty: TheaterTransmissionType) {
        match ty {
            TheaterTransmissionType::Request => self.header[4..8].copy_from_slice(b"@\x00\x00\x00"),
            TheaterTransmissionType::OkResponse => self.header[4..8].copy_from_slice(b"\x00\x00\x00\x00"),
            // Error responses are only ever observed, never constructed locally.
            TheaterTransmissionType::ErrorResponse(tag) => self.header[4..8].copy_from_slice(&tag),
        }
    }

    pub fn transmission_type(&self) -> Result<TheaterTransmissionType> {
        let discrim: [u8; 4] = self.header[4..8].try_into().unwrap();
        if discrim == *b"@\x00\x00\x00" {
            Ok(TheaterTransmissionType::Request)
        } else if discrim == [0, 0, 0, 0] {
            Ok(TheaterTransmissionType::OkResponse)
        } else if THEATER_ERROR_TAGS.contains(&&discrim) {
            Ok(TheaterTransmissionType::ErrorResponse(discrim))
        } else {
            Err(Error::Protocol(format!(
                "unknown Theater transmission type {discrim:?}"
            )))
        }
    }

    fn set_length_indicators(&mut self) {
        let len = (self.header.len() + self.body.len()) as u32;
        self.header[8..12].copy_from_slice(&len.to_be_bytes());
    }

    pub fn indicated_length(&self) -> u32 {
        be_to_int(&self.header[8..12])
    }

    pub fn validate_header(&self) -> Result<()> {
        if self.indicated_length() == 0 {
            return Err(Error::Protocol("packet header is not valid".to_string()));
        }
        let tag: &[u8; 4] = self.header[0..4].try_into().unwrap();
        let tag_ok = THEATER_TAGS.contains(&tag);
        let discrim: [u8; 4] = self.header[4..8].try_into().unwrap();
        let tx_ok = discrim == *b"@\x00\x00\x00"
            || discrim == [0, 0, 0, 0]
            || THEATER_ERROR_TAGS.contains(&&discrim);
        if !tag_ok || !tx_ok {
            return Err(Error::Protocol("packet header is not valid".to_string()));
        }
        Ok(())
    }

    pub fn validate_body(&self) -> Result<()> {
        let actual = (self.header.len() + self.body.len()) as u32;
        if self.indicated_length() != actual {
            return Err(Error::Protocol("received packet with invalid body".to_string()));
        }
        Ok(())
    }

    pub fn data(&self) -> &[u8] {
        match self.body.last() {
            Some(0) => &self.body[..self.body.len() - 1],
            _ => &self.body,
        }
    }

    pub fn from_parts(header: [u8; HEADER_LENGTH], body: Vec<u8>) -> Self {
        TheaterPacket { header, body }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header.len() + self.body.len());
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.body);
        out
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Payload;

    #[test]
    fn fesl_build_sets_length_and_tid() {
        let mut payload = Payload::new();
        payload.insert("TXN", "MemCheck");
        let packet = FeslPacket::build(
            b"fsys",
            Body::Payload(&payload),
            FeslTransmissionType::SinglePacketRequest,
            Some(5),
        );
        assert_eq!(packet.tid(), 5);
        assert_eq!(packet.header[4], 0xC0);
        assert_eq!(
            packet.indicated_length() as usize,
            packet.header.len() + packet.body.len()
        );
        assert!(packet.body.ends_with(b"\n\x00"));
        packet.validate_header().unwrap();
        packet.validate_body().unwrap();
    }

    #[test]
    fn fesl_tid_round_trips_24_bit() {
        let mut packet = FeslPacket::build(b"rank", Body::Raw(b"TXN=GetStats"), FeslTransmissionType::SinglePacketRequest, None);
        packet.set_tid(0xFFFFFF);
        assert_eq!(packet.tid(), 0xFFFFFF);
    }

    #[test]
    fn theater_set_tid_rewrites_body_tail() {
        let mut packet = TheaterPacket::build(
            b"CONN",
            Body::Raw(b"PROT=2"),
            TheaterTransmissionType::Request,
            None,
        );
        packet.set_tid(42);
        assert_eq!(packet.tid(), 42);
        assert!(packet.body.ends_with(b"\n\x00"));
        assert_eq!(
            packet.indicated_length() as usize,
            packet.header.len() + packet.body.len()
        );
    }

    #[test]
    fn theater_ping_has_no_tid() {
        let packet = TheaterPacket::build(b"PING", Body::Raw(b""), TheaterTransmissionType::OkResponse, None);
        assert_eq!(packet.tid(), 0);
    }

    #[test]
    fn theater_error_header_is_valid_but_flagged() {
        let mut packet = TheaterPacket::build(b"GDAT", Body::Raw(b"UID=1"), TheaterTransmissionType::Request, Some(1));
        packet.set_transmission_type(TheaterTransmissionType::ErrorResponse(*b"ntfn"));
        packet.set_length_indicators();
        packet.validate_header().unwrap();
        assert_eq!(
            packet.transmission_type().unwrap(),
            TheaterTransmissionType::ErrorResponse(*b"ntfn")
        );
    }

    #[test]
    fn invalid_tag_rejected() {
        let packet = FeslPacket::build(b"xxxx", Body::Raw(b""), FeslTransmissionType::Ping, None);
        assert!(packet.validate_header().is_err());
    }

    #[test]
    fn zero_length_header_rejected() {
        let packet = FeslPacket {
            header: [0u8; HEADER_LENGTH],
            body: Vec::new(),
        };
        assert!(packet.validate_header().is_err());
    }
}
