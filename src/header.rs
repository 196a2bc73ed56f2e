//! Wire formats for BCP frames.
//!
//! All fields are little-endian and packed; no padding, no alignment
//! requirements, matching the C source's `struct __attribute__((packed))`
//! layouts.

use byteorder::{ByteOrder, LittleEndian};

use crate::address::NodeAddr;

bitflags::bitflags! {
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct ChannelAttributes: u8 {
        const NONE = 0b0000_0000;
        const DATA = 0b0000_0001;
        const BEACON = 0b0000_0010;
        const BEACON_REQUEST = 0b0000_0100;
        const ACK = 0b0000_1000;
        const HOP_COUNTER = 0b0001_0000;
    }
}

/// Packet-type attribute carried alongside every frame.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    Beacon = 5,
    BeaconRequest = 6,
    Ack = 7,
    HopCounter = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeError;

/// `{ queuelog: u16 }`, used for both `beacon` and `beacon_request`.
#[derive(Clone, Copy, PartialEq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BeaconHeader {
    pub queuelog: u16,
}

impl BeaconHeader {
    pub const LEN: usize = 2;

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u16(&mut buf[0..2], self.queuelog);
        Self::LEN
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, usize), DecodeError> {
        if buf.len() < Self::LEN {
            return Err(DecodeError);
        }
        Ok((
            Self {
                queuelog: LittleEndian::read_u16(&buf[0..2]),
            },
            Self::LEN,
        ))
    }
}

/// `{ hop_count: u16 }`.
#[derive(Clone, Copy, PartialEq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HopCounterHeader {
    pub hop_count: u16,
}

impl HopCounterHeader {
    pub const LEN: usize = 2;

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u16(&mut buf[0..2], self.hop_count);
        Self::LEN
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, usize), DecodeError> {
        if buf.len() < Self::LEN {
            return Err(DecodeError);
        }
        Ok((
            Self {
                hop_count: LittleEndian::read_u16(&buf[0..2]),
            },
            Self::LEN,
        ))
    }
}

/// Data-frame header, with the fusion extension's optional fields.
///
/// `packet_length` is the wire length of header + payload, recorded by
/// the sender so a receiver without prior knowledge of the build variant
/// can still size its read.
#[derive(Clone, Copy, PartialEq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DataHeader {
    pub origin: NodeAddr,
    pub packet_length: u16,
    pub bcp_backpressure: u16,
    pub delay: u32,
    pub last_process_time: u32,
    pub fusion: Option<FusionFields>,
}

#[derive(Clone, Copy, PartialEq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FusionFields {
    pub fused: bool,
    pub cid: u16,
}

impl DataHeader {
    pub const BASE_LEN: usize = 2 + 2 + 2 + 4 + 4;
    pub const FUSION_LEN: usize = Self::BASE_LEN + 1 + 2;

    pub fn wire_len(&self) -> usize {
        if self.fusion.is_some() {
            Self::FUSION_LEN
        } else {
            Self::BASE_LEN
        }
    }

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u16(&mut buf[0..2], self.origin.0);
        LittleEndian::write_u16(&mut buf[2..4], self.packet_length);
        LittleEndian::write_u16(&mut buf[4..6], self.bcp_backpressure);
        LittleEndian::write_u32(&mut buf[6..10], self.delay);
        LittleEndian::write_u32(&mut buf[10..14], self.last_process_time);

        if let Some(f) = &self.fusion {
            buf[14] = f.fused as u8;
            LittleEndian::write_u16(&mut buf[15..17], f.cid);
            Self::FUSION_LEN
        } else {
            Self::BASE_LEN
        }
    }

    pub fn decode(buf: &[u8], has_fusion: bool) -> Result<(Self, usize), DecodeError> {
        if buf.len() < Self::BASE_LEN {
            return Err(DecodeError);
        }

        let origin = NodeAddr(LittleEndian::read_u16(&buf[0..2]));
        let packet_length = LittleEndian::read_u16(&buf[2..4]);
        let bcp_backpressure = LittleEndian::read_u16(&buf[4..6]);
        let delay = LittleEndian::read_u32(&buf[6..10]);
        let last_process_time = LittleEndian::read_u32(&buf[10..14]);

        if !has_fusion {
            return Ok((
                Self {
                    origin,
                    packet_length,
                    bcp_backpressure,
                    delay,
                    last_process_time,
                    fusion: None,
                },
                Self::BASE_LEN,
            ));
        }

        if buf.len() < Self::FUSION_LEN {
            return Err(DecodeError);
        }

        let fused = buf[14] != 0;
        let cid = LittleEndian::read_u16(&buf[15..17]);

        Ok((
            Self {
                origin,
                packet_length,
                bcp_backpressure,
                delay,
                last_process_time,
                fusion: Some(FusionFields { fused, cid }),
            },
            Self::FUSION_LEN,
        ))
    }
}

#[cfg(test)]
mod test {
    extern crate std;

    use super::*;

    #[test]
    fn beacon_round_trip() {
        let h = BeaconHeader { queuelog: 42 };
        let mut buf = [0u8; 2];
        assert_eq!(h.encode(&mut buf), 2);
        let (decoded, len) = BeaconHeader::decode(&buf).unwrap();
        assert_eq!(len, 2);
        assert_eq!(decoded, h);
    }

    #[test]
    fn data_header_round_trip_without_fusion() {
        let h = DataHeader {
            origin: NodeAddr(7),
            packet_length: 20,
            bcp_backpressure: 3,
            delay: 1000,
            last_process_time: 500,
            fusion: None,
        };
        let mut buf = [0u8; DataHeader::FUSION_LEN];
        let n = h.encode(&mut buf);
        assert_eq!(n, DataHeader::BASE_LEN);
        let (decoded, used) = DataHeader::decode(&buf, false).unwrap();
        assert_eq!(used, DataHeader::BASE_LEN);
        assert_eq!(decoded, h);
    }

    #[test]
    fn data_header_round_trip_with_fusion() {
        let h = DataHeader {
            origin: NodeAddr::FUSION_ORIGIN,
            packet_length: 25,
            bcp_backpressure: 0,
            delay: 1500,
            last_process_time: 900,
            fusion: Some(FusionFields { fused: true, cid: 3 }),
        };
        let mut buf = [0u8; DataHeader::FUSION_LEN];
        let n = h.encode(&mut buf);
        assert_eq!(n, DataHeader::FUSION_LEN);
        let (decoded, used) = DataHeader::decode(&buf, true).unwrap();
        assert_eq!(used, DataHeader::FUSION_LEN);
        assert_eq!(decoded, h);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let buf = [0u8; 1];
        assert!(BeaconHeader::decode(&buf).is_err());
    }
}
