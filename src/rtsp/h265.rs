//! H.265 RTP payloader (RFC 7798)
//!
//! ```text
//! NAL unit header          FU packet header
//! +-------+-------+        +-------+-------+-------+
//! |F| Type|LId|TID|        |F|T=49 |LId|TID|S|E|Ty |
//! +-------+-------+        +-------+-------+-------+
//! ```
//!
//! Parameter sets are held back and sent as one aggregation packet (type
//! 48) in front of the next picture; pictures larger than the MTU are split
//! into fragmentation units (type 49).

use bytes::{BufMut, Bytes, BytesMut};

use crate::stream::framing::{h265_nal_type, split_annexb_nal_units};
use crate::stream::ParameterSets;

const NAL_VPS: u8 = 32;
const NAL_SPS: u8 = 33;
const NAL_PPS: u8 = 34;
const NAL_AUD: u8 = 35;
const NAL_FILLER: u8 = 38;
const NAL_FU: u8 = 49;

const NAL_HEADER_SIZE: usize = 2;
const FU_HEADER_SIZE: usize = 1;

/// PayloadHdr of an aggregation packet: type 48, layer 0, TID 1
const AP_PAYLOAD_HDR: [u8; 2] = [0x60, 0x01];

#[derive(Debug, Default, Clone)]
pub struct H265Payloader {
    pending: ParameterSets,
}

impl H265Payloader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split one Annex B access unit into RTP payloads. Input without a
    /// start code is treated as a single NAL unit.
    pub fn payload(&mut self, mtu: usize, access_unit: &Bytes) -> Vec<Bytes> {
        let mut payloads = Vec::new();
        if access_unit.is_empty() || mtu <= NAL_HEADER_SIZE + FU_HEADER_SIZE {
            return payloads;
        }

        let nals = split_annexb_nal_units(access_unit);
        if nals.is_empty() {
            self.emit(access_unit.clone(), mtu, &mut payloads);
        } else {
            for nal in nals {
                self.emit(access_unit.slice_ref(nal), mtu, &mut payloads);
            }
        }
        payloads
    }

    fn emit(&mut self, nal: Bytes, mtu: usize, payloads: &mut Vec<Bytes>) {
        if nal.len() < NAL_HEADER_SIZE {
            return;
        }

        match h265_nal_type(&nal).unwrap_or_default() {
            NAL_AUD | NAL_FILLER => return,
            NAL_VPS => {
                self.pending.vps = Some(nal);
                return;
            }
            NAL_SPS => {
                self.pending.sps = Some(nal);
                return;
            }
            NAL_PPS => {
                self.pending.pps = Some(nal);
                return;
            }
            _ => {}
        }

        self.flush_parameter_sets(mtu, payloads);

        if nal.len() <= mtu {
            payloads.push(nal);
        } else {
            fragment(&nal, mtu, payloads);
        }
    }

    /// Send held-back parameter sets, aggregated when they fit one packet
    fn flush_parameter_sets(&mut self, mtu: usize, payloads: &mut Vec<Bytes>) {
        let pending = std::mem::take(&mut self.pending);
        let sets: Vec<Bytes> = [pending.vps, pending.sps, pending.pps]
            .into_iter()
            .flatten()
            .collect();
        if sets.is_empty() {
            return;
        }

        let aggregated = NAL_HEADER_SIZE + sets.iter().map(|nal| 2 + nal.len()).sum::<usize>();
        if sets.len() == 1 || aggregated > mtu {
            for nal in sets {
                if nal.len() <= mtu {
                    payloads.push(nal);
                } else {
                    fragment(&nal, mtu, payloads);
                }
            }
            return;
        }

        let mut ap = BytesMut::with_capacity(aggregated);
        ap.extend_from_slice(&AP_PAYLOAD_HDR);
        for nal in sets {
            ap.put_u16(nal.len() as u16);
            ap.extend_from_slice(&nal);
        }
        payloads.push(ap.freeze());
    }
}

/// FU packets for one NAL unit. F and the layer MSB are kept from the
/// original header, the second header byte is copied unchanged.
fn fragment(nal: &[u8], mtu: usize, payloads: &mut Vec<Bytes>) {
    let nal_type = (nal[0] >> 1) & 0x3f;
    let body = &nal[NAL_HEADER_SIZE..];
    let max_fragment = mtu - NAL_HEADER_SIZE - FU_HEADER_SIZE;

    let mut chunks = body.chunks(max_fragment).peekable();
    let mut first = true;
    while let Some(chunk) = chunks.next() {
        let mut fu_header = nal_type;
        if first {
            fu_header |= 0x80;
        }
        if chunks.peek().is_none() {
            fu_header |= 0x40;
        }
        first = false;

        let mut packet = BytesMut::with_capacity(NAL_HEADER_SIZE + FU_HEADER_SIZE + chunk.len());
        packet.put_u8((nal[0] & 0b1000_0001) | (NAL_FU << 1));
        packet.put_u8(nal[1]);
        packet.put_u8(fu_header);
        packet.put_slice(chunk);
        payloads.push(packet.freeze());
    }
}
