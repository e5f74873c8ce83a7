//! JPEG RTP payloader (RFC 2435)
//!
//! Baseline 4:2:2 and 4:2:0 frames are sent with in-band quantization
//! tables (Q = 255); the receiver rebuilds the JFIF headers itself, so only
//! the entropy-coded scan travels.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

const MAIN_HEADER_SIZE: usize = 8;
const QUANT_HEADER_SIZE: usize = 4;

const MARKER_SOF0: u8 = 0xc0;
const MARKER_SOF1: u8 = 0xc1;
const MARKER_DQT: u8 = 0xdb;
const MARKER_DRI: u8 = 0xdd;
const MARKER_SOS: u8 = 0xda;
const MARKER_EOI: u8 = 0xd9;

/// What the RTP headers need from one JFIF frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JpegHeader {
    /// RFC 2435 type: 0 for 4:2:2, 1 for 4:2:0; +64 with restart markers
    pub kind: u8,
    /// Width in 8-pixel blocks
    pub width8: u8,
    /// Height in 8-pixel blocks
    pub height8: u8,
    /// Bit i set when table i is 16-bit
    pub precision: u8,
    pub tables: Vec<u8>,
    pub restart_interval: u16,
    /// Byte range of the entropy-coded scan
    pub scan: std::ops::Range<usize>,
}

/// Walk the marker segments up to the start of scan
pub fn parse_jpeg(data: &[u8]) -> Option<JpegHeader> {
    if data.len() < 4 || data[0] != 0xff || data[1] != 0xd8 {
        return None;
    }

    let mut kind = None;
    let mut width8 = 0;
    let mut height8 = 0;
    let mut precision = 0u8;
    let mut tables = Vec::new();
    let mut table_count = 0;
    let mut restart_interval = 0;

    let mut pos = 2;
    while pos + 4 <= data.len() {
        if data[pos] != 0xff {
            return None;
        }
        let marker = data[pos + 1];
        if marker == 0xff {
            pos += 1;
            continue;
        }
        let len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        let body_start = pos + 4;
        let body_end = pos + 2 + len;
        if len < 2 || body_end > data.len() {
            return None;
        }
        let body = &data[body_start..body_end];

        match marker {
            MARKER_DQT => {
                let mut i = 0;
                while i < body.len() {
                    let wide = body[i] >> 4 != 0;
                    let size = if wide { 128 } else { 64 };
                    let table = body.get(i + 1..i + 1 + size)?;
                    if wide && table_count < 8 {
                        precision |= 1 << table_count;
                    }
                    tables.extend_from_slice(table);
                    table_count += 1;
                    i += 1 + size;
                }
            }
            MARKER_SOF0 | MARKER_SOF1 => {
                if body.len() < 9 {
                    return None;
                }
                let height = u16::from_be_bytes([body[1], body[2]]);
                let width = u16::from_be_bytes([body[3], body[4]]);
                if width == 0 || height == 0 || width > 2040 || height > 2040 {
                    return None;
                }
                width8 = width.div_ceil(8) as u8;
                height8 = height.div_ceil(8) as u8;
                // sampling factors of the luma component
                kind = match body[7] {
                    0x21 => Some(0),
                    0x22 => Some(1),
                    other => {
                        debug!("Unsupported JPEG sampling {:#04x}", other);
                        return None;
                    }
                };
            }
            MARKER_DRI => {
                if body.len() >= 2 {
                    restart_interval = u16::from_be_bytes([body[0], body[1]]);
                }
            }
            MARKER_SOS => {
                let mut end = data.len();
                if end >= body_end + 2 && data[end - 2] == 0xff && data[end - 1] == MARKER_EOI {
                    end -= 2;
                }
                let mut kind = kind?;
                if restart_interval > 0 {
                    kind += 64;
                }
                if tables.is_empty() {
                    return None;
                }
                return Some(JpegHeader {
                    kind,
                    width8,
                    height8,
                    precision,
                    tables,
                    restart_interval,
                    scan: body_end..end,
                });
            }
            _ => {}
        }
        pos = body_end;
    }
    None
}

#[derive(Debug, Default, Clone)]
pub struct JpegPayloader;

impl JpegPayloader {
    /// RTP payloads for one JFIF frame; empty when the frame cannot be sent
    /// as RFC 2435 (progressive, odd sampling, no quantization tables)
    pub fn payload(&mut self, mtu: usize, frame: &Bytes) -> Vec<Bytes> {
        let Some(header) = parse_jpeg(frame) else {
            debug!("Dropping JPEG frame of {} bytes", frame.len());
            return Vec::new();
        };

        let scan = &frame[header.scan.clone()];
        let mut payloads = Vec::new();
        let mut offset = 0usize;
        while offset < scan.len() {
            let mut packet = BytesMut::with_capacity(mtu);
            packet.put_u8(0);
            packet.put_uint(offset as u64, 3);
            packet.put_u8(header.kind);
            packet.put_u8(255);
            packet.put_u8(header.width8);
            packet.put_u8(header.height8);
            if header.restart_interval > 0 {
                packet.put_u16(header.restart_interval);
                // first and last bits set, restart count 0x3fff
                packet.put_u16(0xffff);
            }
            if offset == 0 {
                packet.put_u8(0);
                packet.put_u8(header.precision);
                packet.put_u16(header.tables.len() as u16);
                packet.put_slice(&header.tables);
            }

            let room = mtu.saturating_sub(packet.len());
            if room == 0 {
                return Vec::new();
            }
            let take = room.min(scan.len() - offset);
            packet.put_slice(&scan[offset..offset + take]);
            payloads.push(packet.freeze());
            offset += take;
        }
        payloads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal baseline JFIF: 64x48, 4:2:0, two 8-bit tables
    fn sample_jpeg(scan_len: usize, restart: bool) -> Bytes {
        let mut out = BytesMut::new();
        out.put_slice(&[0xff, 0xd8]);

        out.put_slice(&[0xff, MARKER_DQT]);
        out.put_u16(2 + 2 * 65);
        out.put_u8(0x00);
        out.put_slice(&[1u8; 64]);
        out.put_u8(0x01);
        out.put_slice(&[2u8; 64]);

        out.put_slice(&[0xff, MARKER_SOF0]);
        out.put_u16(17);
        out.put_u8(8);
        out.put_u16(48);
        out.put_u16(64);
        out.put_u8(3);
        out.put_slice(&[1, 0x22, 0, 2, 0x11, 1, 3, 0x11, 1]);

        if restart {
            out.put_slice(&[0xff, MARKER_DRI, 0, 4, 0, 8]);
        }

        out.put_slice(&[0xff, MARKER_SOS]);
        out.put_u16(12);
        out.put_slice(&[3, 1, 0, 2, 0x11, 3, 0x11, 0, 63, 0]);
        out.put_slice(&vec![0x5a; scan_len]);
        out.put_slice(&[0xff, MARKER_EOI]);
        out.freeze()
    }

    #[test]
    fn headers_are_parsed() {
        let frame = sample_jpeg(100, false);
        let header = parse_jpeg(&frame).unwrap();
        assert_eq!(header.kind, 1);
        assert_eq!(header.width8, 8);
        assert_eq!(header.height8, 6);
        assert_eq!(header.tables.len(), 128);
        assert_eq!(header.precision, 0);
        assert_eq!(header.scan.len(), 100);
    }

    #[test]
    fn first_packet_carries_tables_and_offsets_advance() {
        let frame = sample_jpeg(3000, false);
        let mut payloader = JpegPayloader;
        let payloads = payloader.payload(1200, &frame);
        assert!(payloads.len() >= 3);

        let first = &payloads[0];
        assert_eq!(&first[1..4], &[0, 0, 0]);
        assert_eq!(first[4], 1);
        assert_eq!(first[5], 255);
        assert_eq!(u16::from_be_bytes([first[10], first[11]]), 128);

        let mut expected_offset = first.len() - MAIN_HEADER_SIZE - QUANT_HEADER_SIZE - 128;
        for packet in &payloads[1..] {
            let offset = u32::from_be_bytes([0, packet[1], packet[2], packet[3]]) as usize;
            assert_eq!(offset, expected_offset);
            expected_offset += packet.len() - MAIN_HEADER_SIZE;
            assert!(packet.len() <= 1200);
        }
        assert_eq!(expected_offset, 3000);
    }

    #[test]
    fn restart_interval_adds_restart_header() {
        let frame = sample_jpeg(50, true);
        let payloads = JpegPayloader.payload(1200, &frame);
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0][4], 65);
        assert_eq!(u16::from_be_bytes([payloads[0][8], payloads[0][9]]), 8);
    }

    #[test]
    fn non_jpeg_input_is_dropped() {
        assert!(JpegPayloader.payload(1200, &Bytes::from_static(b"not a jpeg")).is_empty());
    }
}
