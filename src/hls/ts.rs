//! Minimal MPEG-TS muxer
//!
//! One program, a PAT/PMT pair at the start of every segment, video on
//! PID 0x100 carrying the PCR, optional MPEG audio on PID 0x101.

use std::time::Duration;

use bytes::{BufMut, BytesMut};

pub const TS_PACKET_SIZE: usize = 188;
const TS_PAYLOAD_SIZE: usize = 184;

const PAT_PID: u16 = 0x0000;
const PMT_PID: u16 = 0x1000;
pub const VIDEO_PID: u16 = 0x0100;
pub const AUDIO_PID: u16 = 0x0101;

/// Presentation delay ahead of the PCR, in 90 kHz ticks
const PTS_OFFSET: u64 = 9_000;

/// Elementary stream types the muxer can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    H264,
    H265,
    MpegAudio,
}

impl StreamType {
    pub fn code(self) -> u8 {
        match self {
            StreamType::H264 => 0x1b,
            StreamType::H265 => 0x24,
            StreamType::MpegAudio => 0x03,
        }
    }

    fn stream_id(self) -> u8 {
        match self {
            StreamType::MpegAudio => 0xc0,
            _ => 0xe0,
        }
    }
}

/// CRC-32/MPEG-2 as used by PSI sections
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc = 0xffff_ffffu32;
    for &byte in data {
        crc ^= u32::from(byte) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04c1_1db7
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn ticks_90k(ts: Duration) -> u64 {
    (ts.as_micros() as u64 * 9 / 100) & 0x1_ffff_ffff
}

fn put_timestamp(out: &mut BytesMut, prefix: u8, ts: u64) {
    out.put_u8(prefix | (((ts >> 29) as u8) & 0x0e) | 0x01);
    out.put_u8((ts >> 22) as u8);
    out.put_u8((((ts >> 14) as u8) & 0xfe) | 0x01);
    out.put_u8((ts >> 7) as u8);
    out.put_u8((((ts << 1) as u8) & 0xfe) | 0x01);
}

#[derive(Debug, Clone)]
pub struct TsMuxer {
    video: StreamType,
    audio: Option<StreamType>,
    cc_pat: u8,
    cc_pmt: u8,
    cc_video: u8,
    cc_audio: u8,
}

impl TsMuxer {
    pub fn new(video: StreamType, audio: Option<StreamType>) -> Self {
        Self {
            video,
            audio,
            cc_pat: 0,
            cc_pmt: 0,
            cc_video: 0,
            cc_audio: 0,
        }
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// PAT and PMT
    pub fn write_tables(&mut self, out: &mut BytesMut) {
        let mut pat = BytesMut::with_capacity(16);
        pat.put_u8(0x00);
        pat.put_u16(0xb000 | 13);
        pat.put_u16(0x0001);
        pat.put_u8(0xc1);
        pat.put_u8(0);
        pat.put_u8(0);
        pat.put_u16(0x0001);
        pat.put_u16(0xe000 | PMT_PID);
        let crc = crc32_mpeg2(&pat);
        pat.put_u32(crc);
        write_section(out, PAT_PID, &mut self.cc_pat, &pat);

        let streams: Vec<(StreamType, u16)> = std::iter::once((self.video, VIDEO_PID))
            .chain(self.audio.map(|audio| (audio, AUDIO_PID)))
            .collect();
        let mut pmt = BytesMut::with_capacity(32);
        pmt.put_u8(0x02);
        pmt.put_u16(0xb000 | (13 + 5 * streams.len() as u16));
        pmt.put_u16(0x0001);
        pmt.put_u8(0xc1);
        pmt.put_u8(0);
        pmt.put_u8(0);
        pmt.put_u16(0xe000 | VIDEO_PID);
        pmt.put_u16(0xf000);
        for (kind, pid) in streams {
            pmt.put_u8(kind.code());
            pmt.put_u16(0xe000 | pid);
            pmt.put_u16(0xf000);
        }
        let crc = crc32_mpeg2(&pmt);
        pmt.put_u32(crc);
        write_section(out, PMT_PID, &mut self.cc_pmt, &pmt);
    }

    /// One access unit as a PES; every video PES carries the PCR
    pub fn write_video(&mut self, out: &mut BytesMut, data: &[u8], pts: Duration, key_frame: bool) {
        let clock = ticks_90k(pts);
        let pes = pes_packet(self.video.stream_id(), data, clock + PTS_OFFSET, false);
        write_pes(
            out,
            VIDEO_PID,
            &mut self.cc_video,
            &pes,
            Some(clock),
            key_frame,
        );
    }

    pub fn write_audio(&mut self, out: &mut BytesMut, data: &[u8], pts: Duration) {
        let Some(audio) = self.audio else {
            return;
        };
        let pes = pes_packet(audio.stream_id(), data, ticks_90k(pts) + PTS_OFFSET, true);
        write_pes(out, AUDIO_PID, &mut self.cc_audio, &pes, None, false);
    }
}

fn pes_packet(stream_id: u8, data: &[u8], pts: u64, bounded: bool) -> BytesMut {
    let mut pes = BytesMut::with_capacity(14 + data.len());
    pes.put_slice(&[0x00, 0x00, 0x01, stream_id]);
    let length = 8 + data.len();
    // Video PES may be unbounded
    if bounded && length <= u16::MAX as usize {
        pes.put_u16(length as u16);
    } else {
        pes.put_u16(0);
    }
    pes.put_u8(0x80);
    pes.put_u8(0x80);
    pes.put_u8(5);
    put_timestamp(&mut pes, 0x20, pts & 0x1_ffff_ffff);
    pes.put_slice(data);
    pes
}

fn write_section(out: &mut BytesMut, pid: u16, cc: &mut u8, section: &[u8]) {
    out.put_u8(0x47);
    out.put_u16(0x4000 | pid);
    out.put_u8(0x10 | *cc);
    *cc = (*cc + 1) & 0x0f;
    out.put_u8(0);
    out.put_slice(section);
    let used = 5 + section.len();
    out.put_bytes(0xff, TS_PACKET_SIZE.saturating_sub(used));
}

fn write_pes(
    out: &mut BytesMut,
    pid: u16,
    cc: &mut u8,
    pes: &[u8],
    pcr: Option<u64>,
    random_access: bool,
) {
    let mut pos = 0;
    let mut first = true;
    while pos < pes.len() {
        let mut af = BytesMut::new();
        if first && (pcr.is_some() || random_access) {
            let mut flags = 0u8;
            if random_access {
                flags |= 0x40;
            }
            if pcr.is_some() {
                flags |= 0x10;
            }
            af.put_u8(flags);
            if let Some(pcr) = pcr {
                af.put_u32((pcr >> 1) as u32);
                af.put_u8((((pcr & 1) as u8) << 7) | 0x7e);
                af.put_u8(0);
            }
        }

        let mut af_total = if af.is_empty() { 0 } else { 1 + af.len() };
        let room = TS_PAYLOAD_SIZE - af_total;
        let take = room.min(pes.len() - pos);
        if take < room {
            let stuffing = room - take;
            if af_total == 0 {
                if stuffing > 1 {
                    af.put_u8(0);
                    af.put_bytes(0xff, stuffing - 2);
                }
                af_total = stuffing;
            } else {
                af.put_bytes(0xff, stuffing);
                af_total += stuffing;
            }
        }

        out.put_u8(0x47);
        out.put_u16(if first { 0x4000 } else { 0 } | pid);
        let control = if af_total > 0 { 0x30 } else { 0x10 };
        out.put_u8(control | *cc);
        *cc = (*cc + 1) & 0x0f;
        if af_total > 0 {
            out.put_u8((af_total - 1) as u8);
            out.put_slice(&af);
        }
        out.put_slice(&pes[pos..pos + take]);

        pos += take;
        first = false;
    }
}
