//! RTP payload formats and per-track packet state

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use rtp::codecs::h264::H264Payloader;
use rtp::codecs::vp8::Vp8Payloader;
use rtp::codecs::vp9::Vp9Payloader;
use rtp::packet::Packet;
use rtp::packetizer::Payloader;
use webrtc::util::Marshal;

use super::h265::H265Payloader;
use super::jpeg::JpegPayloader;
use crate::error::{AppError, Result};
use crate::stream::{MediaFrame, MediaKind, StreamInfo};

/// Largest RTP payload handed to the network
pub const RTP_MTU: usize = 1200;

/// First dynamic payload type; track `n` gets `96 + n`
pub const DYNAMIC_PAYLOAD_BASE: u8 = 96;

/// MPEG audio (RFC 2250) is clocked at 90 kHz whatever the sample rate
const MPA_CLOCK_RATE: u32 = 90_000;

/// Payload type and `a=rtpmap` data of one track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpDescriptor {
    pub payload_type: u8,
    pub encoding: String,
    pub clock_rate: u32,
    /// Audio channel count, only advertised for audio
    pub channels: Option<u32>,
}

impl RtpDescriptor {
    /// Static payload types where RFC 3551 assigns one, dynamic otherwise
    pub fn for_stream(info: &StreamInfo, track: usize) -> Self {
        let dynamic = DYNAMIC_PAYLOAD_BASE.saturating_add(track as u8);
        let channels = (info.media == MediaKind::Audio).then_some(info.channels);
        let encoding = info.encoding_name();

        let (payload_type, encoding, clock_rate) = match (encoding, info.clock_rate, info.channels)
        {
            ("JPEG", _, _) => (26, "JPEG", info.clock_rate),
            ("PCMU", 8000, 1) => (0, "PCMU", 8000),
            ("PCMA", 8000, 1) => (8, "PCMA", 8000),
            ("L16", 44100, 2) => (10, "L16", 44100),
            ("L16", 44100, 1) => (11, "L16", 44100),
            ("MPEG", _, _) => (14, "MPA", MPA_CLOCK_RATE),
            (name, rate, _) => (dynamic, name, rate),
        };

        Self {
            payload_type,
            encoding: encoding.to_string(),
            clock_rate,
            channels: if encoding == "MPA" { None } else { channels },
        }
    }

    /// Value of the `a=rtpmap` attribute
    pub fn rtpmap(&self) -> String {
        match self.channels {
            Some(channels) => format!(
                "{} {}/{}/{}",
                self.payload_type, self.encoding, self.clock_rate, channels
            ),
            None => format!("{} {}/{}", self.payload_type, self.encoding, self.clock_rate),
        }
    }
}

/// Splits frames into RTP payloads for one encoding
pub enum Packetizer {
    H264(H264Payloader),
    H265(H265Payloader),
    Jpeg(JpegPayloader),
    Vp8(Vp8Payloader),
    Vp9(Vp9Payloader),
    /// MPEG audio with the RFC 2250 fragment-offset header
    Mpa,
    /// MTU-sized chunks, samples byte-swapped to network order when set
    Raw { swap_width: Option<usize> },
}

impl Packetizer {
    pub fn for_stream(info: &StreamInfo) -> Self {
        match info.encoding_name() {
            "H264" => Packetizer::H264(H264Payloader::default()),
            "H265" => Packetizer::H265(H265Payloader::new()),
            "JPEG" => Packetizer::Jpeg(JpegPayloader),
            "VP8" => Packetizer::Vp8(Vp8Payloader::default()),
            "VP9" => Packetizer::Vp9(Vp9Payloader::default()),
            "MPEG" => Packetizer::Mpa,
            _ => Packetizer::Raw {
                swap_width: info.pcm_swap_width,
            },
        }
    }

    pub fn packetize(&mut self, mtu: usize, frame: &Bytes) -> Result<Vec<Bytes>> {
        let payloads = match self {
            Packetizer::H264(p) => p
                .payload(mtu, frame)
                .map_err(|e| AppError::Protocol(format!("H264 payload failed: {}", e)))?,
            Packetizer::H265(p) => p.payload(mtu, frame),
            Packetizer::Jpeg(p) => p.payload(mtu, frame),
            Packetizer::Vp8(p) => p
                .payload(mtu, frame)
                .map_err(|e| AppError::Protocol(format!("VP8 payload failed: {}", e)))?,
            Packetizer::Vp9(p) => p
                .payload(mtu, frame)
                .map_err(|e| AppError::Protocol(format!("VP9 payload failed: {}", e)))?,
            Packetizer::Mpa => mpa_payloads(mtu, frame),
            Packetizer::Raw { swap_width } => raw_payloads(mtu, frame, *swap_width),
        };
        Ok(payloads)
    }
}

fn mpa_payloads(mtu: usize, frame: &Bytes) -> Vec<Bytes> {
    let room = mtu.saturating_sub(4).max(1);
    frame
        .chunks(room)
        .enumerate()
        .map(|(i, chunk)| {
            let mut packet = BytesMut::with_capacity(4 + chunk.len());
            packet.put_u16(0);
            packet.put_u16((i * room).min(u16::MAX as usize) as u16);
            packet.put_slice(chunk);
            packet.freeze()
        })
        .collect()
}

fn raw_payloads(mtu: usize, frame: &Bytes, swap_width: Option<usize>) -> Vec<Bytes> {
    let Some(width) = swap_width.filter(|w| *w > 1) else {
        return frame.chunks(mtu.max(1)).map(|c| frame.slice_ref(c)).collect();
    };

    // Keep samples whole within a packet
    let room = (mtu / width).max(1) * width;
    frame
        .chunks(room)
        .map(|chunk| {
            let mut packet = BytesMut::from(chunk);
            for sample in packet.chunks_exact_mut(width) {
                sample.reverse();
            }
            packet.freeze()
        })
        .collect()
}

/// Sequence, SSRC and timestamp state of one outgoing RTP stream
pub struct RtpTrack {
    descriptor: RtpDescriptor,
    packetizer: Packetizer,
    sequence: u16,
    ssrc: u32,
    timestamp_offset: u32,
    last_timestamp: u32,
    mtu: usize,
}

impl RtpTrack {
    pub fn new(info: &StreamInfo, track: usize) -> Self {
        let mut rng = rand::rng();
        let timestamp_offset = rng.random();
        Self {
            descriptor: RtpDescriptor::for_stream(info, track),
            packetizer: Packetizer::for_stream(info),
            sequence: rng.random(),
            ssrc: rng.random(),
            timestamp_offset,
            last_timestamp: timestamp_offset,
            mtu: RTP_MTU,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Next sequence number to be sent
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Timestamp of the last frame sent, or the initial offset
    pub fn timestamp(&self) -> u32 {
        self.last_timestamp
    }

    /// Marshalled RTP packets for one frame; the marker is set on the last
    pub fn packets(&mut self, frame: &MediaFrame) -> Result<Vec<Bytes>> {
        let payloads = self.packetizer.packetize(self.mtu, &frame.data)?;
        let timestamp = self
            .timestamp_offset
            .wrapping_add(frame.rtp_timestamp(self.descriptor.clock_rate));
        self.last_timestamp = timestamp;

        let count = payloads.len();
        let mut packets = Vec::with_capacity(count);
        for (idx, payload) in payloads.into_iter().enumerate() {
            let packet = Packet {
                header: rtp::header::Header {
                    version: 2,
                    marker: idx + 1 == count,
                    payload_type: self.descriptor.payload_type,
                    sequence_number: self.sequence,
                    timestamp,
                    ssrc: self.ssrc,
                    ..Default::default()
                },
                payload,
            };
            self.sequence = self.sequence.wrapping_add(1);
            packets.push(
                packet
                    .marshal()
                    .map_err(|e| AppError::Protocol(format!("RTP marshal failed: {}", e)))?,
            );
        }
        Ok(packets)
    }
}
