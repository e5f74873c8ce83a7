//! Framing strategies: turn raw captured buffers into stream frames
//!
//! H.264 and H.265 buffers are Annex B byte streams. Their parameter sets
//! are cached and, when `repeat_config` is set, re-emitted in front of every
//! key frame that arrives without them. Everything else passes through.

use bytes::{Bytes, BytesMut};

use crate::video::format::CodecFamily;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Latest parameter sets seen on an H.264/H.265 stream
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParameterSets {
    /// H.265 only
    pub vps: Option<Bytes>,
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
}

impl ParameterSets {
    /// Whether enough is cached to start decoding
    pub fn is_complete(&self, family: CodecFamily) -> bool {
        let base = self.sps.is_some() && self.pps.is_some();
        match family {
            CodecFamily::Hevc => base && self.vps.is_some(),
            _ => base,
        }
    }

    fn write_annexb(&self, out: &mut BytesMut) {
        for nal in [&self.vps, &self.sps, &self.pps].into_iter().flatten() {
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(nal);
        }
    }
}

/// NAL unit classes the framer cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NalClass {
    Vps,
    Sps,
    Pps,
    KeySlice,
    Other,
}

fn classify(family: CodecFamily, nal: &[u8]) -> NalClass {
    match family {
        CodecFamily::H264 => match h264_nal_type(nal) {
            Some(7) => NalClass::Sps,
            Some(8) => NalClass::Pps,
            Some(5) => NalClass::KeySlice,
            _ => NalClass::Other,
        },
        CodecFamily::Hevc => match h265_nal_type(nal) {
            Some(32) => NalClass::Vps,
            Some(33) => NalClass::Sps,
            Some(34) => NalClass::Pps,
            // BLA, IDR and CRA pictures
            Some(16..=21) => NalClass::KeySlice,
            _ => NalClass::Other,
        },
        CodecFamily::Generic => NalClass::Other,
    }
}

/// Output of one framing step
#[derive(Debug, Clone)]
pub struct Framed {
    pub data: Bytes,
    pub key_frame: bool,
}

/// Framing strategy, selected once per source from the codec family
#[derive(Debug, Clone)]
pub enum Framer {
    /// Annex B video with parameter-set tracking
    Nal {
        family: CodecFamily,
        repeat_config: bool,
        params: ParameterSets,
    },
    /// Buffers are forwarded unmodified
    PassThrough,
}

impl Framer {
    pub fn for_family(family: CodecFamily, repeat_config: bool) -> Self {
        match family {
            CodecFamily::H264 | CodecFamily::Hevc => Framer::Nal {
                family,
                repeat_config,
                params: ParameterSets::default(),
            },
            CodecFamily::Generic => Framer::PassThrough,
        }
    }

    pub fn family(&self) -> CodecFamily {
        match self {
            Framer::Nal { family, .. } => *family,
            Framer::PassThrough => CodecFamily::Generic,
        }
    }

    /// Parameter sets cached so far (`None` for pass-through)
    pub fn parameter_sets(&self) -> Option<&ParameterSets> {
        match self {
            Framer::Nal { params, .. } => Some(params),
            Framer::PassThrough => None,
        }
    }

    pub fn frame(&mut self, data: Bytes) -> Framed {
        let Framer::Nal {
            family,
            repeat_config,
            params,
        } = self
        else {
            return Framed {
                data,
                key_frame: true,
            };
        };

        let mut key_frame = false;
        let (mut has_vps, mut has_sps, mut has_pps) = (false, false, false);
        for nal in split_annexb_nal_units(&data) {
            match classify(*family, nal) {
                NalClass::Vps => {
                    params.vps = Some(Bytes::copy_from_slice(nal));
                    has_vps = true;
                }
                NalClass::Sps => {
                    params.sps = Some(Bytes::copy_from_slice(nal));
                    has_sps = true;
                }
                NalClass::Pps => {
                    params.pps = Some(Bytes::copy_from_slice(nal));
                    has_pps = true;
                }
                NalClass::KeySlice => key_frame = true,
                NalClass::Other => {}
            }
        }

        let carries_config = has_sps && has_pps && (has_vps || *family != CodecFamily::Hevc);
        if key_frame && *repeat_config && !carries_config && params.is_complete(*family) {
            let mut out = BytesMut::with_capacity(data.len() + 128);
            params.write_annexb(&mut out);
            out.extend_from_slice(&data);
            return Framed {
                data: out.freeze(),
                key_frame,
            };
        }

        Framed { data, key_frame }
    }
}

/// Split an Annex B byte stream into NAL units (start codes removed)
pub fn split_annexb_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut nal_units = Vec::new();
    let mut cursor = 0usize;

    while let Some((start, start_code_len)) = find_annexb_start_code(data, cursor) {
        let nal_start = start + start_code_len;
        if nal_start >= data.len() {
            break;
        }

        let next_start = find_annexb_start_code(data, nal_start)
            .map(|(idx, _)| idx)
            .unwrap_or(data.len());

        let mut nal_end = next_start;
        while nal_end > nal_start && data[nal_end - 1] == 0 {
            nal_end -= 1;
        }

        if nal_end > nal_start {
            nal_units.push(&data[nal_start..nal_end]);
        }

        cursor = next_start;
    }

    nal_units
}

/// Position and length of the next 3- or 4-byte start code
fn find_annexb_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    if from >= data.len() {
        return None;
    }

    let mut i = from;
    while i + 3 <= data.len() {
        if i + 4 <= data.len() && data[i..i + 4] == START_CODE {
            return Some((i, 4));
        }
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            return Some((i, 3));
        }
        i += 1;
    }

    None
}

pub fn h264_nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|value| value & 0x1f)
}

pub fn h265_nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|value| (value >> 1) & 0x3f)
}

/// `profile-level-id` from an H.264 SPS NAL (header byte included)
pub fn profile_level_id(sps: &[u8]) -> Option<String> {
    if sps.len() < 4 {
        return None;
    }
    Some(format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: &[u8] = &[0x67, 0x42, 0xe0, 0x1f];
    const PPS: &[u8] = &[0x68, 0xce, 0x06, 0xe2];
    const IDR: &[u8] = &[0x65, 0x88, 0x84];
    const P_SLICE: &[u8] = &[0x41, 0x9a, 0x02];

    fn annexb(nals: &[&[u8]]) -> Bytes {
        let mut out = BytesMut::new();
        for nal in nals {
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(nal);
        }
        out.freeze()
    }

    #[test]
    fn split_handles_three_and_four_byte_start_codes() {
        let data = [0, 0, 0, 1, 0x67, 0x42, 0, 0, 1, 0x68, 0xce, 0, 0];
        let nals = split_annexb_nal_units(&data);
        assert_eq!(nals, vec![&[0x67, 0x42][..], &[0x68, 0xce][..]]);
    }

    #[test]
    fn key_frame_without_config_gets_cached_sets() {
        let mut framer = Framer::for_family(CodecFamily::H264, true);

        let first = framer.frame(annexb(&[SPS, PPS, IDR]));
        assert!(first.key_frame);
        assert_eq!(first.data, annexb(&[SPS, PPS, IDR]));

        let delta = framer.frame(annexb(&[P_SLICE]));
        assert!(!delta.key_frame);
        assert_eq!(delta.data, annexb(&[P_SLICE]));

        let second = framer.frame(annexb(&[IDR]));
        assert!(second.key_frame);
        assert_eq!(second.data, annexb(&[SPS, PPS, IDR]));
    }

    #[test]
    fn repeat_disabled_forwards_unchanged() {
        let mut framer = Framer::for_family(CodecFamily::H264, false);
        framer.frame(annexb(&[SPS, PPS, IDR]));
        let second = framer.frame(annexb(&[IDR]));
        assert_eq!(second.data, annexb(&[IDR]));
        assert!(framer.parameter_sets().unwrap().is_complete(CodecFamily::H264));
    }

    #[test]
    fn hevc_requires_vps_before_repeating() {
        let vps: &[u8] = &[0x40, 0x01, 0x0c];
        let sps: &[u8] = &[0x42, 0x01, 0x01];
        let pps: &[u8] = &[0x44, 0x01, 0xc0];
        let idr: &[u8] = &[0x26, 0x01, 0xaf];

        let mut framer = Framer::for_family(CodecFamily::Hevc, true);
        framer.frame(annexb(&[sps, pps]));
        assert_eq!(framer.frame(annexb(&[idr])).data, annexb(&[idr]));

        framer.frame(annexb(&[vps]));
        let keyed = framer.frame(annexb(&[idr]));
        assert!(keyed.key_frame);
        assert_eq!(keyed.data, annexb(&[vps, sps, pps, idr]));
    }

    #[test]
    fn generic_framing_is_pass_through() {
        let mut framer = Framer::for_family(CodecFamily::Generic, true);
        let raw = Bytes::from_static(&[0xff, 0xd8, 0x00, 0x00, 0x01, 0x65]);
        let out = framer.frame(raw.clone());
        assert_eq!(out.data, raw);
        assert!(out.key_frame);
        assert!(framer.parameter_sets().is_none());
    }

    #[test]
    fn profile_level_id_from_sps() {
        assert_eq!(profile_level_id(SPS).as_deref(), Some("42e01f"));
        assert_eq!(profile_level_id(&[0x67]), None);
    }
}
