//! Session descriptions for DESCRIBE

use std::net::Ipv4Addr;

use base64::Engine;
use sdp_types as sdp;

use super::payload::RtpDescriptor;
use crate::error::{AppError, Result};
use crate::stream::framing::profile_level_id;
use crate::stream::{MediaKind, ParameterSets};
use crate::video::format::CodecFamily;

/// Where a multicast track is pushed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MulticastDestination {
    pub group: Ipv4Addr,
    pub port: u16,
    pub ttl: u8,
}

/// One `m=` section
#[derive(Debug, Clone)]
pub struct SdpMedia {
    pub media: MediaKind,
    pub descriptor: RtpDescriptor,
    pub fmtp: Option<String>,
    pub destination: Option<MulticastDestination>,
}

fn b64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// `a=fmtp` value for NAL-based video, built from the latest parameter sets
pub fn fmtp_for(family: CodecFamily, payload_type: u8, params: &ParameterSets) -> Option<String> {
    match family {
        CodecFamily::H264 => {
            let mut attrs = vec!["packetization-mode=1".to_string()];
            let profile = params
                .sps
                .as_deref()
                .and_then(profile_level_id)
                .unwrap_or_else(|| "42e01f".to_string());
            attrs.push(format!("profile-level-id={}", profile));
            if let (Some(sps), Some(pps)) = (&params.sps, &params.pps) {
                attrs.push(format!("sprop-parameter-sets={},{}", b64(sps), b64(pps)));
            }
            Some(format!("{} {}", payload_type, attrs.join(";")))
        }
        CodecFamily::Hevc => {
            let attrs: Vec<String> = [
                ("sprop-vps", &params.vps),
                ("sprop-sps", &params.sps),
                ("sprop-pps", &params.pps),
            ]
            .into_iter()
            .filter_map(|(name, nal)| nal.as_ref().map(|nal| format!("{}={}", name, b64(nal))))
            .collect();
            if attrs.is_empty() {
                Some(format!("{} profile-id=1", payload_type))
            } else {
                Some(format!("{} {}", payload_type, attrs.join(";")))
            }
        }
        CodecFamily::Generic => None,
    }
}

fn attribute(name: &str, value: impl Into<String>) -> sdp::Attribute {
    sdp::Attribute {
        attribute: name.to_string(),
        value: Some(value.into()),
    }
}

fn ip4_connection(address: String) -> sdp::Connection {
    sdp::Connection {
        nettype: "IN".to_string(),
        addrtype: "IP4".to_string(),
        connection_address: address,
    }
}

/// Serialize a description with one `m=` section per track. Tracks are
/// addressed by `trackID=<index>`.
pub fn build_sdp(session_name: &str, origin: Ipv4Addr, medias: &[SdpMedia]) -> Result<String> {
    let medias: Vec<sdp::Media> = medias
        .iter()
        .enumerate()
        .map(|(index, media)| {
            let mut attributes = vec![attribute("rtpmap", media.descriptor.rtpmap())];
            if let Some(fmtp) = &media.fmtp {
                attributes.push(attribute("fmtp", fmtp.clone()));
            }
            attributes.push(attribute("control", format!("trackID={}", index)));

            let (port, connections) = match media.destination {
                Some(dest) => (
                    dest.port,
                    vec![ip4_connection(format!("{}/{}", dest.group, dest.ttl))],
                ),
                None => (0, Vec::new()),
            };

            sdp::Media {
                media: media.media.to_string(),
                port,
                num_ports: None,
                proto: "RTP/AVP".to_string(),
                fmt: media.descriptor.payload_type.to_string(),
                media_title: None,
                connections,
                bandwidths: Vec::new(),
                key: None,
                attributes,
            }
        })
        .collect();

    let mut attributes = vec![attribute("control", "*")];
    if medias_are_multicast(&medias) {
        attributes.push(attribute("type", "broadcast"));
    }

    let session = sdp::Session {
        origin: sdp::Origin {
            username: Some("-".to_string()),
            sess_id: "0".to_string(),
            sess_version: 0,
            nettype: "IN".to_string(),
            addrtype: "IP4".to_string(),
            unicast_address: origin.to_string(),
        },
        session_name: session_name.to_string(),
        session_description: None,
        uri: None,
        emails: Vec::new(),
        phones: Vec::new(),
        connection: Some(ip4_connection("0.0.0.0".to_string())),
        bandwidths: Vec::new(),
        times: vec![sdp::Time {
            start_time: 0,
            stop_time: 0,
            repeats: Vec::new(),
        }],
        time_zones: Vec::new(),
        key: None,
        attributes,
        medias,
    };

    let mut output = Vec::new();
    session
        .write(&mut output)
        .map_err(|e| AppError::Protocol(format!("failed to serialize SDP: {}", e)))?;
    String::from_utf8(output).map_err(|e| AppError::Protocol(format!("SDP is not UTF-8: {}", e)))
}

fn medias_are_multicast(medias: &[sdp::Media]) -> bool {
    !medias.is_empty() && medias.iter().all(|m| !m.connections.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamInfo;
    use bytes::Bytes;

    fn h264_params() -> ParameterSets {
        ParameterSets {
            vps: None,
            sps: Some(Bytes::from_static(&[0x67, 0x42, 0xe0, 0x1f, 0x96, 0x54])),
            pps: Some(Bytes::from_static(&[0x68, 0xce, 0x06, 0xe2])),
        }
    }

    fn video_media(destination: Option<MulticastDestination>) -> SdpMedia {
        let descriptor = RtpDescriptor::for_stream(&StreamInfo::video("video/H264", 1), 0);
        SdpMedia {
            media: MediaKind::Video,
            fmtp: fmtp_for(CodecFamily::H264, descriptor.payload_type, &h264_params()),
            descriptor,
            destination,
        }
    }

    fn audio_media() -> SdpMedia {
        let info = StreamInfo {
            media: MediaKind::Audio,
            rtp_mime: "audio/L16/44100/2".to_string(),
            clock_rate: 44100,
            channels: 2,
            max_frame_size: 1024,
            pcm_swap_width: Some(2),
        };
        SdpMedia {
            media: MediaKind::Audio,
            descriptor: RtpDescriptor::for_stream(&info, 1),
            fmtp: None,
            destination: None,
        }
    }

    #[test]
    fn unicast_description_lists_every_track() {
        let text = build_sdp(
            "unicast",
            Ipv4Addr::new(192, 168, 1, 10),
            &[video_media(None), audio_media()],
        )
        .unwrap();

        let session = sdp::Session::parse(text.as_bytes()).unwrap();
        assert_eq!(session.session_name, "unicast");
        assert_eq!(session.origin.unicast_address, "192.168.1.10");
        assert_eq!(session.medias.len(), 2);

        let video = &session.medias[0];
        assert_eq!(video.media, "video");
        assert_eq!(video.fmt, "96");
        let fmtp = video
            .attributes
            .iter()
            .find(|a| a.attribute == "fmtp")
            .and_then(|a| a.value.as_deref())
            .unwrap();
        assert!(fmtp.contains("packetization-mode=1"));
        assert!(fmtp.contains("profile-level-id=42e01f"));
        assert!(fmtp.contains("sprop-parameter-sets=Z0LgH5ZU,aM4G4g=="));

        let audio = &session.medias[1];
        assert_eq!(audio.fmt, "10");
        assert!(audio.attributes.iter().any(|a| {
            a.attribute == "rtpmap" && a.value.as_deref() == Some("10 L16/44100/2")
        }));
        assert!(audio.attributes.iter().any(|a| {
            a.attribute == "control" && a.value.as_deref() == Some("trackID=1")
        }));
    }

    #[test]
    fn multicast_description_carries_group_and_port() {
        let dest = MulticastDestination {
            group: Ipv4Addr::new(239, 0, 0, 1),
            port: 30000,
            ttl: 5,
        };
        let text = build_sdp("multicast", Ipv4Addr::LOCALHOST, &[video_media(Some(dest))]).unwrap();
        let session = sdp::Session::parse(text.as_bytes()).unwrap();

        let media = &session.medias[0];
        assert_eq!(media.port, 30000);
        assert_eq!(media.connections[0].connection_address, "239.0.0.1/5");
        assert!(session
            .attributes
            .iter()
            .any(|a| a.attribute == "type" && a.value.as_deref() == Some("broadcast")));
    }

    #[test]
    fn h265_fmtp_lists_parameter_sets() {
        let params = ParameterSets {
            vps: Some(Bytes::from_static(&[0x40, 0x01])),
            sps: Some(Bytes::from_static(&[0x42, 0x01])),
            pps: Some(Bytes::from_static(&[0x44, 0x01])),
        };
        let fmtp = fmtp_for(CodecFamily::Hevc, 96, &params).unwrap();
        assert!(fmtp.starts_with("96 sprop-vps="));
        assert!(fmtp.contains("sprop-sps="));
        assert!(fmtp.contains("sprop-pps="));

        let empty = fmtp_for(CodecFamily::Hevc, 97, &ParameterSets::default()).unwrap();
        assert_eq!(empty, "97 profile-id=1");
        assert!(fmtp_for(CodecFamily::Generic, 26, &params).is_none());
    }
}
