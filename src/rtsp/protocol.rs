//! RTSP/1.0 message framing, parsing and responses

use std::collections::HashMap;

use rand::Rng;
use rtsp_types as rtsp;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{AppError, Result};

pub const RTSP_BUF_SIZE: usize = 8192;

pub const PUBLIC_METHODS: &str =
    "OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN, GET_PARAMETER, SET_PARAMETER";

#[derive(Debug, Clone)]
pub struct RtspRequest {
    pub method: rtsp::Method,
    pub uri: String,
    pub version: rtsp::Version,
    headers: HashMap<String, String>,
}

impl RtspRequest {
    #[cfg(test)]
    pub fn new(method: rtsp::Method, uri: &str, headers: &[(&str, &str)]) -> Self {
        Self {
            method,
            uri: uri.to_string(),
            version: rtsp::Version::V1_0,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                .collect(),
        }
    }

    /// Header value by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn cseq(&self) -> &str {
        self.header("cseq").unwrap_or("1")
    }

    /// Session id without the `;timeout=` suffix
    pub fn session(&self) -> Option<&str> {
        self.header("session")
            .map(|value| value.split(';').next().unwrap_or(value).trim())
    }
}

/// Drop interleaved binary frames (RTCP from the client) at the head of
/// the buffer. Returns whether anything was removed.
pub fn strip_interleaved_frames(buffer: &mut Vec<u8>) -> bool {
    let mut stripped = false;
    while buffer.len() >= 4 && buffer[0] == b'$' {
        let frame_len = 4 + u16::from_be_bytes([buffer[2], buffer[3]]) as usize;
        if buffer.len() < frame_len {
            break;
        }
        buffer.drain(..frame_len);
        stripped = true;
    }
    stripped
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Largest request (head and body) a client may send
pub const MAX_REQUEST_SIZE: usize = 4 * RTSP_BUF_SIZE;

/// Outcome of cutting one request off the receive buffer
#[derive(Debug, PartialEq, Eq)]
pub enum Framing {
    /// More bytes are needed
    Incomplete,
    Request(Vec<u8>),
    /// The request can never fit; the connection should be dropped
    Rejected,
}

/// Take one complete request, body included, off the front of the buffer
pub fn take_request(buffer: &mut Vec<u8>) -> Framing {
    let delimiter = b"\r\n\r\n";
    let Some(pos) = find_bytes(buffer, delimiter) else {
        if buffer.len() > MAX_REQUEST_SIZE {
            return Framing::Rejected;
        }
        return Framing::Incomplete;
    };
    let head_end = pos + delimiter.len();

    let head = String::from_utf8_lossy(&buffer[..head_end]);
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .map(|(_, value)| value.trim().parse::<usize>());
    let body_len = match content_length {
        None => 0,
        Some(Ok(len)) => len,
        Some(Err(_)) => return Framing::Rejected,
    };

    let total = match head_end.checked_add(body_len) {
        Some(total) if total <= MAX_REQUEST_SIZE => total,
        _ => return Framing::Rejected,
    };
    if buffer.len() < total {
        return Framing::Incomplete;
    }
    Framing::Request(buffer.drain(..total).collect())
}

pub fn parse_request(raw: &[u8]) -> Option<RtspRequest> {
    let (message, consumed): (rtsp::Message<Vec<u8>>, usize) = rtsp::Message::parse(raw).ok()?;
    if consumed != raw.len() {
        return None;
    }

    let rtsp::Message::Request(request) = message else {
        return None;
    };

    let uri = request
        .request_uri()
        .map(|value| value.as_str().to_string())
        .unwrap_or_default();

    let headers = request
        .headers()
        .map(|(name, value)| (name.to_string().to_ascii_lowercase(), value.to_string()))
        .collect();

    Some(RtspRequest {
        method: request.method().clone(),
        uri,
        version: request.version(),
        headers,
    })
}

/// Session name and track index addressed by a request URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    pub session: String,
    pub track: Option<usize>,
}

fn path_of(uri: &str) -> &str {
    let raw = match uri.split_once("://") {
        Some((_, rest)) => rest.find('/').map_or("", |idx| &rest[idx..]),
        None => uri,
    };
    raw.split(['?', '#'])
        .next()
        .unwrap_or(raw)
        .trim_matches('/')
}

/// `rtsp://host/<session>[/trackID=<n>]`
pub fn parse_target(uri: &str) -> RequestTarget {
    let path = path_of(uri);
    if let Some((session, last)) = path.rsplit_once('/') {
        if let Some(track) = last.strip_prefix("trackID=") {
            if let Ok(track) = track.parse() {
                return RequestTarget {
                    session: session.trim_matches('/').to_string(),
                    track: Some(track),
                };
            }
        }
    }
    RequestTarget {
        session: path.to_string(),
        track: None,
    }
}

/// Transport asked for in SETUP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRequest {
    /// RTP over the RTSP connection; channels when the client chose them
    Interleaved(Option<(u8, u8)>),
    Multicast,
    UdpUnicast,
}

pub fn parse_transport(value: &str) -> TransportRequest {
    let lower = value.to_ascii_lowercase();
    // Several transports may be offered; take the first one
    let first = lower.split(',').next().unwrap_or(&lower);
    let params: Vec<&str> = first.split(';').map(str::trim).collect();

    if let Some(range) = params.iter().find_map(|p| p.strip_prefix("interleaved=")) {
        let mut channels = range.split('-').map(|c| c.trim().parse::<u8>());
        let channels = match (channels.next(), channels.next()) {
            (Some(Ok(rtp)), Some(Ok(rtcp))) => Some((rtp, rtcp)),
            (Some(Ok(rtp)), _) => Some((rtp, rtp.saturating_add(1))),
            _ => None,
        };
        return TransportRequest::Interleaved(channels);
    }
    if params.iter().any(|p| p.starts_with("rtp/avp/tcp")) {
        return TransportRequest::Interleaved(None);
    }
    if params.contains(&"multicast") {
        return TransportRequest::Multicast;
    }
    TransportRequest::UdpUnicast
}

pub fn status_code_from_u16(code: u16) -> rtsp::StatusCode {
    match code {
        200 => rtsp::StatusCode::Ok,
        400 => rtsp::StatusCode::BadRequest,
        404 => rtsp::StatusCode::NotFound,
        405 => rtsp::StatusCode::MethodNotAllowed,
        454 => rtsp::StatusCode::SessionNotFound,
        455 => rtsp::StatusCode::MethodNotValidInThisState,
        461 => rtsp::StatusCode::UnsupportedTransport,
        501 => rtsp::StatusCode::NotImplemented,
        _ => rtsp::StatusCode::InternalServerError,
    }
}

/// Answer without an associated request, e.g. to unparseable input
pub async fn send_simple_response<W: AsyncWrite + Unpin>(stream: &mut W, code: u16) -> Result<()> {
    let response =
        rtsp::Response::builder(rtsp::Version::V1_0, status_code_from_u16(code)).build(Vec::new());
    write_response(stream, &response).await
}

/// Reply to `req`, echoing its CSeq. `session` is `(id, timeout secs)`.
pub async fn send_response<W: AsyncWrite + Unpin>(
    stream: &mut W,
    req: &RtspRequest,
    code: u16,
    extra_headers: Vec<(String, String)>,
    body: &str,
    session: Option<(&str, u64)>,
) -> Result<()> {
    let mut builder = rtsp::Response::builder(req.version, status_code_from_u16(code))
        .header(rtsp::headers::CSEQ, req.cseq());

    if let Some((id, timeout)) = session {
        builder = builder.header(rtsp::headers::SESSION, format!("{};timeout={}", id, timeout));
    }

    for (name, value) in extra_headers {
        let header_name = rtsp::HeaderName::try_from(name.as_str()).map_err(|e| {
            AppError::Protocol(format!("invalid RTSP header name {}: {}", name, e))
        })?;
        builder = builder.header(header_name, value);
    }

    write_response(stream, &builder.build(body.as_bytes().to_vec())).await
}

async fn write_response<W: AsyncWrite + Unpin>(
    stream: &mut W,
    response: &rtsp::Response<Vec<u8>>,
) -> Result<()> {
    let mut data = Vec::new();
    response
        .write(&mut data)
        .map_err(|e| AppError::Protocol(format!("failed to serialize RTSP response: {}", e)))?;
    stream.write_all(&data).await?;
    Ok(())
}

/// `$ <channel> <length>` framing for RTP over the RTSP connection
pub async fn write_interleaved<W: AsyncWrite + Unpin>(
    stream: &mut W,
    channel: u8,
    packet: &[u8],
) -> Result<()> {
    let len = u16::try_from(packet.len())
        .map_err(|_| AppError::Protocol(format!("RTP packet of {} bytes", packet.len())))?;
    let mut header = [b'$', channel, 0, 0];
    header[2..].copy_from_slice(&len.to_be_bytes());
    stream.write_all(&header).await?;
    stream.write_all(packet).await?;
    Ok(())
}

pub fn generate_session_id() -> String {
    let value: u64 = rand::rng().random();
    format!("{:016X}", value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[test]
    fn requests_are_framed_with_their_body() {
        let mut buffer = b"SET_PARAMETER rtsp://h/unicast RTSP/1.0\r\nCSeq: 4\r\nContent-Length: 5\r\n\r\nab".to_vec();
        assert_eq!(take_request(&mut buffer), Framing::Incomplete);

        buffer.extend_from_slice(b"cdeOPTIONS * RTSP/1.0\r\nCSeq: 5\r\n\r\n");
        let Framing::Request(first) = take_request(&mut buffer) else {
            panic!("first request not framed");
        };
        let req = parse_request(&first).unwrap();
        assert_eq!(req.method, rtsp::Method::SetParameter);
        assert_eq!(req.cseq(), "4");

        let Framing::Request(second) = take_request(&mut buffer) else {
            panic!("second request not framed");
        };
        assert_eq!(parse_request(&second).unwrap().method, rtsp::Method::Options);
        assert!(buffer.is_empty());
    }

    #[test]
    fn huge_content_length_is_rejected() {
        let mut buffer =
            b"ANNOUNCE rtsp://h/unicast RTSP/1.0\r\nCSeq: 2\r\nContent-Length: 18446744073709551615\r\n\r\n"
                .to_vec();
        assert_eq!(take_request(&mut buffer), Framing::Rejected);

        let mut too_long = format!(
            "ANNOUNCE rtsp://h/unicast RTSP/1.0\r\nCSeq: 2\r\nContent-Length: {}\r\n\r\n",
            MAX_REQUEST_SIZE
        )
        .into_bytes();
        assert_eq!(take_request(&mut too_long), Framing::Rejected);

        let mut garbage =
            b"OPTIONS * RTSP/1.0\r\nCSeq: 2\r\nContent-Length: -4\r\n\r\n".to_vec();
        assert_eq!(take_request(&mut garbage), Framing::Rejected);
    }

    #[test]
    fn header_without_end_is_bounded() {
        let mut buffer = b"OPTIONS * RTSP/1.0\r\nX-Pad: ".to_vec();
        buffer.resize(MAX_REQUEST_SIZE, b'a');
        assert_eq!(take_request(&mut buffer), Framing::Incomplete);

        buffer.push(b'a');
        assert_eq!(take_request(&mut buffer), Framing::Rejected);
    }

    #[test]
    fn interleaved_frames_are_skipped() {
        let mut buffer = vec![b'$', 1, 0, 2, 0xaa, 0xbb];
        buffer.extend_from_slice(b"OPTIONS");
        assert!(strip_interleaved_frames(&mut buffer));
        assert_eq!(buffer, b"OPTIONS");

        let mut partial = vec![b'$', 1, 0, 9, 0xaa];
        assert!(!strip_interleaved_frames(&mut partial));
        assert_eq!(partial.len(), 5);
    }

    #[test]
    fn targets_name_session_and_track() {
        assert_eq!(
            parse_target("rtsp://10.0.0.1:8554/unicast/trackID=1"),
            RequestTarget {
                session: "unicast".into(),
                track: Some(1)
            }
        );
        assert_eq!(
            parse_target("rtsp://10.0.0.1:8554/multicast/?x=1"),
            RequestTarget {
                session: "multicast".into(),
                track: None
            }
        );
        assert_eq!(parse_target("rtsp://10.0.0.1").session, "");
    }

    #[test]
    fn transports_are_classified() {
        assert_eq!(
            parse_transport("RTP/AVP/TCP;unicast;interleaved=2-3"),
            TransportRequest::Interleaved(Some((2, 3)))
        );
        assert_eq!(
            parse_transport("RTP/AVP/TCP;unicast"),
            TransportRequest::Interleaved(None)
        );
        assert_eq!(
            parse_transport("RTP/AVP;unicast;client_port=5000-5001"),
            TransportRequest::UdpUnicast
        );
        assert_eq!(
            parse_transport("RTP/AVP;multicast"),
            TransportRequest::Multicast
        );
    }

    #[test]
    fn session_header_drops_timeout() {
        let req = RtspRequest::new(
            rtsp::Method::Play,
            "rtsp://h/unicast",
            &[("Session", "ABC;timeout=65")],
        );
        assert_eq!(req.session(), Some("ABC"));
    }

    #[tokio::test]
    async fn response_echoes_cseq_and_session() {
        let req = RtspRequest::new(rtsp::Method::Options, "*", &[("CSeq", "7")]);
        let (mut client, mut server) = duplex(4096);
        send_response(&mut server, &req, 461, vec![], "", Some(("S1", 65)))
            .await
            .unwrap();
        drop(server);

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        let (message, _): (rtsp::Message<Vec<u8>>, usize) = rtsp::Message::parse(&buf).unwrap();
        let rtsp::Message::Response(response) = message else {
            panic!("expected a response");
        };
        assert_eq!(response.status(), rtsp::StatusCode::UnsupportedTransport);
        assert_eq!(
            response.header(&rtsp::headers::CSEQ).unwrap().as_str(),
            "7"
        );
        assert_eq!(
            response.header(&rtsp::headers::SESSION).unwrap().as_str(),
            "S1;timeout=65"
        );
    }

    #[tokio::test]
    async fn interleaved_framing() {
        let (mut client, mut server) = duplex(64);
        write_interleaved(&mut server, 2, &[1, 2, 3]).await.unwrap();
        drop(server);
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, vec![b'$', 2, 0, 3, 1, 2, 3]);
    }
}
