//! RTSP server for unicast and multicast sessions
//!
//! Unicast clients get RTP interleaved on their RTSP connection. Multicast
//! sessions are pushed to their group from the moment serving starts; SETUP
//! only tells clients where to listen. Segmented sessions are handed to the
//! HTTP publisher.

use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rtsp_types as rtsp;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::multicast::spawn_multicast_sender;
use super::payload::RtpDescriptor;
use super::protocol::{
    generate_session_id, parse_request, parse_target, parse_transport, send_response,
    send_simple_response, strip_interleaved_frames, take_request, write_interleaved, Framing,
    RtspRequest, TransportRequest, PUBLIC_METHODS, RTSP_BUF_SIZE,
};
use super::pump::TrackPump;
use super::sdp::{build_sdp, fmtp_for, MulticastDestination, SdpMedia};
use crate::config::RtspConfig;
use crate::error::{AppError, Result};
use crate::hls::{create_router, SegmentedPublisher};
use crate::session::{DeliveryLeg, DeliveryMode, Session, SessionServer};
use crate::utils::{advertised_ipv4, bind_tcp_listener};

/// Used until the first source reports its frame size
const DEFAULT_PACKET_BUDGET: usize = 100_000;

/// Interleaved packets queued per client before pumps wait
const CLIENT_QUEUE: usize = 256;

struct Shared {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    host: Ipv4Addr,
    port: u16,
    session_timeout: Duration,
    packet_budget: AtomicUsize,
}

impl Shared {
    fn session_url(&self, name: &str) -> String {
        format!("rtsp://{}:{}/{}", self.host, self.port, name)
    }

    fn packet_budget(&self) -> usize {
        self.packet_budget.load(Ordering::Relaxed)
    }
}

pub struct RtspServer {
    shared: Arc<Shared>,
    listener: Mutex<Option<std::net::TcpListener>>,
    publisher: Arc<SegmentedPublisher>,
    http_addr: SocketAddr,
}

impl RtspServer {
    /// Bind the RTSP listener. The HTTP side is bound when serving starts.
    pub fn bind(config: &RtspConfig, http_port: u16) -> Result<Self> {
        let ip = config.bind.parse().map_err(|e| {
            AppError::Config(format!("invalid RTSP bind address {}: {}", config.bind, e))
        })?;
        let listener = bind_tcp_listener(SocketAddr::new(ip, config.port))?;
        let port = listener.local_addr()?.port();
        let host = advertised_ipv4(&config.bind);
        info!("RTSP server listening on {}:{}", ip, port);

        Ok(Self {
            shared: Arc::new(Shared {
                sessions: RwLock::new(HashMap::new()),
                host,
                port,
                session_timeout: Duration::from_secs(config.session_timeout_secs.max(1)),
                packet_budget: AtomicUsize::new(DEFAULT_PACKET_BUDGET),
            }),
            listener: Mutex::new(Some(listener)),
            publisher: Arc::new(SegmentedPublisher::new()),
            http_addr: SocketAddr::new(ip, http_port),
        })
    }

    /// Largest frame any client is sent
    pub fn set_packet_budget(&self, budget: usize) {
        self.shared
            .packet_budget
            .store(budget.max(DEFAULT_PACKET_BUDGET), Ordering::Relaxed);
    }

    pub fn port(&self) -> u16 {
        self.shared.port
    }

    fn spawn_multicast_senders(&self, cancel: &CancellationToken) {
        let sessions: Vec<Arc<Session>> = self.shared.sessions.read().values().cloned().collect();
        for session in sessions {
            for (index, leg) in session.legs.iter().enumerate() {
                let DeliveryLeg::Multicast {
                    stream,
                    group,
                    ports,
                    ttl,
                } = leg
                else {
                    continue;
                };
                if let Err(e) = spawn_multicast_sender(
                    stream,
                    index,
                    *group,
                    *ports,
                    *ttl,
                    self.shared.packet_budget(),
                    cancel.clone(),
                ) {
                    error!(
                        "{}: cannot multicast {} to {}: {}",
                        session.name,
                        stream.info().rtp_mime,
                        group,
                        e
                    );
                }
            }
        }
    }

    fn spawn_http(&self, cancel: &CancellationToken) {
        if !self.publisher.has_sessions() {
            return;
        }
        self.publisher.start(cancel);

        let listener = match bind_tcp_listener(self.http_addr).and_then(TcpListener::from_std) {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind HTTP server on {}: {}", self.http_addr, e);
                return;
            }
        };
        info!("HTTP server listening on {}", self.http_addr);
        let router = create_router(self.publisher.clone());
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("HTTP server error: {}", e);
            }
        });
    }
}

#[async_trait]
impl SessionServer for RtspServer {
    fn add_session(&self, session: Session) -> Result<String> {
        if session.name.is_empty() || session.name.contains('/') {
            return Err(AppError::SessionRegistration(format!(
                "invalid session name {:?}",
                session.name
            )));
        }
        if session.legs.is_empty() {
            return Err(AppError::SessionRegistration(format!(
                "{}: session has no legs",
                session.name
            )));
        }

        if session.mode == DeliveryMode::Segmented {
            if self.shared.sessions.read().contains_key(&session.name) {
                return Err(AppError::SessionRegistration(format!(
                    "{}: name already in use",
                    session.name
                )));
            }
            self.publisher.add_session(&session)?;
            return Ok(format!(
                "http://{}:{}/{}.m3u8",
                self.shared.host,
                self.http_addr.port(),
                session.name
            ));
        }

        let url = self.shared.session_url(&session.name);
        let mut sessions = self.shared.sessions.write();
        if sessions.contains_key(&session.name) || self.publisher.playlist(&session.name).is_some()
        {
            return Err(AppError::SessionRegistration(format!(
                "{}: name already in use",
                session.name
            )));
        }
        debug!("Registered {} session {}", session.mode, session.name);
        sessions.insert(session.name.clone(), Arc::new(session));
        Ok(url)
    }

    fn http_base_url(&self) -> Option<String> {
        Some(format!(
            "http://{}:{}",
            self.shared.host,
            self.http_addr.port()
        ))
    }

    async fn serve(&self, cancel: CancellationToken) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| AppError::Protocol("RTSP server is already serving".to_string()))?;
        let listener = TcpListener::from_std(listener)?;

        self.spawn_multicast_senders(&cancel);
        self.spawn_http(&cancel);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("RTSP accept failed: {}", e);
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    let shared = self.shared.clone();
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer.to_string(), shared, cancel).await {
                            debug!("RTSP client {} ended: {}", peer, e);
                        }
                    });
                }
            }
        }
        Ok(())
    }
}

/// Per-connection session state
struct ClientState {
    peer: String,
    session_id: String,
    /// Bound by the first SETUP
    session: Option<Arc<Session>>,
    /// Track index to interleaved RTP channel
    channels: BTreeMap<usize, u8>,
    playing: bool,
    stop: CancellationToken,
}

impl ClientState {
    fn new(peer: String, stop: CancellationToken) -> Self {
        Self {
            peer,
            session_id: generate_session_id(),
            session: None,
            channels: BTreeMap::new(),
            playing: false,
            stop,
        }
    }

    fn session_header(&self, timeout: Duration) -> Option<(&str, u64)> {
        self.session
            .as_ref()
            .map(|_| (self.session_id.as_str(), timeout.as_secs()))
    }
}

enum Flow {
    Continue,
    Close,
}

async fn handle_connection<S>(
    stream: S,
    peer: String,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (packet_tx, mut packet_rx) = mpsc::channel::<(u8, Bytes)>(CLIENT_QUEUE);
    let mut state = ClientState::new(peer, cancel.child_token());
    let mut read_buf = vec![0u8; RTSP_BUF_SIZE];
    let mut request_buffer = Vec::with_capacity(RTSP_BUF_SIZE);
    let mut deadline = Instant::now() + shared.session_timeout;

    debug!("RTSP client {} connected", state.peer);
    let result: Result<()> = async {
        'client: loop {
            tokio::select! {
                _ = cancel.cancelled() => break 'client,
                _ = tokio::time::sleep_until(deadline) => {
                    info!("RTSP client {} timed out", state.peer);
                    break 'client;
                }
                Some((channel, packet)) = packet_rx.recv() => {
                    write_interleaved(&mut writer, channel, &packet).await?;
                }
                read = reader.read(&mut read_buf) => {
                    let n = read?;
                    if n == 0 {
                        break 'client;
                    }
                    deadline = Instant::now() + shared.session_timeout;
                    request_buffer.extend_from_slice(&read_buf[..n]);

                    loop {
                        while strip_interleaved_frames(&mut request_buffer) {}
                        let raw = match take_request(&mut request_buffer) {
                            Framing::Incomplete => break,
                            Framing::Request(raw) => raw,
                            Framing::Rejected => {
                                warn!("RTSP client {} sent an oversized request", state.peer);
                                send_simple_response(&mut writer, 400).await?;
                                break 'client;
                            }
                        };
                        let Some(req) = parse_request(&raw) else {
                            send_simple_response(&mut writer, 400).await?;
                            continue;
                        };
                        let flow = handle_request(&mut writer, &req, &mut state, &shared, &packet_tx).await?;
                        if matches!(flow, Flow::Close) {
                            break 'client;
                        }
                    }
                }
            }
        }
        Ok(())
    }
    .await;

    state.stop.cancel();
    debug!("RTSP client {} disconnected", state.peer);
    result
}

async fn handle_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    req: &RtspRequest,
    state: &mut ClientState,
    shared: &Shared,
    packet_tx: &mpsc::Sender<(u8, Bytes)>,
) -> Result<Flow> {
    let timeout = shared.session_timeout;

    if let (Some(requested), Some(_)) = (req.session(), &state.session) {
        if requested != state.session_id {
            send_response(writer, req, 454, vec![], "", None).await?;
            return Ok(Flow::Continue);
        }
    }

    match &req.method {
        rtsp::Method::Options => {
            send_response(
                writer,
                req,
                200,
                vec![("Public".to_string(), PUBLIC_METHODS.to_string())],
                "",
                state.session_header(timeout),
            )
            .await?;
        }
        rtsp::Method::Describe => {
            let target = parse_target(&req.uri);
            let session = shared.sessions.read().get(&target.session).cloned();
            let Some(session) = session else {
                send_response(writer, req, 404, vec![], "", None).await?;
                return Ok(Flow::Continue);
            };
            let sdp = build_sdp(&session.name, shared.host, &sdp_medias(&session))?;
            send_response(
                writer,
                req,
                200,
                vec![
                    ("Content-Type".to_string(), "application/sdp".to_string()),
                    (
                        "Content-Base".to_string(),
                        format!("{}/", shared.session_url(&session.name)),
                    ),
                ],
                &sdp,
                state.session_header(timeout),
            )
            .await?;
        }
        rtsp::Method::Setup => {
            let code_or_transport = setup(req, state, shared);
            match code_or_transport {
                Ok(transport) => {
                    send_response(
                        writer,
                        req,
                        200,
                        vec![("Transport".to_string(), transport)],
                        "",
                        state.session_header(timeout),
                    )
                    .await?;
                }
                Err(code) => {
                    send_response(writer, req, code, vec![], "", state.session_header(timeout))
                        .await?;
                }
            }
        }
        rtsp::Method::Play => {
            let Some(session) = state.session.clone() else {
                send_response(writer, req, 455, vec![], "", None).await?;
                return Ok(Flow::Continue);
            };
            let mut headers = vec![("Range".to_string(), "npt=0.000-".to_string())];
            if session.mode == DeliveryMode::Unicast && !state.playing {
                let rtp_info = start_pumps(&session, state, shared, packet_tx);
                if !rtp_info.is_empty() {
                    headers.push(("RTP-Info".to_string(), rtp_info.join(",")));
                }
                info!(
                    "RTSP client {} playing {} ({} tracks)",
                    state.peer,
                    session.name,
                    state.channels.len()
                );
            }
            state.playing = true;
            send_response(writer, req, 200, headers, "", state.session_header(timeout)).await?;
        }
        rtsp::Method::Teardown => {
            send_response(writer, req, 200, vec![], "", state.session_header(timeout)).await?;
            return Ok(Flow::Close);
        }
        rtsp::Method::GetParameter | rtsp::Method::SetParameter => {
            send_response(writer, req, 200, vec![], "", state.session_header(timeout)).await?;
        }
        _ => {
            send_response(writer, req, 405, vec![], "", state.session_header(timeout)).await?;
        }
    }
    Ok(Flow::Continue)
}

fn sdp_medias(session: &Session) -> Vec<SdpMedia> {
    session
        .legs
        .iter()
        .enumerate()
        .map(|(index, leg)| {
            let stream = leg.stream();
            let descriptor = RtpDescriptor::for_stream(stream.info(), index);
            let destination = match leg {
                DeliveryLeg::Multicast {
                    group, ports, ttl, ..
                } => Some(MulticastDestination {
                    group: *group,
                    port: ports.rtp,
                    ttl: *ttl,
                }),
                _ => None,
            };
            SdpMedia {
                media: leg.media(),
                fmtp: fmtp_for(
                    stream.family(),
                    descriptor.payload_type,
                    &stream.parameter_sets(),
                ),
                descriptor,
                destination,
            }
        })
        .collect()
}

/// Validate a SETUP and record it. Returns the Transport reply or an
/// RTSP status code.
fn setup(
    req: &RtspRequest,
    state: &mut ClientState,
    shared: &Shared,
) -> std::result::Result<String, u16> {
    let target = parse_target(&req.uri);
    let session = shared
        .sessions
        .read()
        .get(&target.session)
        .cloned()
        .ok_or(404u16)?;

    if let Some(bound) = &state.session {
        if bound.name != session.name {
            return Err(455);
        }
    }
    if state.playing {
        return Err(455);
    }

    let index = match target.track {
        Some(index) => index,
        None if session.legs.len() == 1 => 0,
        None => return Err(400),
    };
    let leg = session.legs.get(index).ok_or(404u16)?;
    let requested = parse_transport(req.header("transport").unwrap_or_default());

    let transport = match leg {
        DeliveryLeg::Multicast {
            group, ports, ttl, ..
        } => format!(
            "RTP/AVP;multicast;destination={};port={}-{};ttl={}",
            group, ports.rtp, ports.rtcp, ttl
        ),
        DeliveryLeg::Unicast { .. } => match requested {
            TransportRequest::Interleaved(channels) => {
                let base = (index * 2).min(254) as u8;
                let (rtp, rtcp) = channels.unwrap_or((base, base + 1));
                state.channels.insert(index, rtp);
                format!("RTP/AVP/TCP;unicast;interleaved={}-{}", rtp, rtcp)
            }
            TransportRequest::UdpUnicast | TransportRequest::Multicast => return Err(461),
        },
        DeliveryLeg::Segmented { .. } => return Err(461),
    };

    state.session = Some(session);
    Ok(transport)
}

/// Subscribe every set-up track and start forwarding its packets to the
/// connection. Returns the RTP-Info entries.
fn start_pumps(
    session: &Session,
    state: &ClientState,
    shared: &Shared,
    packet_tx: &mpsc::Sender<(u8, Bytes)>,
) -> Vec<String> {
    let mut rtp_info = Vec::with_capacity(state.channels.len());
    for (&index, &channel) in &state.channels {
        let Some(leg) = session.legs.get(index) else {
            continue;
        };
        let mut pump = TrackPump::new(leg.stream(), index, shared.packet_budget());
        rtp_info.push(format!(
            "url={}/trackID={};seq={};rtptime={}",
            shared.session_url(&session.name),
            index,
            pump.track().sequence(),
            pump.track().timestamp()
        ));

        let tx = packet_tx.clone();
        let stop = state.stop.clone();
        tokio::spawn(async move {
            loop {
                let packets = tokio::select! {
                    _ = stop.cancelled() => break,
                    packets = pump.next_packets() => packets,
                };
                let Some(packets) = packets else {
                    break;
                };
                for packet in packets {
                    if tx.send((channel, packet)).await.is_err() {
                        return;
                    }
                }
            }
        });
    }
    rtp_info
}
