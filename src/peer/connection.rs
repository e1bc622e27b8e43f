use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::PeerError;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::ice::analyze_candidates;
use crate::peer::media::LocalStream;
use crate::peer::types::{
    IceCandidate, LinkState, PeerEvent, PeerEventKind, SdpKind, ServerConfig, SessionDescription,
};
use crate::utils::add_ice_url_scheme;

/// Receives connection callbacks. Invoked from webrtc-rs internal tasks, so
/// it must not block.
pub type PeerEventSink = Arc<dyn Fn(PeerEvent) + Send + Sync>;

/// One negotiated transport to the remote party.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Creates an offer and installs it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Creates an answer to the applied remote offer and installs it.
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Silences callbacks, then closes. Repeated calls are no-ops.
    async fn close(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    /// Builds a link with `stream`'s tracks bound and callbacks routed to
    /// `sink`, every event tagged with `generation`.
    async fn create(
        &self,
        ice_servers: &[ServerConfig],
        stream: &LocalStream,
        generation: u64,
        sink: PeerEventSink,
    ) -> Result<Arc<dyn PeerLink>, PeerError>;
}

pub(crate) fn rtc_config(ice_servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(ice_servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

/// webrtc-rs API with the default codecs and interceptors registered.
pub(crate) fn build_api() -> Result<API, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

pub struct RtcPeerLinkFactory {
    api: API,
}

impl RtcPeerLinkFactory {
    pub fn new() -> Result<Self, PeerError> {
        Ok(Self { api: build_api()? })
    }
}

#[async_trait]
impl PeerLinkFactory for RtcPeerLinkFactory {
    async fn create(
        &self,
        ice_servers: &[ServerConfig],
        stream: &LocalStream,
        generation: u64,
        sink: PeerEventSink,
    ) -> Result<Arc<dyn PeerLink>, PeerError> {
        let pc = Arc::new(self.api.new_peer_connection(rtc_config(ice_servers)).await?);
        for local in stream.tracks() {
            let track: Arc<dyn TrackLocal + Send + Sync> = local.track.clone();
            pc.add_track(track).await?;
        }
        let link = RtcPeerLink {
            pc,
            closed: AtomicBool::new(false),
        };
        link.attach_callbacks(generation, sink);
        info!(generation, servers = ice_servers.len(), "peer connection created");
        Ok(Arc::new(link))
    }
}

pub struct RtcPeerLink {
    pc: Arc<RTCPeerConnection>,
    closed: AtomicBool,
}

impl RtcPeerLink {
    fn attach_callbacks(&self, generation: u64, sink: PeerEventSink) {
        let emit = move |kind: PeerEventKind| sink(PeerEvent { generation, kind });
        let emit = Arc::new(emit);

        let gathered: Arc<Mutex<Vec<IceCandidate>>> = Arc::default();
        let on_candidate = emit.clone();
        self.pc
            .on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
                match cand {
                    Some(c) => {
                        dump_candidate("LOCAL", &c);
                        match c.to_json() {
                            Ok(init) => {
                                let candidate = IceCandidate {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                    username_fragment: init.username_fragment,
                                };
                                gathered.lock().push(candidate.clone());
                                on_candidate(PeerEventKind::LocalCandidate(candidate));
                            }
                            Err(e) => warn!(error = %e, "candidate not serializable"),
                        }
                    }
                    None => {
                        analyze_candidates(&gathered.lock());
                        on_candidate(PeerEventKind::GatheringComplete);
                    }
                }
                Box::pin(async {})
            }));

        let on_state = emit.clone();
        let weak_pc: Weak<RTCPeerConnection> = Arc::downgrade(&self.pc);
        self.pc
            .on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
                debug!(generation, state = ?st, "peer connection state");
                if st == RTCPeerConnectionState::Failed {
                    if let Some(pc) = weak_pc.upgrade() {
                        tokio::spawn(async move {
                            dump_selected_pair(&pc, "BEFORE-FAIL").await;
                        });
                    }
                }
                on_state(PeerEventKind::StateChanged(LinkState::from(st)));
                Box::pin(async {})
            }));

        let on_track = emit;
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                on_track(PeerEventKind::RemoteTrack {
                    kind: track.kind().to_string(),
                    track_id: track.id(),
                });
                Box::pin(async {})
            },
        ));
    }

    fn silence_callbacks(&self) {
        self.pc
            .on_ice_candidate(Box::new(|_: Option<RTCIceCandidate>| Box::pin(async {})));
        self.pc
            .on_peer_connection_state_change(Box::new(|_: RTCPeerConnectionState| {
                Box::pin(async {})
            }));
        self.pc.on_track(Box::new(
            |_: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                Box::pin(async {})
            },
        ));
    }
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let rtc = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| PeerError::InvalidDescription(e.to_string()))?;
        self.pc.set_remote_description(rtc).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.silence_callbacks();
        self.pc.close().await?;
        debug!("peer connection closed");
        Ok(())
    }
}
