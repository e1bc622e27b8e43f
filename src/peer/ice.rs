use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::PeerError;
use crate::peer::connection::get_user_ice_servers;
use crate::peer::types::{IceCandidate, IceServerKind, ServerConfig};

/// Remote candidates that arrived before they could be applied. Drained
/// once, in receipt order.
#[derive(Debug, Default)]
pub struct PendingIceQueue {
    items: VecDeque<IceCandidate>,
}

impl PendingIceQueue {
    pub fn push(&mut self, candidate: IceCandidate) {
        self.items.push_back(candidate);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn drain(self) -> Vec<IceCandidate> {
        self.items.into()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();
    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            summary.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            summary.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            summary.relay += 1;
        }
    }
    info!(
        host = summary.host,
        srflx = summary.srflx,
        relay = summary.relay,
        "candidate analysis"
    );
    if summary.relay == 0 {
        warn!("no TURN relay candidates; connections through symmetric NAT may fail");
    }
    summary
}

fn proves_server(kind: IceServerKind, candidate: &str) -> bool {
    match kind {
        IceServerKind::Stun => candidate.contains("typ srflx"),
        IceServerKind::Turn => candidate.contains("typ relay"),
    }
}

/// Checks that a STUN server yields a server-reflexive candidate (or a TURN
/// server a relay candidate) within `wait`.
pub async fn probe_ice_server(config: &ServerConfig, wait: Duration) -> Result<bool, PeerError> {
    let rtc_config = RTCConfiguration {
        ice_servers: get_user_ice_servers(std::slice::from_ref(config)),
        ..Default::default()
    };
    let pc = Arc::new(APIBuilder::new().build().new_peer_connection(rtc_config).await?);
    let result = gather_and_match(&pc, config.kind, wait).await;
    let _ = pc.close().await;
    let ok = result?;
    debug!(server = %config.id, url = %config.url, ok, "ice server probe");
    Ok(ok)
}

async fn gather_and_match(
    pc: &Arc<RTCPeerConnection>,
    kind: IceServerKind,
    wait: Duration,
) -> Result<bool, PeerError> {
    let (state_tx, mut state_rx) = mpsc::unbounded_channel();
    pc.on_ice_gathering_state_change(Box::new(move |state| {
        let _ = state_tx.send(state);
        Box::pin(async {})
    }));

    let (hit_tx, mut hit_rx) = mpsc::unbounded_channel();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        if let Some(c) = cand {
            if let Ok(init) = c.to_json() {
                if proves_server(kind, &init.candidate) {
                    let _ = hit_tx.send(());
                }
            }
        }
        Box::pin(async {})
    }));

    // a data channel is enough to start gathering
    pc.create_data_channel("probe", None).await?;
    let offer = pc.create_offer(None).await?;
    pc.set_local_description(offer).await?;

    let matched = async {
        tokio::select! {
            hit = hit_rx.recv() => hit.is_some(),
            _ = async {
                while let Some(state) = state_rx.recv().await {
                    if state == RTCIceGathererState::Complete {
                        break;
                    }
                }
            } => false,
        }
    };
    Ok(timeout(wait, matched).await.unwrap_or(false))
}
