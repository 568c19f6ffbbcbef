//! Media seam between signaling and transport negotiation.
//!
//! The engine only ever speaks to [`MediaSession`], so tests drive the
//! call flow with fakes and never open sockets.  The production
//! implementation wraps a webrtc-rs peer connection configured with the
//! STUN set the clients use.

use std::sync::Arc;

use async_trait::async_trait;
use causerie_shared::constants::STUN_SERVERS;
use causerie_shared::records::IceCandidate;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use crate::error::MediaError;

#[async_trait]
pub trait MediaSession: Send + Sync + 'static {
    /// Create and install the local offer, returning its SDP.
    async fn create_offer(&self) -> Result<String, MediaError>;

    /// Install the remote offer and produce the local answer SDP.
    async fn create_answer(&self, offer_sdp: &str) -> Result<String, MediaError>;

    /// Install the remote answer to our earlier offer.
    async fn accept_answer(&self, answer_sdp: &str) -> Result<(), MediaError>;

    /// Feed one remote ICE candidate.  Only valid once the session has a
    /// remote description; the engine buffers until then.
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    /// Whether the transport reached a connected state.
    async fn transport_connected(&self) -> bool;

    async fn close(&self);
}

#[async_trait]
pub trait MediaFactory: Send + Sync + 'static {
    /// Build a session for one call.  Locally gathered candidates surface
    /// on `candidates` as they trickle in.
    async fn create_session(
        &self,
        is_video: bool,
        candidates: mpsc::Sender<IceCandidate>,
    ) -> Result<Box<dyn MediaSession>, MediaError>;
}

/// Production factory over webrtc-rs.
pub struct RtcMediaFactory;

#[async_trait]
impl MediaFactory for RtcMediaFactory {
    async fn create_session(
        &self,
        is_video: bool,
        candidates: mpsc::Sender<IceCandidate>,
    ) -> Result<Box<dyn MediaSession>, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let connection = Arc::new(api.new_peer_connection(config).await?);

        // Negotiate audio always, video only when asked; the node carries
        // no local tracks, the m-lines are what matters.
        connection
            .add_transceiver_from_kind(RTPCodecType::Audio, None)
            .await?;
        if is_video {
            connection
                .add_transceiver_from_kind(RTPCodecType::Video, None)
                .await?;
        }

        connection.on_ice_candidate(Box::new(move |candidate| {
            let candidates = candidates.clone();
            Box::pin(async move {
                // None marks the end of gathering.
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidates
                            .send(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_m_line_index: init.sdp_mline_index,
                            })
                            .await;
                    }
                    Err(error) => {
                        warn!(%error, "failed to serialize local ICE candidate");
                    }
                }
            })
        }));

        Ok(Box::new(RtcMediaSession { connection }))
    }
}

struct RtcMediaSession {
    connection: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaSession for RtcMediaSession {
    async fn create_offer(&self) -> Result<String, MediaError> {
        let offer = self.connection.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.connection.set_local_description(offer).await?;
        Ok(sdp)
    }

    async fn create_answer(&self, offer_sdp: &str) -> Result<String, MediaError> {
        let offer = RTCSessionDescription::offer(offer_sdp.to_string())?;
        self.connection.set_remote_description(offer).await?;
        let answer = self.connection.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        self.connection.set_local_description(answer).await?;
        Ok(sdp)
    }

    async fn accept_answer(&self, answer_sdp: &str) -> Result<(), MediaError> {
        let answer = RTCSessionDescription::answer(answer_sdp.to_string())?;
        self.connection.set_remote_description(answer).await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: None,
        };
        self.connection.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn transport_connected(&self) -> bool {
        matches!(
            self.connection.ice_connection_state(),
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed
        )
    }

    async fn close(&self) {
        if let Err(error) = self.connection.close().await {
            debug!(%error, "error closing peer connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offer_negotiates_requested_media() {
        let (tx, _rx) = mpsc::channel(16);
        let session = RtcMediaFactory
            .create_session(true, tx)
            .await
            .expect("peer connection");
        let sdp = session.create_offer().await.expect("offer");
        assert!(sdp.starts_with("v=0"));
        assert!(sdp.contains("m=audio"));
        assert!(sdp.contains("m=video"));
        session.close().await;
    }
}
