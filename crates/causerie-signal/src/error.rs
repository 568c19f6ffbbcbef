use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),
}

impl From<webrtc::Error> for MediaError {
    fn from(e: webrtc::Error) -> Self {
        MediaError::WebRtc(e.to_string())
    }
}
