use causerie_shared::records::{CallKind, CallRecord};
use causerie_shared::{Alias, CallId};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

/// Signaling lifecycle of one call.  Idle is the absence of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Offered,
    Answered,
    Rejected,
    Ended,
}

/// What the engine has to do after a remote record was applied.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// The peer answered our offer; apply this SDP to the media session.
    Answer(String),
    /// The peer declined our offer.
    Reject,
    /// The peer hung up.
    End,
    /// Re-delivered, out-of-order, or malformed; nothing to do.
    Stale,
}

/// Pure per-call state.  Transitions are keyed on `(state, record type)`,
/// so the at-least-once replay of the store collapses to single-fire
/// steps: the first answer yields [`Step::Answer`], every later copy is
/// [`Step::Stale`].
pub struct CallSession {
    call_id: CallId,
    role: CallRole,
    peer: Alias,
    state: CallState,
    is_video: bool,
    /// The peer's SDP: the offer for a callee, the answer for a caller.
    remote_sdp: Option<String>,
}

impl CallSession {
    pub fn caller(call_id: CallId, peer: Alias, is_video: bool) -> Self {
        Self {
            call_id,
            role: CallRole::Caller,
            peer,
            state: CallState::Offered,
            is_video,
            remote_sdp: None,
        }
    }

    pub fn callee(call_id: CallId, peer: Alias, is_video: bool, offer_sdp: String) -> Self {
        Self {
            call_id,
            role: CallRole::Callee,
            peer,
            state: CallState::Offered,
            is_video,
            remote_sdp: Some(offer_sdp),
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn peer(&self) -> &Alias {
        &self.peer
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn is_video(&self) -> bool {
        self.is_video
    }

    /// The offer SDP a ringing callee is holding.
    pub fn offer_sdp(&self) -> Option<&str> {
        match self.role {
            CallRole::Callee => self.remote_sdp.as_deref(),
            CallRole::Caller => None,
        }
    }

    /// Apply a record written by the peer.  Never called with our own
    /// echoes; the engine filters those by `from` first.
    pub fn apply_remote(&mut self, record: &CallRecord) -> Step {
        match (self.state, record.kind) {
            (CallState::Offered, CallKind::Answer) if self.role == CallRole::Caller => {
                match record.answer_sdp.clone() {
                    Some(sdp) => {
                        self.state = CallState::Answered;
                        self.remote_sdp = Some(sdp.clone());
                        debug!(call = %self.call_id, "offer answered");
                        Step::Answer(sdp)
                    }
                    None => {
                        debug!(call = %self.call_id, "answer record without SDP");
                        Step::Stale
                    }
                }
            }
            (CallState::Offered, CallKind::Reject) if self.role == CallRole::Caller => {
                self.state = CallState::Rejected;
                debug!(call = %self.call_id, "offer rejected");
                Step::Reject
            }
            (state, CallKind::End) if state != CallState::Ended => {
                self.state = CallState::Ended;
                debug!(call = %self.call_id, "remote hangup");
                Step::End
            }
            _ => Step::Stale,
        }
    }

    /// Local accept on the callee side.  Returns false when the session is
    /// not a ringing callee.
    pub fn answer_locally(&mut self) -> bool {
        if self.role == CallRole::Callee && self.state == CallState::Offered {
            self.state = CallState::Answered;
            true
        } else {
            false
        }
    }

    /// Local decline on the callee side.
    pub fn reject_locally(&mut self) -> bool {
        if self.role == CallRole::Callee && self.state == CallState::Offered {
            self.state = CallState::Rejected;
            true
        } else {
            false
        }
    }

    /// Local hangup from any live state.
    pub fn end_locally(&mut self) -> bool {
        if self.state != CallState::Ended {
            self.state = CallState::Ended;
            true
        } else {
            false
        }
    }
}
