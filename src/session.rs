//! Session manager (spec C9): enforces the single-call invariant
//! (spec.md §3 invariant (c)), exposes the `answerCall`/`sessionStart`
//! signals the user agent and Discord voice gateway wait on, and owns
//! the two RTP endpoints for the lifetime of a call.

use crate::rtp::RtpEndpoint;
use crate::sip::dialog::Dialog;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Default)]
struct SessionState {
    active_invite: Option<CancellationToken>,
    active_dialog: Option<Dialog>,
    sip_rtp: Option<Arc<RtpEndpoint>>,
    discord_rtp: Option<Arc<RtpEndpoint>>,
}

/// Per-service singleton (spec.md §5): at most one active invite or
/// dialog at a time, never both populated simultaneously.
pub struct SessionManager {
    state: std::sync::Mutex<SessionState>,
    answer_call: Notify,
    session_start: Notify,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        SessionManager {
            state: std::sync::Mutex::new(SessionState::default()),
            answer_call: Notify::new(),
            session_start: Notify::new(),
        }
    }

    pub fn busy(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.active_invite.is_some() || state.active_dialog.is_some()
    }

    pub fn set_active_invite(&self, cancel: CancellationToken) {
        self.state.lock().unwrap().active_invite = Some(cancel);
    }

    pub fn active_invite(&self) -> Option<CancellationToken> {
        self.state.lock().unwrap().active_invite.clone()
    }

    /// Clear the pending-invite slot once it has resolved into a
    /// dialog (or otherwise stopped being "pending"), so invariant (c)
    /// never sees both populated at once.
    pub fn clear_active_invite(&self) {
        self.state.lock().unwrap().active_invite = None;
    }

    pub fn set_active_dialog(&self, dialog: Dialog) {
        self.state.lock().unwrap().active_dialog = Some(dialog);
    }

    pub fn active_dialog(&self) -> Option<Dialog> {
        self.state.lock().unwrap().active_dialog.clone()
    }

    pub fn set_rtp_endpoints(&self, sip_rtp: Arc<RtpEndpoint>, discord_rtp: Arc<RtpEndpoint>) {
        let mut state = self.state.lock().unwrap();
        state.sip_rtp = Some(sip_rtp);
        state.discord_rtp = Some(discord_rtp);
        drop(state);
        self.session_start.notify_waiters();
    }

    /// Set by the user when accepting an inbound call.
    pub fn answer_incoming_call(&self) {
        self.answer_call.notify_one();
    }

    pub async fn wait_for_answer(&self) {
        self.answer_call.notified().await;
    }

    pub async fn wait_for_session(&self) {
        self.session_start.notified().await;
    }

    /// Clear session state and signals, stopping both RTP endpoints.
    pub fn cleanup(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(cancel) = state.active_invite.take() {
            cancel.cancel();
        }
        state.active_dialog = None;
        if let Some(rtp) = state.sip_rtp.take() {
            rtp.stop();
        }
        if let Some(rtp) = state.discord_rtp.take() {
            rtp.stop();
        }
        info!("session cleaned up");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_reflects_active_invite_or_dialog() {
        let mgr = SessionManager::new();
        assert!(!mgr.busy());
        mgr.set_active_invite(CancellationToken::new());
        assert!(mgr.busy());
        mgr.cleanup();
        assert!(!mgr.busy());
    }

    #[tokio::test]
    async fn answer_call_signal_wakes_waiter() {
        let mgr = Arc::new(SessionManager::new());
        let waiter = mgr.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_for_answer().await;
        });
        tokio::task::yield_now().await;
        mgr.answer_incoming_call();
        handle.await.unwrap();
    }
}
