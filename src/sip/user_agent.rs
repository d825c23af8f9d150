//! User agent core (spec C5): owns the local address, the event bus
//! and session manager references, and the policy that decides what
//! happens to an inbound INVITE/BYE/CANCEL and to the response of an
//! outbound INVITE. Everything transaction-shaped is delegated to
//! `sip::transaction`; this module is pure orchestration.

use crate::allowlist::AllowList;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::session::SessionManager;
use crate::sip::dialog::{Dialog, DialogTable};
use crate::sip::message::{SipMessage, SipRequest, SipResponse};
use crate::sip::sdp;
use crate::sip::transaction::{
    build_ack, gen_branch, gen_call_id, gen_tag, request_transaction_id, ClientTransaction, ServerTransaction, SipSender,
    TransactionTable, TxnEvent, TxnIdentity,
};
use rsip::Method;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long an inbound INVITE waits for the application to call
/// `answer` before it's answered with `504 Server Time-out` (spec.md §4.5).
const ANSWER_TIMEOUT: Duration = Duration::from_secs(20);

/// A running outbound INVITE: the caller awaits its final response and
/// can independently ask the user agent to CANCEL it by identity, since
/// the driving `ClientTransaction` itself is consumed by the task that
/// runs it and can't be held onto directly (spec.md §4.3's "mint a
/// CANCEL from an in-progress INVITE" becomes, in this ownership model,
/// "mint a CANCEL from the INVITE's retained identity").
pub struct OutboundInvite {
    pub identity: TxnIdentity,
    handle: tokio::task::JoinHandle<Result<Option<SipResponse>>>,
}

impl OutboundInvite {
    pub async fn await_final(self) -> Result<Option<SipResponse>> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(Error::Invite(format!("invite task panicked: {e}"))),
        }
    }
}

pub struct UserAgent {
    local_addr: SocketAddr,
    local_user: String,
    transport: Arc<dyn SipSender>,
    table: Arc<TransactionTable>,
    dialogs: Arc<DialogTable>,
    session: Arc<SessionManager>,
    events: Arc<EventBus>,
    allowlist: Arc<dyn AllowList>,
    /// Pending inbound invites keyed by their server-transaction id, so
    /// an inbound CANCEL can interrupt the matching INVITE's wait for
    /// `answer` (spec.md §4.5 "Inbound CANCEL").
    pending_invites: Mutex<HashMap<String, CancellationToken>>,
}

impl UserAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_addr: SocketAddr,
        local_user: impl Into<String>,
        transport: Arc<dyn SipSender>,
        table: Arc<TransactionTable>,
        dialogs: Arc<DialogTable>,
        session: Arc<SessionManager>,
        events: Arc<EventBus>,
        allowlist: Arc<dyn AllowList>,
    ) -> Arc<Self> {
        Arc::new(UserAgent {
            local_addr,
            local_user: local_user.into(),
            transport,
            table,
            dialogs,
            session,
            events,
            allowlist,
            pending_invites: Mutex::new(HashMap::new()),
        })
    }

    fn local_contact(&self) -> String {
        format!("<sip:{}@{}:{}>", self.local_user, self.local_addr.ip(), self.local_addr.port())
    }

    /// Start an outbound INVITE to `remote`, offering SDP for a local
    /// RTP port of `sdp_port`. Returns immediately; the caller awaits
    /// `OutboundInvite::await_final` for the terminal response.
    pub fn invite(self: &Arc<Self>, remote: SocketAddr, sdp_port: u16) -> OutboundInvite {
        let from_tag = gen_tag();
        let call_id = gen_call_id();
        let branch = gen_branch(
            "",
            &from_tag,
            &call_id,
            &self.local_addr.ip().to_string(),
            self.local_addr.port(),
            1,
        );
        let identity = TxnIdentity {
            call_id,
            branch,
            from_tag,
            to_tag: String::new(),
            cseq: 1,
            local_addr: self.local_addr,
            remote_addr: remote,
        };

        let client = ClientTransaction::register(self.table.clone(), self.transport.clone(), Method::Invite, identity.clone());
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<TxnEvent>();
        let local_user = self.local_user.clone();
        let ua = self.clone();
        let invite_identity = identity.clone();

        tokio::spawn(async move {
            while let Some(event) = notify_rx.recv().await {
                match event {
                    TxnEvent::Provisional(resp) => debug!(code = resp.status_code, "outbound invite provisional"),
                    TxnEvent::TimedOut => warn!("outbound invite timed out"),
                    TxnEvent::Error(e) => warn!(error = %e, "outbound invite error"),
                    _ => {}
                }
            }
        });

        let handle = tokio::spawn(async move {
            let result = client.invite(&local_user, sdp_port, notify_tx).await;
            if let Ok(Some(ref response)) = result {
                if (200..300).contains(&response.status_code) {
                    if let Err(e) = ua.complete_outbound_invite(&invite_identity, response.clone()).await {
                        warn!(error = %e, "failed to finalize outbound invite dialog");
                    }
                }
            }
            result
        });

        OutboundInvite { identity, handle }
    }

    /// Build the dialog from a successful outbound INVITE response, ACK
    /// it directly over the transport (not a new transaction, per
    /// spec.md §4.5 "Response handling"), cache the remote media ports,
    /// and record the dialog.
    async fn complete_outbound_invite(self: &Arc<Self>, identity: &TxnIdentity, response: SipResponse) -> Result<()> {
        let to_tag = response.headers.to_tag.clone().unwrap_or_default();
        let remote_sdp = sdp::parse(&response.headers.body);

        let mut ack_identity = identity.clone();
        ack_identity.to_tag = to_tag.clone();
        let ack = build_ack(&ack_identity, &self.local_user);
        self.transport.send_to(&SipMessage::Request(ack), identity.remote_addr).await;

        let dialog = Dialog {
            call_id: identity.call_id.clone(),
            local_tag: identity.from_tag.clone(),
            remote_tag: to_tag,
            local_uri: format!("sip:{}@{}:{}", self.local_user, identity.local_addr.ip(), identity.local_addr.port()),
            remote_uri: format!("sip:{}:{}", identity.remote_addr.ip(), identity.remote_addr.port()),
            remote_target: format!("sip:{}:{}", identity.remote_addr.ip(), identity.remote_addr.port()),
            local_seq: identity.cseq,
            remote_seq: None,
            rtp_port: remote_sdp.as_ref().map(|s| s.rtp_port),
            rtcp_port: remote_sdp.as_ref().and_then(|s| s.rtcp_port),
        };
        self.dialogs.insert(dialog.clone());
        self.session.set_active_dialog(dialog);
        self.events.dispatch(Event::VoiceConnectionFinalized);
        Ok(())
    }

    /// Cancel an in-progress outbound INVITE by its retained identity
    /// (spec.md §4.3 "CANCEL construction"): a fresh CANCEL client
    /// transaction sharing the INVITE's branch/tags/Call-ID/CSeq.
    pub async fn cancel(self: &Arc<Self>, identity: &TxnIdentity) -> Result<()> {
        let client = ClientTransaction::register(self.table.clone(), self.transport.clone(), Method::Cancel, identity.clone());
        let (notify_tx, _notify_rx) = mpsc::unbounded_channel();
        client.non_invite(&self.local_user, notify_tx).await?;
        Ok(())
    }

    /// Send a BYE over an established dialog (spec.md §4.5 `bye(dialog)`).
    pub async fn bye(self: &Arc<Self>, dialog: &Dialog) -> Result<()> {
        let remote_ip = dialog.remote_ip()?;
        let remote_port: u16 = dialog
            .remote_uri
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(5060);
        let remote_addr: SocketAddr = format!("{remote_ip}:{remote_port}")
            .parse()
            .map_err(|_| Error::Protocol(format!("cannot parse dialog remote address: {}", dialog.remote_uri)))?;

        let identity = TxnIdentity {
            call_id: dialog.call_id.clone(),
            branch: gen_branch(
                &dialog.remote_tag,
                &dialog.local_tag,
                &dialog.call_id,
                &self.local_addr.ip().to_string(),
                self.local_addr.port(),
                dialog.local_seq + 1,
            ),
            from_tag: dialog.local_tag.clone(),
            to_tag: dialog.remote_tag.clone(),
            cseq: dialog.local_seq + 1,
            local_addr: self.local_addr,
            remote_addr,
        };
        let client = ClientTransaction::register(self.table.clone(), self.transport.clone(), Method::Bye, identity);
        let (notify_tx, _notify_rx) = mpsc::unbounded_channel();
        client.non_invite(&self.local_user, notify_tx).await?;
        self.dialogs.terminate(&dialog.id());
        self.session.cleanup();
        Ok(())
    }

    /// Entry point for the transport's routing step: called for every
    /// request that doesn't match an existing transaction (spec.md §4.5
    /// `createTransaction(msg)`). Dispatches by method.
    pub fn create_transaction(self: &Arc<Self>, request: SipRequest, peer: SocketAddr) {
        let ua = self.clone();
        match request.method {
            Method::Invite => {
                tokio::spawn(async move { ua.handle_invite(request, peer).await });
            }
            Method::Bye => {
                tokio::spawn(async move { ua.handle_bye(request, peer).await });
            }
            Method::Cancel => {
                tokio::spawn(async move { ua.handle_cancel(request, peer).await });
            }
            Method::Ack => {
                debug!("ACK outside any transaction ignored");
            }
            other => {
                info!(method = %other, "unsupported inbound method, dropping");
            }
        }
    }

    async fn handle_invite(self: Arc<Self>, request: SipRequest, peer: SocketAddr) {
        let invite_id = request_transaction_id(
            &request.headers.branch,
            &request.headers.via_host,
            request.headers.via_port,
            Method::Invite,
        );
        let srv = ServerTransaction::register(self.table.clone(), self.transport.clone(), request, self.local_addr);
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            if let Err(e) = srv.invite(resp_rx, notify_tx).await {
                warn!(error = %e, "server invite transaction error");
            }
        });

        let Some(TxnEvent::IncomingRequest(request)) = notify_rx.recv().await else {
            return;
        };

        if self.session.busy() {
            resp_tx.send(SipResponse::for_request(&request, 486, None, String::new())).ok();
            return;
        }
        if !self.allowlist.addresses().contains(&peer.ip()) {
            resp_tx.send(SipResponse::for_request(&request, 403, None, String::new())).ok();
            return;
        }

        let cancel = CancellationToken::new();
        self.session.set_active_invite(cancel.clone());
        self.pending_invites.lock().unwrap().insert(invite_id.clone(), cancel.clone());

        let to_tag = gen_tag();
        resp_tx
            .send(SipResponse::for_request(&request, 180, Some(to_tag.clone()), String::new()))
            .ok();
        self.events.dispatch(Event::InboundCall { from: peer });

        let answered = tokio::select! {
            _ = self.session.wait_for_answer() => true,
            _ = tokio::time::sleep(ANSWER_TIMEOUT) => false,
            _ = cancel.cancelled() => false,
        };

        self.pending_invites.lock().unwrap().remove(&invite_id);

        if cancel.is_cancelled() {
            resp_tx
                .send(SipResponse::for_request(&request, 487, Some(to_tag), String::new()))
                .ok();
            self.session.cleanup();
            return;
        }

        if !answered {
            resp_tx
                .send(SipResponse::for_request(&request, 504, Some(to_tag), String::new()))
                .ok();
            self.session.cleanup();
            return;
        }

        let remote_sdp = sdp::parse(&request.headers.body);
        let body = sdp::build(&self.local_addr.ip().to_string(), sdp::SIP_RTP_PORT);
        let ok = SipResponse::for_request(&request, 200, Some(to_tag.clone()), body).with_additional_header("Contact", &self.local_contact());
        resp_tx.send(ok).ok();

        let dialog = Dialog {
            call_id: request.headers.call_id.clone(),
            local_tag: to_tag,
            remote_tag: request.headers.from_tag.clone().unwrap_or_default(),
            local_uri: format!("sip:{}@{}:{}", self.local_user, self.local_addr.ip(), self.local_addr.port()),
            remote_uri: format!("sip:{}:{}", peer.ip(), peer.port()),
            remote_target: format!("sip:{}:{}", peer.ip(), peer.port()),
            local_seq: request.headers.cseq,
            remote_seq: Some(request.headers.cseq),
            rtp_port: remote_sdp.as_ref().map(|s| s.rtp_port),
            rtcp_port: remote_sdp.as_ref().and_then(|s| s.rtcp_port),
        };
        self.dialogs.insert(dialog.clone());
        self.session.set_active_dialog(dialog);
        self.session.clear_active_invite();
        self.events.dispatch(Event::InboundCallAccepted);
    }

    async fn handle_bye(self: Arc<Self>, request: SipRequest, _peer: SocketAddr) {
        let srv = ServerTransaction::register(self.table.clone(), self.transport.clone(), request, self.local_addr);
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            if let Err(e) = srv.non_invite(resp_rx, notify_tx).await {
                warn!(error = %e, "server BYE transaction error");
            }
        });

        let Some(TxnEvent::IncomingRequest(request)) = notify_rx.recv().await else {
            return;
        };
        resp_tx.send(SipResponse::for_request(&request, 200, request.headers.to_tag.clone(), String::new())).ok();

        if let Some(dialog) = self.session.active_dialog() {
            self.dialogs.terminate(&dialog.id());
        }
        self.session.cleanup();
        self.events.dispatch(Event::InboundCallEnded);
    }

    async fn handle_cancel(self: Arc<Self>, request: SipRequest, _peer: SocketAddr) {
        let invite_id = request_transaction_id(
            &request.headers.branch,
            &request.headers.via_host,
            request.headers.via_port,
            Method::Invite,
        );
        if let Some(token) = self.pending_invites.lock().unwrap().get(&invite_id).cloned() {
            token.cancel();
        } else {
            debug!(%invite_id, "CANCEL with no matching INVITE transaction");
        }

        let srv = ServerTransaction::register(self.table.clone(), self.transport.clone(), request, self.local_addr);
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            if let Err(e) = srv.non_invite(resp_rx, notify_tx).await {
                warn!(error = %e, "server CANCEL transaction error");
            }
        });

        if let Some(TxnEvent::IncomingRequest(request)) = notify_rx.recv().await {
            resp_tx.send(SipResponse::for_request(&request, 200, request.headers.to_tag.clone(), String::new())).ok();
        }
    }
}
