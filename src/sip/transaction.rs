//! Client and server transaction state machines (spec C3).
//!
//! Each transaction owns a receive queue fed by the transport's routing
//! step and drives retransmission under T1/T2/T4 with exponential
//! back-off, exactly as a SIP/2.0 UDP stack must since the network
//! gives no delivery guarantee. State changes and terminal outcomes are
//! reported to the user agent over `notify_tu`; nothing here talks to
//! the UDP socket directly, only through the `SipSender` the caller
//! supplies.

use crate::error::{Error, Result};
use crate::sip::message::{is_final, is_provisional, SipMessage, SipRequest, SipResponse};
use crate::sip::sdp;
use rsip::Method;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";
pub const T1: Duration = Duration::from_millis(500);
pub const T2: Duration = Duration::from_secs(4);
pub const T4: Duration = Duration::from_secs(5);
/// 64 * T1, the overall transaction timeout RFC 3261 calls Timer B/F.
pub const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(32);
/// How long a completed client INVITE keeps re-ACKing duplicate finals.
pub const ANSWER_DUPLICATES_DURATION: Duration = Duration::from_secs(32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Trying,
    Calling,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

pub fn gen_tag() -> String {
    format!("{:x}", rand::random::<u32>())
}

pub fn gen_call_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{nanos:x}{:x}", rand::random::<u32>())
}

/// `z9hG4bK` + MD5(toTag | fromTag | callID | "SIP/2.0/UDP host:port;" | CSeq),
/// per spec.md §4.3. Deliberately not delegated to any generic SIP
/// library's branch generator, which would not match this algorithm.
pub fn gen_branch(to_tag: &str, from_tag: &str, call_id: &str, host: &str, port: u16, seq: u32) -> String {
    let preimage = format!("{to_tag}{from_tag}{call_id}SIP/2.0/UDP {host}:{port};{seq}");
    let digest = md5::compute(preimage.as_bytes());
    format!("{BRANCH_MAGIC_COOKIE}{digest:x}")
}

/// Matching ID used by the transport's routing step to find the
/// transaction an inbound *request* belongs to: spec.md §3,
/// `branch + viaIP + viaPort + matchMethod`, where ACK is rewritten to
/// INVITE so it lands in the still-open INVITE server transaction.
pub fn request_transaction_id(branch: &str, via_host: &str, via_port: u16, method: Method) -> String {
    let match_method = if method == Method::Ack { Method::Invite } else { method };
    format!("{branch}{via_host}{via_port}{match_method}")
}

/// Matching ID used to route an inbound *response* to the client
/// transaction that sent the request: spec.md §3, `branch + CSeq-method`.
pub fn response_transaction_id(branch: &str, cseq_method: Method) -> String {
    format!("{branch}{cseq_method}")
}

/// Process-wide mapping from transaction ID to that transaction's
/// receive queue (spec.md §3 invariant (a): at most one transaction per
/// ID at any instant). Accessed only from async tasks on the same
/// runtime; a `Mutex` is enough, no cross-thread contention is expected
/// (spec.md §5).
#[derive(Default)]
pub struct TransactionTable {
    inner: Mutex<HashMap<String, mpsc::UnboundedSender<SipMessage>>>,
}

impl TransactionTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, id: String, sender: mpsc::UnboundedSender<SipMessage>) {
        self.inner.lock().unwrap().insert(id, sender);
    }

    pub fn remove(&self, id: &str) {
        self.inner.lock().unwrap().remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().unwrap().contains_key(id)
    }

    /// Route a parsed message to its transaction's queue. Returns
    /// `false` if no matching transaction exists (orphan ACK or
    /// response, per spec.md §4.2).
    pub fn route(&self, id: &str, msg: SipMessage) -> bool {
        let sender = self.inner.lock().unwrap().get(id).cloned();
        match sender {
            Some(sender) => sender.send(msg).is_ok(),
            None => false,
        }
    }
}

/// Something that can push a message onto the wire. Implemented by the
/// SIP UDP transport (C2); kept as a trait so the transaction layer
/// never depends on socket machinery directly.
#[async_trait::async_trait]
pub trait SipSender: Send + Sync {
    async fn send_to(&self, msg: &SipMessage, addr: SocketAddr);
}

/// Outcome delivered to the user agent over a transaction's notify
/// channel: every provisional, the terminal response (or absence of
/// one), and incoming requests for server transactions.
#[derive(Debug, Clone)]
pub enum TxnEvent {
    Provisional(SipResponse),
    Final(SipResponse),
    IncomingRequest(SipRequest),
    TimedOut,
    Error(String),
}

/// Identity shared by every transaction regardless of role: spec.md §3
/// "Transaction" fields.
#[derive(Debug, Clone)]
pub struct TxnIdentity {
    pub call_id: String,
    pub branch: String,
    pub from_tag: String,
    pub to_tag: String,
    pub cseq: u32,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
}

fn build_request(
    method: Method,
    identity: &TxnIdentity,
    local_user: &str,
    body: String,
    extra_headers: Vec<(String, String)>,
) -> Result<SipRequest> {
    let from_uri = rsip::Uri::try_from(format!(
        "sip:{local_user}@{}:{}",
        identity.local_addr.ip(),
        identity.local_addr.port()
    ))?;
    let to_uri = rsip::Uri::try_from(format!(
        "sip:{}:{}",
        identity.remote_addr.ip(),
        identity.remote_addr.port()
    ))?;
    let mut request = SipRequest::new(
        method,
        identity.remote_addr.ip().to_string(),
        identity.remote_addr.port(),
        identity.local_addr.ip().to_string(),
        identity.local_addr.port(),
        identity.branch.clone(),
        from_uri,
        Some(identity.from_tag.clone()),
        to_uri,
        if identity.to_tag.is_empty() {
            None
        } else {
            Some(identity.to_tag.clone())
        },
        identity.call_id.clone(),
        identity.cseq,
        body,
    );
    for (k, v) in extra_headers {
        request = request.with_additional_header(&k, &v);
    }
    Ok(request)
}

/// Client-role transaction (spec.md §4.3 "Client INVITE" / "Client
/// non-INVITE"): owns retransmission of an outgoing request until a
/// final response arrives, times out, or (for INVITE) is cancelled.
pub struct ClientTransaction {
    pub identity: TxnIdentity,
    pub method: Method,
    table: Arc<TransactionTable>,
    transport: Arc<dyn SipSender>,
    recv_rx: mpsc::UnboundedReceiver<SipMessage>,
}

impl ClientTransaction {
    pub fn id(&self) -> String {
        response_transaction_id(&self.identity.branch, self.method)
    }

    /// Register a new client transaction for `method`, generating a
    /// fresh branch (and, if `identity.call_id`/tags are not already
    /// populated by a dialog, fresh tag/Call-ID values too).
    pub fn register(
        table: Arc<TransactionTable>,
        transport: Arc<dyn SipSender>,
        method: Method,
        identity: TxnIdentity,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = response_transaction_id(&identity.branch, method);
        table.insert(id, tx);
        ClientTransaction {
            identity,
            method,
            table,
            transport,
            recv_rx: rx,
        }
    }

    /// Mint a CANCEL transaction from an in-progress client INVITE,
    /// inheriting branch/tags/Call-ID/CSeq per spec.md §4.3 "CANCEL
    /// construction". Only legal against an INVITE.
    pub fn cancel_from_invite(
        table: Arc<TransactionTable>,
        transport: Arc<dyn SipSender>,
        invite: &ClientTransaction,
    ) -> Result<ClientTransaction> {
        if invite.method != Method::Invite {
            return Err(Error::Invite("CANCEL can only be derived from an INVITE transaction".into()));
        }
        Ok(ClientTransaction::register(
            table,
            transport,
            Method::Cancel,
            invite.identity.clone(),
        ))
    }

    fn terminate(&self) {
        self.table.remove(&self.id());
    }

    /// Drive the client INVITE state machine through to a final
    /// response, notifying `notify_tu` along the way. Returns the final
    /// response (or `None` on overall timeout).
    pub async fn invite(
        mut self,
        local_user: &str,
        sdp_port: u16,
        notify_tu: mpsc::UnboundedSender<TxnEvent>,
    ) -> Result<Option<SipResponse>> {
        let mut state = TxnState::Calling;
        let body = sdp::build(&self.identity.local_addr.ip().to_string(), sdp_port);
        let request = build_request(
            Method::Invite,
            &self.identity,
            local_user,
            body,
            vec![
                (
                    "Contact".into(),
                    format!("<sip:{local_user}@{}>", self.identity.local_addr.ip()),
                ),
                ("Max-Forwards".into(), "70".into()),
            ],
        )?;

        let outcome = timeout(TRANSACTION_TIMEOUT, async {
            let mut attempts: u32 = 0;
            loop {
                self.transport
                    .send_to(&SipMessage::Request(request.clone()), self.identity.remote_addr)
                    .await;
                let retransmit = T1 * 2u32.pow(attempts.min(16));
                match timeout(retransmit, self.recv_rx.recv()).await {
                    Ok(Some(SipMessage::Response(resp))) => return Some(resp),
                    Ok(Some(_)) | Ok(None) => return None,
                    Err(_) => attempts += 1,
                }
            }
        })
        .await
        .unwrap_or(None);

        let Some(mut response) = outcome else {
            notify_tu.send(TxnEvent::TimedOut).ok();
            self.terminate();
            return Ok(None);
        };

        while is_provisional(response.status_code) {
            state = TxnState::Proceeding;
            notify_tu.send(TxnEvent::Provisional(response.clone())).ok();
            debug!(state = ?state, code = response.status_code, "client invite provisional");
            match self.recv_rx.recv().await {
                Some(SipMessage::Response(next)) => response = next,
                _ => break,
            }
        }

        if (200..300).contains(&response.status_code) {
            notify_tu.send(TxnEvent::Final(response.clone())).ok();
            self.terminate();
            Ok(Some(response))
        } else if is_final(response.status_code) {
            state = TxnState::Completed;
            notify_tu.send(TxnEvent::Final(response.clone())).ok();
            let ack = build_ack(&self.identity, local_user);
            self.transport
                .send_to(&SipMessage::Request(ack.clone()), self.identity.remote_addr)
                .await;
            let transport = self.transport.clone();
            let remote = self.identity.remote_addr;
            let table = self.table.clone();
            let id = self.id();
            tokio::spawn(async move {
                let _ = timeout(ANSWER_DUPLICATES_DURATION, async {
                    loop {
                        match self.recv_rx.recv().await {
                            Some(SipMessage::Response(r)) if r.headers.cseq_method == Method::Invite => {
                                transport
                                    .send_to(&SipMessage::Request(ack.clone()), remote)
                                    .await;
                            }
                            None => break,
                            _ => {}
                        }
                    }
                })
                .await;
                table.remove(&id);
            });
            debug!(state = ?state, "client invite completed");
            Ok(Some(response))
        } else {
            warn!(code = response.status_code, "invalid status code on client invite");
            self.terminate();
            Err(Error::Invite(format!("invalid status code {}", response.status_code)))
        }
    }

    /// Drive a client non-INVITE transaction (BYE, CANCEL, REGISTER,
    /// OPTIONS): spec.md §4.3 "Client non-INVITE".
    pub async fn non_invite(
        mut self,
        local_user: &str,
        notify_tu: mpsc::UnboundedSender<TxnEvent>,
    ) -> Result<Option<SipResponse>> {
        let request = build_request(self.method, &self.identity, local_user, String::new(), vec![])?;

        let outcome = timeout(TRANSACTION_TIMEOUT, async {
            let mut attempts: u32 = 0;
            loop {
                self.transport
                    .send_to(&SipMessage::Request(request.clone()), self.identity.remote_addr)
                    .await;
                let retransmit = std::cmp::min(T2, T1 * 2u32.pow(attempts.min(16)));
                match timeout(retransmit, self.recv_rx.recv()).await {
                    Ok(Some(SipMessage::Response(resp))) if is_provisional(resp.status_code) => {
                        notify_tu.send(TxnEvent::Provisional(resp)).ok();
                    }
                    Ok(Some(SipMessage::Response(resp))) => return Some(resp),
                    Ok(Some(_)) | Ok(None) => return None,
                    Err(_) => attempts += 1,
                }
            }
        })
        .await
        .unwrap_or(None);

        let Some(response) = outcome else {
            notify_tu.send(TxnEvent::TimedOut).ok();
            self.terminate();
            return Ok(None);
        };

        notify_tu.send(TxnEvent::Final(response.clone())).ok();
        let table = self.table.clone();
        let id = self.id();
        tokio::spawn(async move {
            let _ = timeout(T4, self.recv_rx.recv()).await;
            table.remove(&id);
        });
        Ok(Some(response))
    }
}

/// Build an ACK request from a `TxnIdentity` directly, per spec.md
/// §4.5 "an ACK request built from the response, not a new transaction"
/// (RFC 3261 §13.2.2.4): used both by the client INVITE machine for
/// non-2xx finals and by the user agent for 2xx finals, which it must
/// ACK itself since the transaction terminates without doing so.
pub fn build_ack(identity: &TxnIdentity, local_user: &str) -> SipRequest {
    build_request(Method::Ack, identity, local_user, String::new(), vec![])
        .expect("identity addresses are already valid URIs")
}

/// Server-role transaction (spec.md §4.3 "Server INVITE" / "Server
/// non-INVITE"): answers an inbound request, resending the latest
/// response on each retransmitted request until the peer's side of the
/// exchange is acknowledged.
pub struct ServerTransaction {
    pub identity: TxnIdentity,
    pub request: SipRequest,
    table: Arc<TransactionTable>,
    transport: Arc<dyn SipSender>,
    recv_rx: mpsc::UnboundedReceiver<SipMessage>,
}

impl ServerTransaction {
    pub fn id(&self) -> String {
        request_transaction_id(
            &self.identity.branch,
            &self.identity.remote_addr.ip().to_string(),
            self.identity.remote_addr.port(),
            self.request.method,
        )
    }

    pub fn register(
        table: Arc<TransactionTable>,
        transport: Arc<dyn SipSender>,
        request: SipRequest,
        local_addr: SocketAddr,
    ) -> Self {
        let remote_addr = SocketAddr::new(
            request.headers.via_host.parse().unwrap_or(local_addr.ip()),
            request.headers.via_port,
        );
        let identity = TxnIdentity {
            call_id: request.headers.call_id.clone(),
            branch: request.headers.branch.clone(),
            from_tag: request.headers.from_tag.clone().unwrap_or_default(),
            to_tag: gen_tag(),
            cseq: request.headers.cseq,
            local_addr,
            remote_addr,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let id = request_transaction_id(
            &identity.branch,
            &remote_addr.ip().to_string(),
            remote_addr.port(),
            request.method,
        );
        table.insert(id, tx);
        ServerTransaction {
            identity,
            request,
            table,
            transport,
            recv_rx: rx,
        }
    }

    fn build_response(&self, status_code: u16, body: String) -> SipResponse {
        let mut response = SipResponse::for_request(&self.request, status_code, Some(self.identity.to_tag.clone()), body);
        response = response.with_additional_header(
            "Contact",
            &format!("<sip:{}:{}>", self.identity.local_addr.ip(), self.identity.local_addr.port()),
        );
        response
    }

    /// Run the server INVITE machine. `responses` is fed by the user
    /// agent: the first response is typically `180 Ringing` and the
    /// last one a final response, per spec.md §4.5's inbound INVITE
    /// policy.
    pub async fn invite(
        mut self,
        mut responses: mpsc::UnboundedReceiver<SipResponse>,
        notify_tu: mpsc::UnboundedSender<TxnEvent>,
    ) -> Result<()> {
        notify_tu.send(TxnEvent::IncomingRequest(self.request.clone())).ok();

        let mut current = self.build_response(100, String::new());
        loop {
            if !is_provisional(current.status_code) {
                break;
            }
            self.transport
                .send_to(&SipMessage::Response(current.clone()), self.identity.remote_addr)
                .await;
            tokio::select! {
                next = responses.recv() => {
                    match next {
                        Some(resp) => current = resp,
                        None => break,
                    }
                }
                msg = self.recv_rx.recv() => {
                    if msg.is_none() {
                        break;
                    }
                }
            }
        }

        if (200..300).contains(&current.status_code) {
            self.transport
                .send_to(&SipMessage::Response(current.clone()), self.identity.remote_addr)
                .await;
            self.table.remove(&self.id());
        } else {
            self.transport
                .send_to(&SipMessage::Response(current.clone()), self.identity.remote_addr)
                .await;
            let mut attempts: u32 = 0;
            let acked = timeout(TRANSACTION_TIMEOUT, async {
                loop {
                    let retransmit = std::cmp::min(T2, T1 * 2u32.pow(attempts.min(16)));
                    match timeout(retransmit, self.recv_rx.recv()).await {
                        Ok(Some(SipMessage::Request(req))) if req.method == Method::Ack => return true,
                        Ok(Some(_)) => {}
                        Ok(None) => return false,
                        Err(_) => {
                            attempts += 1;
                            self.transport
                                .send_to(&SipMessage::Response(current.clone()), self.identity.remote_addr)
                                .await;
                        }
                    }
                }
            })
            .await
            .unwrap_or(false);

            if acked {
                let table = self.table.clone();
                let id = self.id();
                tokio::spawn(async move {
                    let _ = timeout(T4, self.recv_rx.recv()).await;
                    table.remove(&id);
                });
            } else {
                self.table.remove(&self.id());
            }
        }
        Ok(())
    }

    /// Server non-INVITE machine: spec.md §4.3 "Server non-INVITE".
    pub async fn non_invite(
        mut self,
        mut responses: mpsc::UnboundedReceiver<SipResponse>,
        notify_tu: mpsc::UnboundedSender<TxnEvent>,
    ) -> Result<()> {
        notify_tu.send(TxnEvent::IncomingRequest(self.request.clone())).ok();

        let mut last_response = None;
        while let Some(response) = responses.recv().await {
            self.transport
                .send_to(&SipMessage::Response(response.clone()), self.identity.remote_addr)
                .await;
            let provisional = is_provisional(response.status_code);
            last_response = Some(response);
            if !provisional {
                break;
            }
        }

        let table = self.table.clone();
        let id = self.id();
        let transport = self.transport.clone();
        let remote = self.identity.remote_addr;
        tokio::spawn(async move {
            let _ = timeout(TRANSACTION_TIMEOUT, async {
                loop {
                    match self.recv_rx.recv().await {
                        Some(SipMessage::Request(_)) => {
                            if let Some(resp) = &last_response {
                                transport.send_to(&SipMessage::Response(resp.clone()), remote).await;
                            }
                        }
                        None => break,
                        _ => {}
                    }
                }
            })
            .await;
            table.remove(&id);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retransmit_schedule_doubles_until_cap() {
        let schedule: Vec<Duration> = (0..4).map(|a| T1 * 2u32.pow(a)).collect();
        assert_eq!(schedule[0], Duration::from_millis(500));
        assert_eq!(schedule[1], Duration::from_millis(1000));
        assert_eq!(schedule[2], Duration::from_millis(2000));
        assert_eq!(schedule[3], Duration::from_millis(4000));
    }

    #[test]
    fn non_invite_schedule_caps_at_t2() {
        let capped: Vec<Duration> = (0..5).map(|a| std::cmp::min(T2, T1 * 2u32.pow(a))).collect();
        assert_eq!(capped[3], Duration::from_millis(4000));
        assert_eq!(capped[4], T2);
    }

    #[test]
    fn request_id_rewrites_ack_to_invite() {
        let id_ack = request_transaction_id("z9hG4bKabc", "10.0.0.1", 5060, Method::Ack);
        let id_invite = request_transaction_id("z9hG4bKabc", "10.0.0.1", 5060, Method::Invite);
        assert_eq!(id_ack, id_invite);
    }

    #[test]
    fn response_id_uses_branch_and_cseq_method() {
        let id = response_transaction_id("z9hG4bKabc", Method::Invite);
        assert_eq!(id, "z9hG4bKabcINVITE");
    }

    #[test]
    fn branch_is_deterministic_for_same_inputs() {
        let b1 = gen_branch("to", "from", "callid", "10.0.0.1", 5060, 1);
        let b2 = gen_branch("to", "from", "callid", "10.0.0.1", 5060, 1);
        assert_eq!(b1, b2);
        assert!(b1.starts_with(BRANCH_MAGIC_COOKIE));
    }
}
