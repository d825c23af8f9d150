//! SIP UDP transport (spec C2): binds the signaling socket, decodes
//! inbound datagrams, and performs the single routing step that either
//! delivers a message to its transaction's queue or, for an unmatched
//! request, hands it off for server-transaction creation.

use crate::sip::message::{SipMessage, SipRequest};
use crate::sip::transaction::{request_transaction_id, response_transaction_id, SipSender, TransactionTable};
use rsip::Method;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const MAX_DATAGRAM: usize = 64 * 1024;

pub struct SipTransport {
    socket: UdpSocket,
}

impl SipTransport {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Arc::new(SipTransport { socket }))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive loop: decode, route to an existing transaction, or
    /// surface an unmatched request to the caller (the user agent
    /// creates the server transaction). Runs until the socket errors.
    pub async fn run(
        self: Arc<Self>,
        table: Arc<TransactionTable>,
        unmatched_requests: mpsc::UnboundedSender<(SipRequest, SocketAddr)>,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "SIP transport recv error");
                    continue;
                }
            };

            let message = match SipMessage::parse(&buf[..len]) {
                Ok(m) => m,
                Err(e) => {
                    debug!(error = %e, from = %peer, "dropping malformed SIP datagram");
                    continue;
                }
            };

            match message {
                SipMessage::Request(ref req) => {
                    let id = request_transaction_id(
                        &req.headers.branch,
                        &req.headers.via_host,
                        req.headers.via_port,
                        req.method,
                    );
                    if !table.route(&id, message.clone()) {
                        if req.method == Method::Ack {
                            debug!(%id, "orphan ACK discarded");
                            continue;
                        }
                        if unmatched_requests.send((req.clone(), peer)).is_err() {
                            warn!("unmatched-request channel closed, dropping request");
                        }
                    }
                }
                SipMessage::Response(ref resp) => {
                    let id = response_transaction_id(&resp.headers.branch, resp.headers.cseq_method);
                    if !table.route(&id, message.clone()) {
                        debug!(%id, "response with no matching transaction discarded");
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl SipSender for SipTransport {
    async fn send_to(&self, msg: &SipMessage, addr: SocketAddr) {
        let bytes = msg.to_bytes();
        if let Err(e) = self.socket.send_to(&bytes, addr).await {
            warn!(error = %e, %addr, "SIP transport send error");
        }
    }
}
