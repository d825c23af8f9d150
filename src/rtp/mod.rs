//! RTP/RTCP relay engine (spec C8): parses and re-serializes RTP/RTCP
//! datagrams, rewrites SSRC, applies Discord's "rtpsize" AEAD framing
//! on the encrypted side, and forwards packets between a cross-wired
//! pair of endpoints.
//!
//! Header parsing and the nonce-trailer convention here are specific
//! to Discord's voice UDP protocol and to this bridge's SIP-side
//! cleartext leg; no general-purpose RTP crate in this tree models
//! both, so this module hand-rolls both directions (`rtp-rs` is kept
//! only as a dev-dependency for building fixtures in tests).

use crate::error::{Error, Result};
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEFAULT_HEADER_SIZE: usize = 12;
const CSRC_SIZE: usize = 4;
const EXTENSION_SIZE: usize = 4;
const NONCE_SIZE: usize = 24;
const NONCE_COUNT_SIZE: usize = 4;
const RTCP_HEADER_SIZE: usize = 8;

/// Discord IP-discovery request/response magic (spec.md §4.7-2).
const DISCOVERY_REQUEST_TYPE: u16 = 0x0001;
const DISCOVERY_RESPONSE_TYPE: u16 = 0x0002;
const DISCOVERY_LENGTH: u16 = 0x0046;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Rtp,
    Rtcp,
}

/// A parsed RTP or RTCP datagram (spec.md §3 "RTP message").
#[derive(Debug, Clone)]
pub struct RtpMessage {
    pub kind: PacketKind,
    pub version_flags: u8,
    pub payload_type: u8,
    pub header: Vec<u8>,
    pub payload: Vec<u8>,
    /// 24-byte nonce when encrypted, empty otherwise.
    pub nonce: Vec<u8>,
}

impl RtpMessage {
    pub fn parse(packet: &[u8], encrypted: bool) -> Result<RtpMessage> {
        if packet.len() < 2 {
            return Err(Error::Protocol("RTP packet too short".into()));
        }
        let version_flags = packet[0];
        let payload_type_byte = packet[1];

        let (kind, header_len) = if (200..=204).contains(&payload_type_byte) {
            (PacketKind::Rtcp, RTCP_HEADER_SIZE)
        } else {
            let extension_bit = version_flags & 0b0001_0000 != 0;
            let csrc_count = (version_flags & 0b0000_1111) as usize;
            let len = DEFAULT_HEADER_SIZE + csrc_count * CSRC_SIZE + if extension_bit { EXTENSION_SIZE } else { 0 };
            (PacketKind::Rtp, len)
        };

        if packet.len() < header_len {
            return Err(Error::Protocol("RTP packet shorter than its header".into()));
        }
        let header = packet[..header_len].to_vec();

        let (payload, nonce) = if encrypted {
            if packet.len() < header_len + NONCE_COUNT_SIZE {
                return Err(Error::Protocol("encrypted RTP packet missing nonce trailer".into()));
            }
            let payload_end = packet.len() - NONCE_COUNT_SIZE;
            let payload = packet[header_len..payload_end].to_vec();
            let mut nonce = packet[payload_end..].to_vec();
            nonce.resize(NONCE_SIZE, 0);
            (payload, nonce)
        } else {
            (packet[header_len..].to_vec(), Vec::new())
        };

        Ok(RtpMessage {
            kind,
            version_flags,
            payload_type: payload_type_byte,
            header,
            payload,
            nonce,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.header.clone();
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.nonce[..self.nonce.len().min(NONCE_COUNT_SIZE)]);
        out
    }

    /// Strip the RTP extension header: some SIP-side equipment rejects
    /// packets carrying one (spec.md §4.8 send path, cleartext branch).
    pub fn strip_extension_header(&mut self) {
        if self.kind != PacketKind::Rtp {
            return;
        }
        const EXTENSION_BIT: u8 = 0b0001_0000;
        if self.version_flags & EXTENSION_BIT == 0 {
            return;
        }
        if self.header.len() < 16 {
            return;
        }
        let extension_length = u16::from_be_bytes([self.header[14], self.header[15]]) as usize;
        self.version_flags ^= EXTENSION_BIT;
        let mut new_header = vec![self.version_flags];
        new_header.extend_from_slice(&self.header[1..DEFAULT_HEADER_SIZE]);
        self.header = new_header;
        let drop_bytes = extension_length * EXTENSION_SIZE;
        if drop_bytes <= self.payload.len() {
            self.payload.drain(..drop_bytes);
        }
    }

    pub fn set_ssrc(&mut self, ssrc: u32) -> Result<()> {
        let bytes = ssrc.to_be_bytes();
        match self.kind {
            PacketKind::Rtp if self.header.len() >= 12 => {
                self.header[8..12].copy_from_slice(&bytes);
                Ok(())
            }
            PacketKind::Rtcp if self.header.len() >= 8 => {
                self.header[4..8].copy_from_slice(&bytes);
                Ok(())
            }
            _ => Err(Error::Protocol("RTP header too short to rewrite SSRC".into())),
        }
    }
}

/// A UDP endpoint for one side of the bridge: optionally SSRC-rewriting,
/// optionally AEAD-encrypted, optionally cross-wired to a peer endpoint
/// it forwards decoded packets to (spec.md §4.8 "RtpEndpoint").
pub struct RtpEndpoint {
    socket: UdpSocket,
    remote_addr: Mutex<Option<SocketAddr>>,
    /// Distinct RTCP remote address (spec.md §6 fallback: RTP port + 1
    /// when the peer doesn't advertise `a=rtcp:`); `None` means RTCP is
    /// multiplexed onto `remote_addr` like every other leg this bridge
    /// terminates.
    remote_ctrl_addr: Mutex<Option<SocketAddr>>,
    ssrc: Mutex<Option<u32>>,
    pub encrypted: bool,
    nonce_counter: AtomicU32,
    secret: Mutex<Option<XChaCha20Poly1305>>,
    peer: Mutex<Option<Weak<RtpEndpoint>>>,
    ctrl_peer: Mutex<Option<Weak<RtpEndpoint>>>,
    public_ip: Mutex<Option<String>>,
    public_ip_discovered: Notify,
    cancel: CancellationToken,
}

impl RtpEndpoint {
    pub async fn bind(local_addr: SocketAddr, ssrc: Option<u32>, encrypted: bool) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(local_addr)
            .await
            .map_err(|e| Error::Io { addr: local_addr, source: e })?;
        let endpoint = Arc::new(RtpEndpoint {
            socket,
            remote_addr: Mutex::new(None),
            remote_ctrl_addr: Mutex::new(None),
            ssrc: Mutex::new(ssrc),
            encrypted,
            nonce_counter: AtomicU32::new(0),
            secret: Mutex::new(None),
            peer: Mutex::new(None),
            ctrl_peer: Mutex::new(None),
            public_ip: Mutex::new(None),
            public_ip_discovered: Notify::new(),
            cancel: CancellationToken::new(),
        });
        Ok(endpoint)
    }

    pub fn set_remote_addr(&self, addr: SocketAddr) {
        *self.remote_addr.lock().unwrap() = Some(addr);
    }

    /// Give this endpoint a control-plane remote address distinct from
    /// `remote_addr`, for peers that advertise (or imply, per spec.md
    /// §6's `+1` fallback) a separate RTCP port.
    pub fn set_remote_ctrl_addr(&self, addr: SocketAddr) {
        *self.remote_ctrl_addr.lock().unwrap() = Some(addr);
    }

    pub fn set_secret_key(&self, key: [u8; 32]) {
        *self.secret.lock().unwrap() = Some(XChaCha20Poly1305::new((&key).into()));
    }

    pub fn public_ip(&self) -> Option<String> {
        self.public_ip.lock().unwrap().clone()
    }

    pub async fn wait_for_public_ip(&self) {
        if self.public_ip().is_some() {
            return;
        }
        self.public_ip_discovered.notified().await;
    }

    /// Cross-link two endpoints (and, if given, their control
    /// endpoints) into a live bridge (spec.md §4.8 "Proxy wiring").
    pub fn proxy(x: &Arc<RtpEndpoint>, y: &Arc<RtpEndpoint>, x_ctrl: Option<&Arc<RtpEndpoint>>, y_ctrl: Option<&Arc<RtpEndpoint>>) {
        *x.peer.lock().unwrap() = Some(Arc::downgrade(y));
        *y.peer.lock().unwrap() = Some(Arc::downgrade(x));
        *x.ctrl_peer.lock().unwrap() = y_ctrl.map(Arc::downgrade);
        *y.ctrl_peer.lock().unwrap() = x_ctrl.map(Arc::downgrade);
        if let (Some(xc), Some(yc)) = (x_ctrl, y_ctrl) {
            *xc.ctrl_peer.lock().unwrap() = Some(Arc::downgrade(yc));
            *yc.ctrl_peer.lock().unwrap() = Some(Arc::downgrade(xc));
        }
    }

    /// Stop the receive loop; called from session cleanup.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn discovery_request_packet(ssrc: u32) -> Vec<u8> {
        let mut packet = Vec::with_capacity(74);
        packet.extend_from_slice(&DISCOVERY_REQUEST_TYPE.to_be_bytes());
        packet.extend_from_slice(&DISCOVERY_LENGTH.to_be_bytes());
        packet.extend_from_slice(&ssrc.to_be_bytes());
        packet.extend(std::iter::repeat(0u8).take(66));
        packet
    }

    fn is_discovery_response(&self, data: &[u8]) -> bool {
        let Some(ssrc) = *self.ssrc.lock().unwrap() else { return false };
        data.len() >= 8
            && u16::from_be_bytes([data[0], data[1]]) == DISCOVERY_RESPONSE_TYPE
            && u16::from_be_bytes([data[2], data[3]]) == DISCOVERY_LENGTH
            && data[4..8] == ssrc.to_be_bytes()
    }

    fn parse_discovery_ip(data: &[u8]) -> Option<String> {
        let tail = data.get(8..)?;
        let nul = tail.iter().position(|b| *b == 0)?;
        std::str::from_utf8(&tail[..nul]).ok().map(str::to_string)
    }

    /// Run the receive loop: IP discovery, decrypt, forward to peer.
    /// Runs until `stop()` is called.
    pub async fn run(self: Arc<Self>) {
        if self.encrypted {
            if let Some(ssrc) = *self.ssrc.lock().unwrap() {
                let packet = Self::discovery_request_packet(ssrc);
                if let Some(remote) = *self.remote_addr.lock().unwrap() {
                    let _ = self.socket.send_to(&packet, remote).await;
                }
            }
        }

        let mut buf = vec![0u8; 2048];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => {
                    let (len, _addr) = match result {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(error = %e, "RTP recv error");
                            continue;
                        }
                    };
                    self.handle_datagram(&buf[..len]).await;
                }
            }
        }
    }

    async fn handle_datagram(self: &Arc<Self>, data: &[u8]) {
        if self.public_ip().is_none() && self.is_discovery_response(data) {
            if let Some(ip) = Self::parse_discovery_ip(data) {
                *self.public_ip.lock().unwrap() = Some(ip);
                self.public_ip_discovered.notify_waiters();
            }
            return;
        }

        let mut message = match RtpMessage::parse(data, self.encrypted) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "dropping malformed RTP datagram");
                return;
            }
        };

        if self.encrypted {
            let secret = self.secret.lock().unwrap().clone();
            match secret {
                Some(cipher) => {
                    if let Err(e) = self.decrypt(&cipher, &mut message) {
                        debug!(error = %e, "RTP decrypt failed, dropping");
                        return;
                    }
                }
                None => return,
            }
        }

        let target = if message.kind == PacketKind::Rtcp {
            self.ctrl_peer.lock().unwrap().as_ref().and_then(Weak::upgrade)
        } else {
            None
        };
        let target = target.or_else(|| self.peer.lock().unwrap().as_ref().and_then(Weak::upgrade));

        if let Some(peer) = target {
            peer.send(message).await;
        }
    }

    /// Send path: SSRC override, strip-or-encrypt, fire-and-forget.
    pub async fn send(&self, mut message: RtpMessage) {
        if let Some(ssrc) = *self.ssrc.lock().unwrap() {
            let _ = message.set_ssrc(ssrc);
        }

        if self.encrypted {
            let secret = self.secret.lock().unwrap().clone();
            match secret {
                Some(cipher) => {
                    if let Err(e) = self.encrypt(&cipher, &mut message) {
                        debug!(error = %e, "RTP encrypt failed, dropping outbound packet");
                        return;
                    }
                }
                None => return,
            }
        } else {
            message.strip_extension_header();
        }

        let remote = if message.kind == PacketKind::Rtcp {
            self.remote_ctrl_addr.lock().unwrap().or(*self.remote_addr.lock().unwrap())
        } else {
            *self.remote_addr.lock().unwrap()
        };
        let Some(remote) = remote else { return };
        if let Err(e) = self.socket.send_to(&message.to_bytes(), remote).await {
            debug!(error = %e, "RTP send error, packet dropped");
        }
    }

    fn encrypt(&self, cipher: &XChaCha20Poly1305, message: &mut RtpMessage) -> Result<()> {
        let counter = self.nonce_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        nonce_bytes[..NONCE_COUNT_SIZE].copy_from_slice(&counter.to_be_bytes());
        let nonce = XNonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, Payload { msg: &message.payload, aad: &message.header })
            .map_err(|_| Error::Crypto)?;
        message.payload = ciphertext;
        message.nonce = nonce_bytes.to_vec();
        Ok(())
    }

    fn decrypt(&self, cipher: &XChaCha20Poly1305, message: &mut RtpMessage) -> Result<()> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        nonce_bytes[..message.nonce.len().min(NONCE_SIZE)]
            .copy_from_slice(&message.nonce[..message.nonce.len().min(NONCE_SIZE)]);
        let nonce = XNonce::from_slice(&nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, Payload { msg: &message.payload, aad: &message.header })
            .map_err(|_| Error::Crypto)?;
        message.payload = plaintext;
        message.nonce.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rtp_packet(csrc_count: u8, extension: bool) -> Vec<u8> {
        let mut version_flags = 0x80 | csrc_count;
        if extension {
            version_flags |= 0b0001_0000;
        }
        let mut packet = vec![version_flags, 120, 0, 1];
        packet.extend_from_slice(&1234u32.to_be_bytes()); // timestamp
        packet.extend_from_slice(&5678u32.to_be_bytes()); // ssrc
        for _ in 0..csrc_count {
            packet.extend_from_slice(&[0u8; 4]);
        }
        if extension {
            packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // profile + length=1
            packet.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]); // one 4-byte extension word
        }
        packet.extend_from_slice(b"payload!");
        packet
    }

    #[test]
    fn parses_plain_rtp_header_length() {
        let packet = sample_rtp_packet(0, false);
        let msg = RtpMessage::parse(&packet, false).unwrap();
        assert_eq!(msg.kind, PacketKind::Rtp);
        assert_eq!(msg.header.len(), 12);
        assert_eq!(msg.payload, b"payload!");
    }

    #[test]
    fn parses_csrc_and_extension_into_header() {
        let packet = sample_rtp_packet(2, true);
        let msg = RtpMessage::parse(&packet, false).unwrap();
        assert_eq!(msg.header.len(), 12 + 2 * 4 + 4);
        assert_eq!(msg.payload, b"payload!");
    }

    #[test]
    fn strip_extension_header_removes_bit_and_words() {
        let packet = sample_rtp_packet(0, true);
        let mut msg = RtpMessage::parse(&packet, false).unwrap();
        msg.strip_extension_header();
        assert_eq!(msg.header.len(), 12);
        assert_eq!(msg.version_flags & 0b0001_0000, 0);
        assert_eq!(msg.payload, b"payload!");
    }

    #[test]
    fn set_ssrc_rewrites_rtp_header_bytes_8_to_12() {
        let packet = sample_rtp_packet(0, false);
        let mut msg = RtpMessage::parse(&packet, false).unwrap();
        msg.set_ssrc(0xAABBCCDD).unwrap();
        assert_eq!(&msg.header[8..12], &0xAABBCCDDu32.to_be_bytes());
    }

    #[test]
    fn rtcp_packets_use_eight_byte_header() {
        let mut packet = vec![0x80, 200, 0, 1];
        packet.extend_from_slice(&9999u32.to_be_bytes());
        packet.extend_from_slice(b"rtcpdata");
        let msg = RtpMessage::parse(&packet, false).unwrap();
        assert_eq!(msg.kind, PacketKind::Rtcp);
        assert_eq!(msg.header.len(), 8);
        assert_eq!(msg.payload, b"rtcpdata");
    }

    #[test]
    fn encrypt_then_decrypt_round_trips_payload() {
        let key = [7u8; 32];
        let cipher = XChaCha20Poly1305::new((&key).into());
        let packet = sample_rtp_packet(0, false);
        let mut msg = RtpMessage::parse(&packet, false).unwrap();
        let original_payload = msg.payload.clone();

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        nonce_bytes[..4].copy_from_slice(&1u32.to_be_bytes());
        let nonce = XNonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, Payload { msg: &msg.payload, aad: &msg.header })
            .unwrap();
        msg.payload = ciphertext;
        msg.nonce = nonce_bytes.to_vec();

        let plaintext = cipher
            .decrypt(nonce, Payload { msg: &msg.payload, aad: &msg.header })
            .unwrap();
        assert_eq!(plaintext, original_payload);
    }

    #[test]
    fn discovery_response_detection_matches_ssrc() {
        let mut data = vec![0u8; 16];
        data[0..2].copy_from_slice(&DISCOVERY_RESPONSE_TYPE.to_be_bytes());
        data[2..4].copy_from_slice(&DISCOVERY_LENGTH.to_be_bytes());
        data[4..8].copy_from_slice(&42u32.to_be_bytes());
        data[8..12].copy_from_slice(b"1.2.\0");
        assert_eq!(RtpEndpoint::parse_discovery_ip(&data).as_deref(), Some("1.2"));
    }
}
