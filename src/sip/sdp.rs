//! Minimal SDP builder/parser for the single-audio-line bodies this
//! system exchanges (spec.md §4.1/§6): one `m=audio` line, opus at
//! 48kHz/stereo, 20ms packetization, `sendrecv`.
//!
//! The session/media grammar this bridge speaks never grows beyond
//! this shape, so a full SDP object model (attribute lists, multiple
//! media sections, bandwidth lines) would be unused weight; the
//! fields below are exactly the ones spec.md's callers need.

pub const OPUS_PAYLOAD_TYPE: u8 = 120;

/// Fixed local RTP port for the SIP-side media socket
/// (`original_source/asyncioSip.py`'s `RTP_PORT`).
pub const SIP_RTP_PORT: u16 = 5004;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedSdp {
    pub rtp_port: u16,
    pub rtcp_port: Option<u16>,
}

/// Build the SDP offer/answer body for a call leg listening at
/// `local_addr:rtp_port`. Session-id and version are both the current
/// Unix timestamp (spec.md §4.1).
pub fn build(local_addr: &str, rtp_port: u16) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    format!(
        "v=0\r\n\
o=Hotline {now} {now} IN IP4 {local_addr}\r\n\
s=SIP Call\r\n\
c=IN IP4 {local_addr}\r\n\
t=0 0\r\n\
m=audio {rtp_port} RTP/AVP {OPUS_PAYLOAD_TYPE}\r\n\
a=sendrecv\r\n\
a=rtpmap:{OPUS_PAYLOAD_TYPE} opus/48000/2\r\n\
a=ptime:20\r\n"
    )
}

/// Parse out the RTP port (mandatory) and RTCP port (optional,
/// absent implies RTCP on `rtp_port + 1` per spec.md §4.1).
pub fn parse(body: &str) -> Option<ParsedSdp> {
    let mut rtp_port = None;
    let mut rtcp_port = None;

    for line in body.split("\r\n") {
        if let Some(rest) = line.strip_prefix("m=audio ") {
            rtp_port = rest.split(' ').next().and_then(|p| p.parse::<u16>().ok());
        } else if let Some(rest) = line.strip_prefix("a=rtcp:") {
            rtcp_port = rest.split(' ').next().and_then(|p| p.parse::<u16>().ok());
        }
    }

    rtp_port.map(|rtp_port| ParsedSdp { rtp_port, rtcp_port })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_expected_shape() {
        let body = build("192.0.2.10", 40000);
        assert!(body.contains("m=audio 40000 RTP/AVP 120\r\n"));
        assert!(body.contains("a=rtpmap:120 opus/48000/2\r\n"));
        assert!(body.contains("c=IN IP4 192.0.2.10\r\n"));
    }

    #[test]
    fn parses_rtp_port_without_explicit_rtcp() {
        let body = build("192.0.2.10", 40000);
        let parsed = parse(&body).unwrap();
        assert_eq!(parsed.rtp_port, 40000);
        assert_eq!(parsed.rtcp_port, None);
    }

    #[test]
    fn parses_explicit_rtcp_port() {
        let body = "v=0\r\nm=audio 40000 RTP/AVP 120\r\na=rtcp:40001\r\n";
        let parsed = parse(body).unwrap();
        assert_eq!(parsed.rtp_port, 40000);
        assert_eq!(parsed.rtcp_port, Some(40001));
    }
}
