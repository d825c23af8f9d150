//! SIP message codec (spec C1).
//!
//! Messages on the wire are plain-text UDP per spec.md §4.1/§4.2: a
//! start line, a small set of mandatory headers, an opaque additional
//! header map that preserves insertion order, and an optional body
//! (SDP in practice). This module hand-rolls parsing and serialization
//! because the header shape and tag/branch conventions here diverge
//! from generic RFC 3261 stacks; `rsip::Method` and `rsip::Uri` are
//! reused for the pieces that are genuinely generic.

use crate::error::{Error, Result};
use std::fmt;

pub const SIP_VERSION: &str = "SIP/2.0";
pub const TRANSPORT: &str = "UDP";
pub const DEFAULT_PORT: u16 = 5060;

/// Fields shared between requests and responses: spec.md §3 "SIP Message".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipHeaders {
    pub via_host: String,
    pub via_port: u16,
    pub branch: String,
    pub from_uri: rsip::Uri,
    pub from_tag: Option<String>,
    pub to_uri: rsip::Uri,
    pub to_tag: Option<String>,
    pub call_id: String,
    pub cseq: u32,
    pub cseq_method: rsip::Method,
    pub body: String,
    /// Headers not otherwise modeled, in original wire order.
    pub additional_headers: Vec<(String, String)>,
}

impl SipHeaders {
    fn push_additional(&mut self, label: &str, value: &str) {
        self.additional_headers
            .push((label.to_string(), value.to_string()));
    }

    fn write_common(&self, out: &mut String, via_host: &str, via_port: u16) {
        out.push_str(&format!(
            "Via: {SIP_VERSION}/{TRANSPORT} {via_host}:{via_port};branch={}\r\n",
            self.branch
        ));
        out.push_str(&format!(
            "From: <{}>{}\r\n",
            self.from_uri,
            tag_param(&self.from_tag)
        ));
        out.push_str(&format!(
            "To: <{}>{}\r\n",
            self.to_uri,
            tag_param(&self.to_tag)
        ));
        out.push_str(&format!("Call-ID: {}\r\n", self.call_id));
        out.push_str(&format!("CSeq: {} {}\r\n", self.cseq, self.cseq_method));
        for (label, value) in &self.additional_headers {
            out.push_str(&format!("{label}: {value}\r\n"));
        }
        if !self.body.is_empty() {
            out.push_str("Content-Type: application/sdp\r\n");
        }
        out.push_str(&format!(
            "Content-Length: {}\r\n",
            self.body.as_bytes().len()
        ));
    }
}

fn tag_param(tag: &Option<String>) -> String {
    match tag {
        Some(t) => format!(";tag={t}"),
        None => String::new(),
    }
}

/// A SIP request: spec.md §3, method in {INVITE, ACK, BYE, CANCEL,
/// REGISTER, OPTIONS}, target decomposed into address and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipRequest {
    pub method: rsip::Method,
    pub request_host: String,
    pub request_port: u16,
    pub max_forwards: u32,
    pub headers: SipHeaders,
}

/// A SIP response: spec.md §3, status code with reason phrase, method
/// carried via `headers.cseq_method` for transaction matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipResponse {
    pub status_code: u16,
    pub headers: SipHeaders,
}

/// Either message shape, for code that dispatches on ingress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

/// Standard reason phrase for the status codes this system emits
/// (spec.md §4.2), falling back to a generic phrase for anything else
/// so arbitrary 3xx-6xx responses still round-trip.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        408 => "Request Timeout",
        486 => "Busy Here",
        487 => "Request Terminated",
        504 => "Server Time-out",
        _ if (100..200).contains(&code) => "Provisional",
        _ if (200..300).contains(&code) => "OK",
        _ if (300..400).contains(&code) => "Redirection",
        _ if (400..500).contains(&code) => "Client Error",
        _ if (500..600).contains(&code) => "Server Error",
        _ => "Unknown",
    }
}

pub fn is_provisional(code: u16) -> bool {
    (100..=199).contains(&code)
}

pub fn is_final(code: u16) -> bool {
    (200..=699).contains(&code)
}

impl SipRequest {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(&format!(
            "{} sip:{}:{} {SIP_VERSION}\r\n",
            self.method, self.request_host, self.request_port
        ));
        self.headers
            .write_common(&mut out, &self.headers.via_host, self.headers.via_port);
        out.push_str(&format!("Max-Forwards: {}\r\n", self.max_forwards));
        out.push_str("\r\n");
        out.push_str(&self.headers.body);
        out.into_bytes()
    }
}

impl SipResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(&format!(
            "{SIP_VERSION} {} {}\r\n",
            self.status_code,
            reason_phrase(self.status_code)
        ));
        self.headers
            .write_common(&mut out, &self.headers.via_host, self.headers.via_port);
        out.push_str("\r\n");
        out.push_str(&self.headers.body);
        out.into_bytes()
    }
}

impl fmt::Display for SipRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sip:{}:{}", self.method, self.request_host, self.request_port)
    }
}

impl fmt::Display for SipResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status_code, reason_phrase(self.status_code))
    }
}

fn is_request_method(word: &str) -> Option<rsip::Method> {
    match word {
        "INVITE" => Some(rsip::Method::Invite),
        "ACK" => Some(rsip::Method::Ack),
        "BYE" => Some(rsip::Method::Bye),
        "CANCEL" => Some(rsip::Method::Cancel),
        "REGISTER" => Some(rsip::Method::Register),
        "OPTIONS" => Some(rsip::Method::Options),
        _ => None,
    }
}

fn extract_param(header_value: &str, label: &str) -> Option<String> {
    let mut parts = header_value.split(';');
    parts.next();
    for param in parts {
        if let Some((key, value)) = param.split_once('=') {
            if key == label {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Parse a `<sip:...>` or bare `sip:...` address, returning the `Uri`
/// with angle brackets stripped.
fn parse_addr_uri(raw: &str) -> Result<rsip::Uri> {
    let trimmed = raw.trim();
    let (addr_part, _params) = match trimmed.split_once('>') {
        Some((before, after)) => (before.trim_start_matches('<'), after),
        None => (trimmed, ""),
    };
    rsip::Uri::try_from(addr_part)
        .map_err(|e| Error::Protocol(format!("invalid SIP URI '{addr_part}': {e}")))
}

struct ParsedCommon {
    via_host: String,
    via_port: u16,
    branch: String,
    from_uri: rsip::Uri,
    from_tag: Option<String>,
    to_uri: rsip::Uri,
    to_tag: Option<String>,
    call_id: String,
    cseq: u32,
    cseq_method_raw: String,
    additional_headers: Vec<(String, String)>,
}

fn parse_common(head_lines: &[&str]) -> Result<ParsedCommon> {
    let mut via_host = None;
    let mut via_port = None;
    let mut branch = None;
    let mut from_uri = None;
    let mut from_tag = None;
    let mut to_uri = None;
    let mut to_tag = None;
    let mut call_id = None;
    let mut cseq = None;
    let mut cseq_method_raw = None;
    let mut additional_headers = Vec::new();

    for line in head_lines {
        let (label, content) = line
            .split_once(": ")
            .ok_or_else(|| Error::Protocol(format!("malformed header line: {line}")))?;
        match label {
            "Via" => {
                let stripped = content
                    .strip_prefix(&format!("{SIP_VERSION}/{TRANSPORT} "))
                    .unwrap_or(content);
                let address = stripped
                    .split(';')
                    .next()
                    .ok_or_else(|| Error::Protocol("empty Via header".into()))?;
                let (ip, port) = address
                    .rsplit_once(':')
                    .ok_or_else(|| Error::Protocol(format!("Via missing port: {content}")))?;
                via_host = Some(ip.to_string());
                via_port = Some(
                    port.parse::<u16>()
                        .map_err(|_| Error::Protocol(format!("bad Via port: {port}")))?,
                );
                branch = extract_param(stripped, "branch");
            }
            "From" => {
                from_tag = extract_param(content, "tag");
                from_uri = Some(parse_addr_uri(content)?);
            }
            "To" => {
                to_tag = extract_param(content, "tag");
                to_uri = Some(parse_addr_uri(content)?);
            }
            "CSeq" => {
                let (seq, method) = content
                    .split_once(' ')
                    .ok_or_else(|| Error::Protocol(format!("malformed CSeq: {content}")))?;
                cseq = Some(
                    seq.parse::<u32>()
                        .map_err(|_| Error::Protocol(format!("bad CSeq number: {seq}")))?,
                );
                cseq_method_raw = Some(method.to_string());
            }
            "Call-ID" => call_id = Some(content.to_string()),
            // Recomputed from the body by `write_common` on every serialize;
            // carrying the parsed value forward would duplicate both headers.
            "Content-Type" | "Content-Length" => {}
            _ => additional_headers.push((label.to_string(), content.to_string())),
        }
    }

    Ok(ParsedCommon {
        via_host: via_host.ok_or_else(|| Error::Protocol("missing Via header".into()))?,
        via_port: via_port.ok_or_else(|| Error::Protocol("missing Via port".into()))?,
        branch: branch.ok_or_else(|| Error::Protocol("missing Via branch".into()))?,
        from_uri: from_uri.ok_or_else(|| Error::Protocol("missing From header".into()))?,
        from_tag,
        to_uri: to_uri.ok_or_else(|| Error::Protocol("missing To header".into()))?,
        to_tag,
        call_id: call_id.ok_or_else(|| Error::Protocol("missing Call-ID header".into()))?,
        cseq: cseq.ok_or_else(|| Error::Protocol("missing CSeq header".into()))?,
        cseq_method_raw: cseq_method_raw
            .ok_or_else(|| Error::Protocol("missing CSeq method".into()))?,
        additional_headers,
    })
}

impl SipMessage {
    /// Parse a complete datagram per spec.md §4.2: start line, headers,
    /// blank line, opaque body.
    pub fn parse(bytes: &[u8]) -> Result<SipMessage> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| Error::Protocol(format!("non-utf8 SIP datagram: {e}")))?;
        let (head, body) = text
            .split_once("\r\n\r\n")
            .ok_or_else(|| Error::Protocol("missing header/body separator".into()))?;
        let mut lines = head.split("\r\n");
        let start_line = lines
            .next()
            .ok_or_else(|| Error::Protocol("empty message".into()))?;
        let header_lines: Vec<&str> = lines.collect();

        if let Some(rest) = start_line.strip_prefix(&format!("{SIP_VERSION} ")) {
            let (code_str, _reason) = rest
                .split_once(' ')
                .ok_or_else(|| Error::Protocol(format!("malformed status line: {start_line}")))?;
            let status_code = code_str
                .parse::<u16>()
                .map_err(|_| Error::Protocol(format!("bad status code: {code_str}")))?;
            let common = parse_common(&header_lines)?;
            let cseq_method = is_request_method(&common.cseq_method_raw)
                .ok_or_else(|| Error::Protocol(format!("bad CSeq method: {}", common.cseq_method_raw)))?;
            return Ok(SipMessage::Response(SipResponse {
                status_code,
                headers: SipHeaders {
                    via_host: common.via_host,
                    via_port: common.via_port,
                    branch: common.branch,
                    from_uri: common.from_uri,
                    from_tag: common.from_tag,
                    to_uri: common.to_uri,
                    to_tag: common.to_tag,
                    call_id: common.call_id,
                    cseq: common.cseq,
                    cseq_method,
                    body: body.to_string(),
                    additional_headers: common.additional_headers,
                },
            }));
        }

        let mut start_parts = start_line.splitn(3, ' ');
        let method_word = start_parts
            .next()
            .ok_or_else(|| Error::Protocol("empty start line".into()))?;
        let request_uri = start_parts
            .next()
            .ok_or_else(|| Error::Protocol(format!("malformed request line: {start_line}")))?;
        let method = is_request_method(method_word)
            .ok_or_else(|| Error::Protocol(format!("unsupported method: {method_word}")))?;

        let target = request_uri
            .strip_prefix("sip:")
            .ok_or_else(|| Error::Protocol(format!("request-URI missing sip: scheme: {request_uri}")))?;
        let (request_host, request_port) = match target.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => (
                host.to_string(),
                port.parse::<u16>()
                    .map_err(|_| Error::Protocol(format!("bad request port: {port}")))?,
            ),
            _ => (target.to_string(), DEFAULT_PORT),
        };

        let common = parse_common(&header_lines)?;
        let cseq_method = is_request_method(&common.cseq_method_raw)
            .ok_or_else(|| Error::Protocol(format!("bad CSeq method: {}", common.cseq_method_raw)))?;
        let max_forwards = common
            .additional_headers
            .iter()
            .find(|(k, _)| k == "Max-Forwards")
            .and_then(|(_, v)| v.parse::<u32>().ok())
            .unwrap_or(70);
        let additional_headers = common
            .additional_headers
            .into_iter()
            .filter(|(k, _)| k != "Max-Forwards")
            .collect();

        Ok(SipMessage::Request(SipRequest {
            method,
            request_host,
            request_port,
            max_forwards,
            headers: SipHeaders {
                via_host: common.via_host,
                via_port: common.via_port,
                branch: common.branch,
                from_uri: common.from_uri,
                from_tag: common.from_tag,
                to_uri: common.to_uri,
                to_tag: common.to_tag,
                call_id: common.call_id,
                cseq: common.cseq,
                cseq_method,
                body: body.to_string(),
                additional_headers,
            },
        }))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            SipMessage::Request(r) => r.to_bytes(),
            SipMessage::Response(r) => r.to_bytes(),
        }
    }

    pub fn call_id(&self) -> &str {
        match self {
            SipMessage::Request(r) => &r.headers.call_id,
            SipMessage::Response(r) => &r.headers.call_id,
        }
    }

    pub fn branch(&self) -> &str {
        match self {
            SipMessage::Request(r) => &r.headers.branch,
            SipMessage::Response(r) => &r.headers.branch,
        }
    }
}

/// Helpers used by the request-building call sites (user agent, dialog,
/// transaction layers) so they never hand-assemble `SipHeaders` inline.
impl SipRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        method: rsip::Method,
        request_host: impl Into<String>,
        request_port: u16,
        via_host: impl Into<String>,
        via_port: u16,
        branch: impl Into<String>,
        from_uri: rsip::Uri,
        from_tag: Option<String>,
        to_uri: rsip::Uri,
        to_tag: Option<String>,
        call_id: impl Into<String>,
        cseq: u32,
        body: impl Into<String>,
    ) -> Self {
        SipRequest {
            method,
            request_host: request_host.into(),
            request_port,
            max_forwards: 70,
            headers: SipHeaders {
                via_host: via_host.into(),
                via_port,
                branch: branch.into(),
                from_uri,
                from_tag,
                to_uri,
                to_tag,
                call_id: call_id.into(),
                cseq,
                cseq_method: method,
                body: body.into(),
                additional_headers: Vec::new(),
            },
        }
    }

    pub fn with_additional_header(mut self, label: &str, value: &str) -> Self {
        self.headers.push_additional(label, value);
        self
    }
}

impl SipResponse {
    /// Build a response in reply to `request`, per spec.md §4.1: Via
    /// copied from the request (so retransmission/matching works), To
    /// tag attached unless this is a `100 Trying`.
    pub fn for_request(request: &SipRequest, status_code: u16, to_tag: Option<String>, body: impl Into<String>) -> Self {
        let to_tag = if status_code == 100 { None } else { to_tag };
        SipResponse {
            status_code,
            headers: SipHeaders {
                via_host: request.headers.via_host.clone(),
                via_port: request.headers.via_port,
                branch: request.headers.branch.clone(),
                from_uri: request.headers.from_uri.clone(),
                from_tag: request.headers.from_tag.clone(),
                to_uri: request.headers.to_uri.clone(),
                to_tag,
                call_id: request.headers.call_id.clone(),
                cseq: request.headers.cseq,
                cseq_method: request.headers.cseq_method,
                body: body.into(),
                additional_headers: Vec::new(),
            },
        }
    }

    pub fn with_additional_header(mut self, label: &str, value: &str) -> Self {
        self.headers.push_additional(label, value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_invite_bytes() -> Vec<u8> {
        let text = "INVITE sip:10.0.0.2:5060 SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKabc123\r\n\
From: <sip:IPCall@10.0.0.1:5060>;tag=fromtag1\r\n\
To: <sip:10.0.0.2:5060>\r\n\
Call-ID: deadbeefcafe\r\n\
CSeq: 1 INVITE\r\n\
Max-Forwards: 70\r\n\
Contact: <sip:IPCall@10.0.0.1>\r\n\
Content-Type: application/sdp\r\n\
Content-Length: 4\r\n\r\nabcd";
        text.as_bytes().to_vec()
    }

    #[test]
    fn parses_invite_request() {
        let msg = SipMessage::parse(&sample_invite_bytes()).unwrap();
        match msg {
            SipMessage::Request(req) => {
                assert_eq!(req.method, rsip::Method::Invite);
                assert_eq!(req.request_host, "10.0.0.2");
                assert_eq!(req.request_port, 5060);
                assert_eq!(req.headers.via_host, "10.0.0.1");
                assert_eq!(req.headers.branch, "z9hG4bKabc123");
                assert_eq!(req.headers.from_tag.as_deref(), Some("fromtag1"));
                assert_eq!(req.headers.to_tag, None);
                assert_eq!(req.headers.call_id, "deadbeefcafe");
                assert_eq!(req.headers.cseq, 1);
                assert_eq!(req.headers.body, "abcd");
                assert!(req
                    .headers
                    .additional_headers
                    .iter()
                    .any(|(k, v)| k == "Contact" && v == "<sip:IPCall@10.0.0.1>"));
            }
            SipMessage::Response(_) => panic!("expected request"),
        }
    }

    #[test]
    fn request_uri_without_port_defaults_to_5060() {
        let text = "OPTIONS sip:host.example SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKxyz\r\n\
From: <sip:a@10.0.0.1:5060>;tag=t1\r\n\
To: <sip:host.example>\r\n\
Call-ID: id1\r\n\
CSeq: 1 OPTIONS\r\n\r\n";
        let msg = SipMessage::parse(text.as_bytes()).unwrap();
        match msg {
            SipMessage::Request(req) => {
                assert_eq!(req.request_host, "host.example");
                assert_eq!(req.request_port, DEFAULT_PORT);
            }
            _ => panic!("expected request"),
        }
    }

    #[test]
    fn round_trips_response() {
        let from_uri = rsip::Uri::try_from("sip:IPCall@10.0.0.2:5060").unwrap();
        let to_uri = rsip::Uri::try_from("sip:10.0.0.1:5060").unwrap();
        let request = SipRequest::new(
            rsip::Method::Invite,
            "10.0.0.1",
            5060,
            "10.0.0.2",
            5060,
            "z9hG4bKbranch",
            from_uri,
            Some("ftag".into()),
            to_uri,
            None,
            "call-id-1",
            1,
            "",
        );
        let response = SipResponse::for_request(&request, 200, Some("ttag".into()), "");
        let bytes = response.to_bytes();
        let parsed = SipMessage::parse(&bytes).unwrap();
        match parsed {
            SipMessage::Response(r) => {
                assert_eq!(r.status_code, 200);
                assert_eq!(r.headers.to_tag.as_deref(), Some("ttag"));
                assert_eq!(r.headers.cseq_method, rsip::Method::Invite);
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn trying_response_carries_no_to_tag() {
        let from_uri = rsip::Uri::try_from("sip:IPCall@10.0.0.2:5060").unwrap();
        let to_uri = rsip::Uri::try_from("sip:10.0.0.1:5060").unwrap();
        let request = SipRequest::new(
            rsip::Method::Invite,
            "10.0.0.1",
            5060,
            "10.0.0.2",
            5060,
            "z9hG4bKbranch",
            from_uri,
            Some("ftag".into()),
            to_uri,
            None,
            "call-id-1",
            1,
            "",
        );
        let trying = SipResponse::for_request(&request, 100, Some("ttag".into()), "");
        assert_eq!(trying.headers.to_tag, None);
    }

    #[test]
    fn reason_phrases_match_spec() {
        assert_eq!(reason_phrase(486), "Busy Here");
        assert_eq!(reason_phrase(504), "Server Time-out");
        assert_eq!(reason_phrase(487), "Request Terminated");
    }
}
