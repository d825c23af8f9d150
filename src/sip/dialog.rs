//! Dialog table (spec C4): a process-wide mapping from dialog ID to
//! `Dialog`, created once both tags are known (UAC: on a 2xx to an
//! INVITE; UAS: when the application accepts an inbound call).

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// `Call-ID + local-tag + remote-tag`; tag roles swap between the
/// request and the response side of the same dialog (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId(pub String);

impl DialogId {
    pub fn new(call_id: &str, local_tag: &str, remote_tag: &str) -> Self {
        DialogId(format!("{call_id}{local_tag}{remote_tag}"))
    }
}

#[derive(Debug, Clone)]
pub struct Dialog {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
    pub local_uri: String,
    pub remote_uri: String,
    pub remote_target: String,
    pub local_seq: u32,
    pub remote_seq: Option<u32>,
    pub rtp_port: Option<u16>,
    pub rtcp_port: Option<u16>,
}

impl Dialog {
    pub fn id(&self) -> DialogId {
        DialogId::new(&self.call_id, &self.local_tag, &self.remote_tag)
    }

    /// Parse the remote IP out of `sip:host:port` (no user part, since
    /// the remote target this system builds never carries one).
    pub fn remote_ip(&self) -> Result<String> {
        let mut parts = self.remote_uri.splitn(3, ':');
        parts.next();
        let ip = parts
            .next()
            .ok_or_else(|| Error::Protocol(format!("malformed remote URI: {}", self.remote_uri)))?;
        Ok(ip.to_string())
    }

    /// The peer's RTCP address: its advertised `a=rtcp:` port, or
    /// `rtp_port + 1` if it didn't advertise one (spec.md §6). `None`
    /// if no RTP port was negotiated at all.
    pub fn rtcp_addr(&self) -> Result<Option<SocketAddr>> {
        let Some(rtp_port) = self.rtp_port else { return Ok(None) };
        let port = self.rtcp_port.unwrap_or(rtp_port + 1);
        let ip = self.remote_ip()?;
        format!("{ip}:{port}")
            .parse()
            .map(Some)
            .map_err(|_| Error::Protocol(format!("unparsable RTCP remote address {ip}:{port}")))
    }
}

/// Process-wide dialog mapping (spec.md §3 invariant (b): a dialog's
/// `(Call-ID, local-tag, remote-tag)` is unique).
#[derive(Default)]
pub struct DialogTable {
    inner: Mutex<HashMap<DialogId, Dialog>>,
}

impl DialogTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, dialog: Dialog) -> DialogId {
        let id = dialog.id();
        self.inner.lock().unwrap().insert(id.clone(), dialog);
        id
    }

    pub fn get(&self, id: &DialogId) -> Option<Dialog> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    pub fn terminate(&self, id: &DialogId) {
        self.inner.lock().unwrap().remove(id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_dialog() -> Dialog {
        Dialog {
            call_id: "call-1".into(),
            local_tag: "ltag".into(),
            remote_tag: "rtag".into(),
            local_uri: "sip:IPCall@10.0.0.1:5060".into(),
            remote_uri: "sip:10.0.0.2:5060".into(),
            remote_target: "sip:10.0.0.2:5060".into(),
            local_seq: 1,
            remote_seq: None,
            rtp_port: Some(5004),
            rtcp_port: None,
        }
    }

    #[test]
    fn dialog_id_combines_call_id_and_tags() {
        let dialog = sample_dialog();
        assert_eq!(dialog.id(), DialogId::new("call-1", "ltag", "rtag"));
    }

    #[test]
    fn remote_ip_strips_scheme_and_port() {
        let dialog = sample_dialog();
        assert_eq!(dialog.remote_ip().unwrap(), "10.0.0.2");
    }

    #[test]
    fn rtcp_addr_infers_rtp_port_plus_one_when_absent() {
        let dialog = sample_dialog();
        assert_eq!(dialog.rtcp_addr().unwrap(), Some("10.0.0.2:5005".parse().unwrap()));
    }

    #[test]
    fn rtcp_addr_uses_explicit_port_when_advertised() {
        let mut dialog = sample_dialog();
        dialog.rtcp_port = Some(6001);
        assert_eq!(dialog.rtcp_addr().unwrap(), Some("10.0.0.2:6001".parse().unwrap()));
    }

    #[test]
    fn rtcp_addr_is_none_without_negotiated_rtp_port() {
        let mut dialog = sample_dialog();
        dialog.rtp_port = None;
        assert_eq!(dialog.rtcp_addr().unwrap(), None);
    }

    #[test]
    fn table_insert_and_terminate_round_trip() {
        let table = DialogTable::new();
        let id = table.insert(sample_dialog());
        assert!(table.get(&id).is_some());
        table.terminate(&id);
        assert!(table.get(&id).is_none());
        assert!(table.is_empty());
    }
}
