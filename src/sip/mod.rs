//! SIP stack: message codec, transport, transaction engine, dialog table
//! and user agent core (spec modules C1-C5).

pub mod dialog;
pub mod message;
pub mod sdp;
pub mod transaction;
pub mod transport;
pub mod user_agent;

pub use message::{SipMessage, SipRequest, SipResponse};
