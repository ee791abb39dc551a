// ==============
// crates/backend-lib/src/metrics.rs

//! Central place for metric keys
pub const WS_CONNECTION: &str = "ws.connection";
pub const WS_ACTIVE: &str = "ws.active";
pub const WS_MALFORMED_FRAME: &str = "ws.frame.malformed";
pub const UPSTREAM_OPENED: &str = "upstream.opened";
pub const UPSTREAM_CLOSED: &str = "upstream.closed";
pub const UPSTREAM_FAILED: &str = "upstream.failed";
pub const UPSTREAM_ACTIVE: &str = "upstream.active";
pub const ENVELOPE_RELAYED: &str = "envelope.relayed";
pub const ENVELOPE_DROPPED: &str = "envelope.dropped";
