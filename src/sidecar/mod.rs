//! Sidecar bridge: subprocess lifecycle plus the WebSocket control channel
//!
//! The sidecar runs a headless browser against the upstream service; this
//! module owns its process and offers the rest of the system a small
//! capability surface (QR sessions, cookie validation, paged search).

pub mod bridge;
pub mod channel;
pub mod process;
pub mod protocol;

pub use bridge::{QrSession, SearchPage, SessionStream, SidecarBridge};
pub use process::SidecarProcess;
pub use protocol::{CookieMap, InboundFrame, InboundMessage, RawPost, ScanStatus};
