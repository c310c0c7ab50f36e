// GB28181 SIP 信令层

pub mod dialog;
pub mod message;
pub mod sdp;
pub mod transport;

pub use dialog::{ack_request, into_dialog, DialogBuilder};
pub use message::{SipMessage, SipMethod, SipRequest, SipResponse};
pub use sdp::{MediaFormat, SdpMedia, SdpSession};
pub use transport::{InboundHandler, SipTransport, UdpSipTransport};
