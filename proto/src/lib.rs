//! The framed multiplexing protocol: wire format, per-tunnel state machine,
//! client-number registry, reactor glue, and the TLS policy surface it runs
//! under.

pub mod engine;
pub mod error;
pub mod frame;
pub mod registry;
pub mod tls;
pub mod tunnel;

pub use engine::{BusyRejectIo, LocalDialer, Reconnector, ServerListenerIo, TcpIo, TunnelSlot};
pub use error::TunnelError;
pub use frame::{DecodedItem, FrameDecoder, Role, DATA_HEADER_LEN};
pub use registry::{ClientRegistry, ClientSpec};
pub use tunnel::{TunnelEngine, CLOSETICKS, IDENTTICKS, PINGTICKS, RECONNTICKS, RESOLVTICKS};
