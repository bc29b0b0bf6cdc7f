//! The event-driven I/O substrate: a single-threaded poll reactor plus the
//! connection and listener primitives built on top of it. Knows nothing about the
//! framed protocol carried over any given connection.

pub mod bus;
pub mod connection;
pub mod error;
pub mod privilege;
pub mod reactor;
pub mod resolver;
pub mod server;
pub mod tick;
pub mod transport;

pub use bus::{Bus, SubscriptionId};
pub use connection::{Connection, ConnEvent, Mode, Tag};
pub use error::{ReactorError, Result};
pub use reactor::{IoHandler, Reactor};
pub use resolver::{ResolveHandle, Resolver};
pub use server::{Server, ServerEvent, MAXBINDS};
pub use transport::{Transport, TlsStream};
