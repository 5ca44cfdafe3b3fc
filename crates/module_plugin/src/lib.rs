pub mod message;
pub mod runtime;
pub mod test_util;
pub mod transport;
pub mod upgrades;
pub mod wire;

pub use message::{PROTOCOL_FLOOR, PROTOCOL_VERSION, VERIFY_TOKEN_ENV};
pub use runtime::{ModuleContext, ModuleHandler, serve};
pub use transport::{CallError, HandlerTable, IpcTransport, TransportOptions};
