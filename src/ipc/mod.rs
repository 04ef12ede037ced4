//! Length-prefixed, schema-validated IPC between the interceptor and the
//! analyzer — the only trust boundary in the system (spec.md §4.7).

pub mod frame;
pub mod messages;
pub mod transport;

pub use frame::{read_frame, write_frame};
pub use messages::{Command, CommandTag, PacketDescriptor};
pub use transport::{IpcClient, IpcServer};
