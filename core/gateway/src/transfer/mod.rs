//! Multipart transfer sessions.

pub mod coordinator;
pub mod session;
pub mod store;

pub use coordinator::{CollectReport, DownloadedPart, PartAck, TransferCoordinator};
pub use session::{
    Direction, PartDescriptor, TransferSession, TransferState, TransferStatus, TransferTicket,
};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};
