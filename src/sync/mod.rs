//! Master/slave sync transport: the master-side listener that serves
//! binlog catch-up streams and the slave-side loop that applies them.

pub mod follower;
pub mod server;

pub use follower::{
    ReplicationCursor, SlaveHandle, StreamErrorPolicy, SyncSlave, CURSOR_FILE_NAME,
};
pub use server::SyncServer;
