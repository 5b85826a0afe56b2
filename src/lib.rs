pub mod config;
pub mod error;
pub mod replication;
pub mod storage;
pub mod sync;

pub use config::{BinlogConfig, Config, MasterConfig};
pub use error::{DbError, DbResult};
pub use replication::{LogRecord, RecordKind, ReplicationCluster};
pub use storage::{ShardRouter, ShardedStore};
pub use sync::{SyncServer, SyncSlave};
