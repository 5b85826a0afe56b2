pub mod engine;
pub mod router;

pub use engine::{ShardedStore, StoreIterator};
pub use router::ShardRouter;
