//! Shard routing.
//!
//! Keys route to a shard by hashing their routing key. For plain keys the
//! routing key is the key itself; a key carrying a Redis-style hash tag
//! (`{tag}rest`) routes by the tag contents, so related keys can be pinned
//! to one shard. The slave apply path uses the same extraction as the
//! write path, which is what keeps replicated writes on the same shard.

pub struct ShardRouter;

impl ShardRouter {
    /// Extract the routing key from a storage key.
    ///
    /// Follows the Redis cluster hash-tag rule: the first `{...}` pair with
    /// non-empty contents is the routing key; otherwise the whole key is.
    pub fn routing_key(key: &[u8]) -> &[u8] {
        if let Some(open) = key.iter().position(|&b| b == b'{') {
            let rest = &key[open + 1..];
            if let Some(close) = rest.iter().position(|&b| b == b'}') {
                if close > 0 {
                    return &rest[..close];
                }
            }
        }
        key
    }

    /// Route a routing key to a shard index using seahash for uniform
    /// distribution.
    ///
    /// seahash provides much better distribution than DefaultHasher for
    /// modulo operations on small numbers (like shard counts)
    pub fn route(routing_key: &[u8], shard_count: usize) -> usize {
        if shard_count == 0 {
            return 0;
        }
        (seahash::hash(routing_key) % shard_count as u64) as usize
    }
}
