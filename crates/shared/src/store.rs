//! 持久化键值存储模块
//!
//! 抑制名单、限流计数器、token 注册表、投递记录与指标快照都落在同一个
//! 键值存储上。存储只需要五类原语：集合成员、哈希字段读写、按时间戳排序的
//! 有序集合、原子自增、键级 TTL——`KeyValueStore` trait 按此收口。
//!
//! 提供两个实现：
//! - [`RedisStore`]：生产环境实现，基于 redis 多路复用异步连接
//! - [`MemoryStore`]：基于 DashMap 的内存实现，用于测试和开发环境

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tracing::info;

use crate::config::StoreConfig;
use crate::error::{NotifyError, Result};

/// 持久化键值存储抽象
///
/// 所有计数与检查路径都必须依赖存储自身的原子原语（INCR、SADD、SISMEMBER），
/// 不允许读取后再写回——并发发送时读写对会产生竞态。
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    // ==================== 字符串键 ====================

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// 设置值，`ttl` 为 None 时不过期
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// 设置键的过期时间
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// 原子自增，key 不存在时从 0 开始
    ///
    /// 返回自增后的值。限流判断依赖该返回值与上限的比较。
    async fn incr(&self, key: &str, delta: i64) -> Result<i64>;

    // ==================== 集合 ====================

    /// 添加集合成员，返回是否为新成员
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    /// 移除集合成员，返回成员是否存在
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;

    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    // ==================== 哈希 ====================

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// 删除哈希字段，返回字段是否存在
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// 哈希字段原子自增
    async fn hincr(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    // ==================== 有序集合（按时间戳排序） ====================

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;

    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    async fn zcard(&self, key: &str) -> Result<u64>;

    /// 按 score 升序返回 `[start, stop]` 区间成员（含两端，-1 表示末尾）
    async fn zrange_asc(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    /// 按 score 降序返回 `[start, stop]` 区间成员
    async fn zrange_desc(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    /// 返回 score 落在 `[min, max]` 内的成员
    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>>;

    /// 删除 score 落在 `[min, max]` 内的成员，返回删除数量
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64>;

    /// 获取成员的 score
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;
}

// ===========================================================================
// RedisStore — 生产环境实现
// ===========================================================================

/// Redis 存储客户端
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
}

impl RedisStore {
    /// 创建 Redis 客户端
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        info!("Redis client created");
        Ok(Self { client })
    }

    /// 获取连接
    async fn conn(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(NotifyError::from)
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(NotifyError::from)
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn().await?;
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs()).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.expire(key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn().await?;
        let value: i64 = conn.incr(key, delta).await?;
        Ok(value)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let added: i64 = conn.sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.srem(key, member).await?;
        Ok(removed > 0)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let is_member: bool = conn.sismember(key, member).await?;
        Ok(is_member)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.hdel(key, field).await?;
        Ok(removed > 0)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn().await?;
        let map: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(map)
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn().await?;
        let value: i64 = conn.hincr(key, field, delta).await?;
        Ok(value)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        let count: u64 = conn.zcard(key).await?;
        Ok(count)
    }

    async fn zrange_asc(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let members: Vec<String> = conn.zrange(key, start, stop).await?;
        Ok(members)
    }

    async fn zrange_desc(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let members: Vec<String> = conn.zrevrange(key, start, stop).await?;
        Ok(members)
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let members: Vec<String> = conn.zrangebyscore(key, min, max).await?;
        Ok(members)
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.zrembyscore(key, min, max).await?;
        Ok(removed)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut conn = self.conn().await?;
        let score: Option<f64> = conn.zscore(key, member).await?;
        Ok(score)
    }
}

// ===========================================================================
// MemoryStore — 测试 / 开发环境实现
// ===========================================================================

/// 基于 DashMap 的内存存储
///
/// 语义与 Redis 对齐：per-key 操作原子（DashMap entry 锁），
/// TTL 在访问时惰性检查。数据随进程消失，仅用于测试和开发。
#[derive(Default)]
pub struct MemoryStore {
    strings: DashMap<String, String>,
    sets: DashMap<String, HashSet<String>>,
    hashes: DashMap<String, HashMap<String, String>>,
    zsets: DashMap<String, HashMap<String, f64>>,
    expirations: DashMap<String, Instant>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 包装成 trait 对象，测试里直接注入各组件
    pub fn shared() -> Arc<dyn KeyValueStore> {
        Arc::new(Self::new())
    }

    /// 惰性清理已过期的键
    fn evict_if_expired(&self, key: &str) {
        let expired = self
            .expirations
            .get(key)
            .map(|deadline| *deadline <= Instant::now())
            .unwrap_or(false);
        if expired {
            self.expirations.remove(key);
            self.strings.remove(key);
            self.sets.remove(key);
            self.hashes.remove(key);
            self.zsets.remove(key);
        }
    }

    /// 将负索引换算为绝对范围，语义对齐 Redis 的 ZRANGE start/stop
    fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
        let resolve = |idx: isize| -> isize {
            if idx < 0 { len as isize + idx } else { idx }
        };
        let start = resolve(start).max(0) as usize;
        let stop = resolve(stop);
        if stop < 0 {
            return None;
        }
        let stop = (stop as usize).min(len.saturating_sub(1));
        if len == 0 || start > stop {
            return None;
        }
        Some((start, stop))
    }

    /// 按 score 排序后的成员列表（score 相同按成员字典序，与 Redis 一致）
    fn sorted_members(&self, key: &str) -> Vec<(String, f64)> {
        let mut members: Vec<(String, f64)> = self
            .zsets
            .get(key)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        members
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.evict_if_expired(key);
        Ok(self.strings.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.strings.insert(key.to_string(), value.to_string());
        match ttl {
            Some(ttl) => {
                self.expirations
                    .insert(key.to_string(), Instant::now() + ttl);
            }
            None => {
                self.expirations.remove(key);
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.strings.remove(key);
        self.sets.remove(key);
        self.hashes.remove(key);
        self.zsets.remove(key);
        self.expirations.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.evict_if_expired(key);
        Ok(self.strings.contains_key(key)
            || self.sets.contains_key(key)
            || self.hashes.contains_key(key)
            || self.zsets.contains_key(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.expirations
            .insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        self.evict_if_expired(key);
        let mut entry = self
            .strings
            .entry(key.to_string())
            .or_insert_with(|| "0".to_string());
        let current: i64 = entry
            .parse()
            .map_err(|_| NotifyError::Serialization(format!("计数器值非整数: key={}", key)))?;
        let next = current + delta;
        *entry = next.to_string();
        Ok(next)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        self.evict_if_expired(key);
        let mut set = self.sets.entry(key.to_string()).or_default();
        Ok(set.insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        self.evict_if_expired(key);
        Ok(self
            .sets
            .get_mut(key)
            .map(|mut s| s.remove(member))
            .unwrap_or(false))
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        self.evict_if_expired(key);
        Ok(self
            .sets
            .get(key)
            .map(|s| s.contains(member))
            .unwrap_or(false))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.evict_if_expired(key);
        Ok(self
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.evict_if_expired(key);
        let mut hash = self.hashes.entry(key.to_string()).or_default();
        hash.insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.evict_if_expired(key);
        Ok(self.hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        self.evict_if_expired(key);
        Ok(self
            .hashes
            .get_mut(key)
            .map(|mut h| h.remove(field).is_some())
            .unwrap_or(false))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.evict_if_expired(key);
        Ok(self.hashes.get(key).map(|h| h.clone()).unwrap_or_default())
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        self.evict_if_expired(key);
        let mut hash = self.hashes.entry(key.to_string()).or_default();
        let current: i64 = hash
            .get(field)
            .map(|v| v.parse())
            .transpose()
            .map_err(|_| {
                NotifyError::Serialization(format!("哈希计数器值非整数: key={} field={}", key, field))
            })?
            .unwrap_or(0);
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.evict_if_expired(key);
        let mut zset = self.zsets.entry(key.to_string()).or_default();
        zset.insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        self.evict_if_expired(key);
        Ok(self
            .zsets
            .get_mut(key)
            .map(|mut z| z.remove(member).is_some())
            .unwrap_or(false))
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        self.evict_if_expired(key);
        Ok(self.zsets.get(key).map(|z| z.len() as u64).unwrap_or(0))
    }

    async fn zrange_asc(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        self.evict_if_expired(key);
        let members = self.sorted_members(key);
        Ok(match Self::resolve_range(members.len(), start, stop) {
            Some((start, stop)) => members[start..=stop]
                .iter()
                .map(|(m, _)| m.clone())
                .collect(),
            None => Vec::new(),
        })
    }

    async fn zrange_desc(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        self.evict_if_expired(key);
        let mut members = self.sorted_members(key);
        members.reverse();
        Ok(match Self::resolve_range(members.len(), start, stop) {
            Some((start, stop)) => members[start..=stop]
                .iter()
                .map(|(m, _)| m.clone())
                .collect(),
            None => Vec::new(),
        })
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        self.evict_if_expired(key);
        Ok(self
            .sorted_members(key)
            .into_iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .map(|(m, _)| m)
            .collect())
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        self.evict_if_expired(key);
        let victims: Vec<String> = self
            .sorted_members(key)
            .into_iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .map(|(m, _)| m)
            .collect();
        if let Some(mut zset) = self.zsets.get_mut(key) {
            for member in &victims {
                zset.remove(member);
            }
        }
        Ok(victims.len() as u64)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        self.evict_if_expired(key);
        Ok(self.zsets.get(key).and_then(|z| z.get(member).copied()))
    }
}
