mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::geo::{BoundingBox, Coordinate};
use super::presence::UserPresence;
use crate::error::DiscoveryError;

pub use memory::MemoryPresenceStore;
pub use postgres::PgPresenceStore;

/// 用户在线发现状态的持久化存储。
///
/// 同一用户的写操作由存储层保证行级原子性（后到的写覆盖先到的写），
/// 不同用户之间的写互不阻塞。读操作是快照，不阻塞写。
/// 存储失败直接返回 `StorageUnavailable`，这里不做重试。
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// 确保用户有一条默认状态记录（身份服务创建账号时调用）
    async fn register(&self, user_id: &str, now: DateTime<Utc>) -> Result<(), DiscoveryError>;

    async fn fetch(&self, user_id: &str) -> Result<Option<UserPresence>, DiscoveryError>;

    /// 设置发现开关与信标ID，带坐标时同时刷新位置与样本时间
    async fn set_opt_in(
        &self,
        user_id: &str,
        opted_in: bool,
        beacon_id: Option<String>,
        coord: Option<Coordinate>,
        now: DateTime<Utc>,
    ) -> Result<UserPresence, DiscoveryError>;

    /// 未开启发现时返回 `NotParticipating`，且不修改已存坐标
    async fn update_location(
        &self,
        user_id: &str,
        coord: Coordinate,
        now: DateTime<Utc>,
    ) -> Result<UserPresence, DiscoveryError>;

    /// 刷新样本时间；不带坐标时保留原坐标
    async fn heartbeat(
        &self,
        user_id: &str,
        coord: Option<Coordinate>,
        now: DateTime<Utc>,
    ) -> Result<UserPresence, DiscoveryError>;

    /// 所有已开启发现、有坐标且样本未过期的用户（排除 `exclude_user_id`），顺序不定
    async fn fresh_participants(
        &self,
        exclude_user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<UserPresence>, DiscoveryError>;

    /// 同 `fresh_participants`，额外按经纬度范围预筛选
    async fn fresh_participants_near(
        &self,
        exclude_user_id: &str,
        now: DateTime<Utc>,
        bounds: &BoundingBox,
    ) -> Result<Vec<UserPresence>, DiscoveryError> {
        let participants = self.fresh_participants(exclude_user_id, now).await?;
        Ok(participants
            .into_iter()
            .filter(|p| p.coordinate().is_some_and(|c| bounds.contains(&c)))
            .collect())
    }
}
