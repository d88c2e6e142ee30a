use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

use super::presence::UserId;
use crate::error::DiscoveryError;

/// 发现结果中允许公开的资料字段
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PublicProfile {
    pub user_id: UserId,
    pub nickname: String,
    pub avatar: Option<String>,
    pub instagram: Option<String>,
    pub twitter: Option<String>,
    pub linkedin: Option<String>,
    pub facebook: Option<String>,
}

impl PublicProfile {
    /// 查不到资料时的占位
    pub fn placeholder(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            nickname: user_id.to_string(),
            ..Default::default()
        }
    }
}

/// 用户资料由资料服务维护，这里只读取公开字段
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn public_profiles(
        &self,
        user_ids: &[UserId],
    ) -> Result<HashMap<UserId, PublicProfile>, DiscoveryError>;
}

#[derive(Clone)]
pub struct PgProfileDirectory {
    pool: PgPool,
}

impl PgProfileDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileDirectory for PgProfileDirectory {
    async fn public_profiles(
        &self,
        user_ids: &[UserId],
    ) -> Result<HashMap<UserId, PublicProfile>, DiscoveryError> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let profiles = sqlx::query_as::<_, PublicProfile>(
            r#"
            SELECT
                u.user_id,
                u.nickname,
                p.avatar,
                p.instagram,
                p.twitter,
                p.linkedin,
                p.facebook
            FROM users u
            LEFT JOIN user_profiles p ON p.user_id = u.user_id
            WHERE u.user_id = ANY($1)
            "#,
        )
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(profiles
            .into_iter()
            .map(|profile| (profile.user_id.clone(), profile))
            .collect())
    }
}

#[derive(Clone, Default)]
pub struct MemoryProfileDirectory {
    profiles: Arc<DashMap<UserId, PublicProfile>>,
}

impl MemoryProfileDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: PublicProfile) {
        self.profiles.insert(profile.user_id.clone(), profile);
    }
}

#[async_trait]
impl ProfileDirectory for MemoryProfileDirectory {
    async fn public_profiles(
        &self,
        user_ids: &[UserId],
    ) -> Result<HashMap<UserId, PublicProfile>, DiscoveryError> {
        Ok(user_ids
            .iter()
            .filter_map(|id| self.profiles.get(id).map(|p| (id.clone(), p.value().clone())))
            .collect())
    }
}
