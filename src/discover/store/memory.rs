use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::PresenceStore;
use crate::discover::freshness::freshness_cutoff;
use crate::discover::geo::Coordinate;
use crate::discover::presence::{UserId, UserPresence};
use crate::error::DiscoveryError;

/// 进程内存储，用于测试和本地开发。
///
/// DashMap 按分片加锁：同一用户的写操作在条目锁内串行执行，
/// 不同用户的写操作互不阻塞。
#[derive(Clone, Default)]
pub struct MemoryPresenceStore {
    by_user: Arc<DashMap<UserId, UserPresence>>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn modify<F>(&self, user_id: &str, f: F) -> Result<UserPresence, DiscoveryError>
    where
        F: FnOnce(&mut UserPresence) -> Result<(), DiscoveryError>,
    {
        let mut entry = self
            .by_user
            .get_mut(user_id)
            .ok_or_else(|| DiscoveryError::NotFound(user_id.to_string()))?;
        f(entry.value_mut())?;
        Ok(entry.value().clone())
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn register(&self, user_id: &str, now: DateTime<Utc>) -> Result<(), DiscoveryError> {
        self.by_user
            .entry(user_id.to_string())
            .or_insert_with(|| UserPresence::new(user_id, now));
        Ok(())
    }

    async fn fetch(&self, user_id: &str) -> Result<Option<UserPresence>, DiscoveryError> {
        Ok(self.by_user.get(user_id).map(|entry| entry.value().clone()))
    }

    async fn set_opt_in(
        &self,
        user_id: &str,
        opted_in: bool,
        beacon_id: Option<String>,
        coord: Option<Coordinate>,
        now: DateTime<Utc>,
    ) -> Result<UserPresence, DiscoveryError> {
        self.modify(user_id, |presence| {
            presence.apply_opt_in(opted_in, beacon_id, coord, now);
            Ok(())
        })
    }

    async fn update_location(
        &self,
        user_id: &str,
        coord: Coordinate,
        now: DateTime<Utc>,
    ) -> Result<UserPresence, DiscoveryError> {
        self.modify(user_id, |presence| {
            if !presence.opted_in {
                return Err(DiscoveryError::NotParticipating);
            }
            presence.set_sample(coord, now);
            Ok(())
        })
    }

    async fn heartbeat(
        &self,
        user_id: &str,
        coord: Option<Coordinate>,
        now: DateTime<Utc>,
    ) -> Result<UserPresence, DiscoveryError> {
        self.modify(user_id, |presence| {
            if !presence.opted_in {
                return Err(DiscoveryError::NotParticipating);
            }
            presence.apply_heartbeat(coord, now);
            Ok(())
        })
    }

    async fn fresh_participants(
        &self,
        exclude_user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<UserPresence>, DiscoveryError> {
        let cutoff = freshness_cutoff(now);
        Ok(self
            .by_user
            .iter()
            .filter(|entry| entry.key().as_str() != exclude_user_id)
            .filter(|entry| {
                let p = entry.value();
                p.opted_in
                    && p.coordinate().is_some()
                    && p.sample_at.is_some_and(|sample_at| sample_at >= cutoff)
            })
            .map(|entry| entry.value().clone())
            .collect())
    }
}
