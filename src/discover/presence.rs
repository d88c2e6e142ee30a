use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::freshness::is_fresh;
use super::geo::Coordinate;
use crate::error::DiscoveryError;

pub type UserId = String;

// 与数据库列 VARCHAR(255) 一致
pub const MAX_BEACON_ID_LEN: usize = 255;

/// 每个用户的在线发现状态，只保留最新一次位置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct UserPresence {
    pub user_id: UserId,
    pub opted_in: bool,
    pub beacon_id: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub sample_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl UserPresence {
    /// 账号创建时的默认状态：未开启发现，无位置
    pub fn new(user_id: impl Into<UserId>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            opted_in: false,
            beacon_id: None,
            latitude: None,
            longitude: None,
            sample_at: None,
            updated_at: now,
        }
    }

    pub fn coordinate(&self) -> Option<Coordinate> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(Coordinate {
                latitude,
                longitude,
            }),
            _ => None,
        }
    }

    /// 是否可以出现在他人的发现结果中
    pub fn is_discoverable(&self, now: DateTime<Utc>) -> bool {
        self.opted_in && self.coordinate().is_some() && is_fresh(self.sample_at, now)
    }

    pub(crate) fn apply_opt_in(
        &mut self,
        opted_in: bool,
        beacon_id: Option<String>,
        coord: Option<Coordinate>,
        now: DateTime<Utc>,
    ) {
        self.opted_in = opted_in;
        self.beacon_id = beacon_id;
        if let Some(coord) = coord {
            self.set_sample(coord, now);
        }
        self.updated_at = now;
    }

    pub(crate) fn apply_heartbeat(&mut self, coord: Option<Coordinate>, now: DateTime<Utc>) {
        match coord {
            Some(coord) => self.set_sample(coord, now),
            None => self.sample_at = Some(now),
        }
        self.updated_at = now;
    }

    pub(crate) fn set_sample(&mut self, coord: Coordinate, now: DateTime<Utc>) {
        self.latitude = Some(coord.latitude);
        self.longitude = Some(coord.longitude);
        self.sample_at = Some(now);
        self.updated_at = now;
    }
}

/// 规范化客户端上报的蓝牙/信标ID：去掉首尾空白，空串视为未提供
pub fn normalize_beacon_id(beacon_id: Option<String>) -> Result<Option<String>, DiscoveryError> {
    let Some(raw) = beacon_id else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.chars().count() > MAX_BEACON_ID_LEN {
        return Err(DiscoveryError::InvalidBeacon(format!(
            "beacon id longer than {} characters",
            MAX_BEACON_ID_LEN
        )));
    }
    Ok(Some(trimmed.to_string()))
}

/// 发现结果中的一项
#[derive(Debug, Clone, PartialEq)]
pub struct NearbyPresence {
    pub presence: UserPresence,
    pub distance_meters: f64,
}
