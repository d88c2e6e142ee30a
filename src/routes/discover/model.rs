use axum::extract::FromRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::discover::{Coordinate, NearbyPresence, PublicProfile, UserPresence};
use crate::error::DiscoveryError;

/// 与 `Json` 相同，但解析失败时返回统一的错误格式
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(DiscoveryError))]
pub struct ApiJson<T>(pub T);

// 必填坐标：缺任意一半都按坐标错误处理
fn required_coordinate(
    latitude: Option<f64>,
    longitude: Option<f64>,
) -> Result<Coordinate, DiscoveryError> {
    Coordinate::from_optional(latitude, longitude)?
        .ok_or_else(|| DiscoveryError::InvalidCoordinate("latitude and longitude are required".into()))
}

#[derive(Debug, Deserialize)]
pub struct ToggleDiscoverRequest {
    #[serde(default, alias = "bluetooth_id")]
    pub beacon_id: Option<String>,
    pub discover_status: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateLocationRequest {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl UpdateLocationRequest {
    pub fn coordinate(&self) -> Result<Coordinate, DiscoveryError> {
        required_coordinate(self.latitude, self.longitude)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatRequest {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl HeartbeatRequest {
    /// 空请求体视为不带坐标的心跳
    pub fn parse(body: &[u8]) -> Result<Self, DiscoveryError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body).map_err(|e| DiscoveryError::InvalidRequest(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
pub struct NearbyRequest {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub radius_meters: Option<f64>,
}

impl NearbyRequest {
    pub fn coordinate(&self) -> Result<Coordinate, DiscoveryError> {
        required_coordinate(self.latitude, self.longitude)
    }
}

#[derive(Debug, Deserialize)]
pub struct VerifyBeaconRequest {
    #[serde(default, alias = "bluetooth_ids")]
    pub beacon_ids: Vec<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub radius_meters: Option<f64>,
}

/// 调用者自己的发现状态
#[derive(Debug, Serialize, Deserialize)]
pub struct PresenceSummary {
    pub user_id: String,
    pub discover_status: bool,
    pub beacon_id: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub sample_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<UserPresence> for PresenceSummary {
    fn from(presence: UserPresence) -> Self {
        Self {
            user_id: presence.user_id,
            discover_status: presence.opted_in,
            beacon_id: presence.beacon_id,
            latitude: presence.latitude,
            longitude: presence.longitude,
            sample_at: presence.sample_at,
            updated_at: presence.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LocationResponse {
    pub user_id: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub sample_at: Option<DateTime<Utc>>,
}

impl From<UserPresence> for LocationResponse {
    fn from(presence: UserPresence) -> Self {
        Self {
            user_id: presence.user_id,
            latitude: presence.latitude,
            longitude: presence.longitude,
            sample_at: presence.sample_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub user_id: String,
    pub sample_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<UserPresence> for HeartbeatResponse {
    fn from(presence: UserPresence) -> Self {
        Self {
            user_id: presence.user_id,
            sample_at: presence.sample_at,
            updated_at: presence.updated_at,
        }
    }
}

/// 附近的人，只包含公开字段；对方坐标不返回，只返回距离
#[derive(Debug, Serialize, Deserialize)]
pub struct NearbyUser {
    pub user_id: String,
    pub nickname: String,
    pub avatar: Option<String>,
    pub instagram: Option<String>,
    pub twitter: Option<String>,
    pub linkedin: Option<String>,
    pub facebook: Option<String>,
    pub beacon_id: Option<String>,
    pub distance_meters: f64,
    pub last_seen: Option<DateTime<Utc>>,
}

impl NearbyUser {
    pub fn new(nearby: NearbyPresence, profile: Option<PublicProfile>) -> Self {
        let profile =
            profile.unwrap_or_else(|| PublicProfile::placeholder(&nearby.presence.user_id));
        Self {
            user_id: nearby.presence.user_id,
            nickname: profile.nickname,
            avatar: profile.avatar,
            instagram: profile.instagram,
            twitter: profile.twitter,
            linkedin: profile.linkedin,
            facebook: profile.facebook,
            beacon_id: nearby.presence.beacon_id,
            distance_meters: nearby.distance_meters,
            last_seen: nearby.presence.sample_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NearbyResponse {
    pub users: Vec<NearbyUser>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyBeaconResponse {
    pub verified_users: Vec<NearbyUser>,
    pub count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_body_may_be_empty() {
        let req = HeartbeatRequest::parse(b"").unwrap();
        assert_eq!((req.latitude, req.longitude), (None, None));
        let req = HeartbeatRequest::parse(b"  \n").unwrap();
        assert_eq!(req.latitude, None);

        let req = HeartbeatRequest::parse(br#"{"latitude": 1.5, "longitude": 2.5}"#).unwrap();
        assert_eq!((req.latitude, req.longitude), (Some(1.5), Some(2.5)));

        assert!(matches!(
            HeartbeatRequest::parse(b"{not json"),
            Err(DiscoveryError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_missing_coordinate_half_is_invalid_coordinate() {
        let req = UpdateLocationRequest {
            latitude: Some(1.0),
            longitude: None,
        };
        assert!(matches!(req.coordinate(), Err(DiscoveryError::InvalidCoordinate(_))));

        let req = NearbyRequest {
            latitude: None,
            longitude: None,
            radius_meters: Some(50.0),
        };
        assert!(matches!(req.coordinate(), Err(DiscoveryError::InvalidCoordinate(_))));

        let req = NearbyRequest {
            latitude: Some(-33.86),
            longitude: Some(151.2),
            radius_meters: None,
        };
        assert_eq!(req.coordinate().unwrap(), Coordinate::new(-33.86, 151.2).unwrap());
    }
}
