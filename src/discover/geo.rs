use serde::{Deserialize, Serialize};

use crate::error::DiscoveryError;

pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0; // 地球半径（米）

/// 经过校验的经纬度坐标
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, DiscoveryError> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(DiscoveryError::InvalidCoordinate(format!(
                "latitude {} out of range [-90, 90]",
                latitude
            )));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(DiscoveryError::InvalidCoordinate(format!(
                "longitude {} out of range [-180, 180]",
                longitude
            )));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    pub fn validated(self) -> Result<Self, DiscoveryError> {
        Self::new(self.latitude, self.longitude)
    }

    /// 请求体中的可选坐标：要么都有，要么都没有
    pub fn from_optional(
        latitude: Option<f64>,
        longitude: Option<f64>,
    ) -> Result<Option<Self>, DiscoveryError> {
        match (latitude, longitude) {
            (Some(lat), Some(lon)) => Self::new(lat, lon).map(Some),
            (None, None) => Ok(None),
            (Some(_), None) => Err(DiscoveryError::InvalidCoordinate(
                "latitude given without longitude".into(),
            )),
            (None, Some(_)) => Err(DiscoveryError::InvalidCoordinate(
                "longitude given without latitude".into(),
            )),
        }
    }

    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        distance_meters(
            self.latitude,
            self.longitude,
            other.latitude,
            other.longitude,
        )
    }
}

// 计算球面距离（Haversine公式），返回米
pub fn distance_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let delta_phi = (lat2 - lat1).to_radians();
    let delta_lambda = (lon2 - lon1).to_radians();

    let a = (delta_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (delta_lambda / 2.0).sin().powi(2);

    EARTH_RADIUS_METERS * central_angle(a)
}

// 中心角 c = acos(1 - 2a) = 2·asin(√a)。
// 近距离时 1 - 2a 会舍入成 1.0，改用 asin 形式；其余情况用 acos，
// 参数钳制到 [-1, 1] 防止浮点误差越界产生 NaN
fn central_angle(a: f64) -> f64 {
    if a < 0.5 {
        2.0 * a.max(0.0).sqrt().asin()
    } else {
        (1.0 - 2.0 * a).clamp(-1.0, 1.0).acos()
    }
}

/// 候选预筛选用的经纬度范围，经度为 None 表示不限制
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_latitude: f64,
    pub max_latitude: f64,
    pub longitude: Option<(f64, f64)>,
}

// 预筛选边界的额外余量（米），避免边界上的点因舍入被漏掉
const BOUNDS_PADDING_METERS: f64 = 1.0;

impl BoundingBox {
    /// 以 center 为中心、半径 radius_meters 的球面圆的外接经纬度范围
    pub fn around(center: &Coordinate, radius_meters: f64) -> Self {
        let delta = (radius_meters + BOUNDS_PADDING_METERS) / EARTH_RADIUS_METERS;
        let delta_degrees = delta.to_degrees();

        let min_latitude = center.latitude - delta_degrees;
        let max_latitude = center.latitude + delta_degrees;

        // 覆盖极点时经度不受限制
        if delta >= std::f64::consts::PI || min_latitude <= -90.0 || max_latitude >= 90.0 {
            return Self {
                min_latitude: min_latitude.max(-90.0),
                max_latitude: max_latitude.min(90.0),
                longitude: None,
            };
        }

        let ratio = delta.sin() / center.latitude.to_radians().cos();
        if ratio >= 1.0 {
            return Self {
                min_latitude,
                max_latitude,
                longitude: None,
            };
        }
        let lon_delta = ratio.asin().to_degrees();
        let min_longitude = center.longitude - lon_delta;
        let max_longitude = center.longitude + lon_delta;

        // 跨越180度经线时同样不限制经度
        let longitude = if min_longitude < -180.0 || max_longitude > 180.0 {
            None
        } else {
            Some((min_longitude, max_longitude))
        };

        Self {
            min_latitude,
            max_latitude,
            longitude,
        }
    }

    pub fn contains(&self, point: &Coordinate) -> bool {
        if point.latitude < self.min_latitude || point.latitude > self.max_latitude {
            return false;
        }
        match self.longitude {
            Some((min, max)) => point.longitude >= min && point.longitude <= max,
            None => true,
        }
    }
}
