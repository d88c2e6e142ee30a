use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::beacon::corroborate;
use super::clock::{Clock, SystemClock};
use super::geo::{BoundingBox, Coordinate};
use super::presence::{normalize_beacon_id, NearbyPresence, UserPresence};
use super::store::PresenceStore;
use crate::error::DiscoveryError;

/// 单次发现最多返回的用户数，需要更多时请缩小半径
pub const MAX_RESULTS: usize = 50;
pub const DEFAULT_RADIUS_METERS: f64 = 100.0;

#[derive(Clone)]
pub struct DiscoveryEngine {
    store: Arc<dyn PresenceStore>,
    clock: Arc<dyn Clock>,
}

impl DiscoveryEngine {
    pub fn new(store: Arc<dyn PresenceStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn with_system_clock(store: Arc<dyn PresenceStore>) -> Self {
        Self::new(store, Arc::new(SystemClock))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn register(&self, user_id: &str) -> Result<(), DiscoveryError> {
        self.store.register(user_id, self.now()).await
    }

    pub async fn presence(&self, user_id: &str) -> Result<UserPresence, DiscoveryError> {
        self.store
            .fetch(user_id)
            .await?
            .ok_or_else(|| DiscoveryError::NotFound(user_id.to_string()))
    }

    pub async fn set_opt_in(
        &self,
        user_id: &str,
        opted_in: bool,
        beacon_id: Option<String>,
        coord: Option<Coordinate>,
    ) -> Result<UserPresence, DiscoveryError> {
        let beacon_id = normalize_beacon_id(beacon_id)?;
        let coord = coord.map(Coordinate::validated).transpose()?;

        let presence = self
            .store
            .set_opt_in(user_id, opted_in, beacon_id, coord, self.now())
            .await?;
        tracing::debug!(
            user_id,
            opted_in,
            has_beacon = presence.beacon_id.is_some(),
            "Discover mode toggled"
        );
        Ok(presence)
    }

    pub async fn update_location(
        &self,
        user_id: &str,
        coord: Coordinate,
    ) -> Result<UserPresence, DiscoveryError> {
        let coord = coord.validated()?;
        let result = self.store.update_location(user_id, coord, self.now()).await;
        if let Err(DiscoveryError::NotParticipating) = &result {
            tracing::warn!(user_id, "Location update rejected: discover mode is off");
        }
        result
    }

    /// 心跳：延长样本有效期，可选地顺带更新坐标
    pub async fn heartbeat(
        &self,
        user_id: &str,
        coord: Option<Coordinate>,
    ) -> Result<UserPresence, DiscoveryError> {
        let coord = coord.map(Coordinate::validated).transpose()?;
        let result = self.store.heartbeat(user_id, coord, self.now()).await;
        if let Err(DiscoveryError::NotParticipating) = &result {
            tracing::warn!(user_id, "Heartbeat rejected: discover mode is off");
        }
        result
    }

    /// 在 `now` 时刻查找 `requester` 附近的用户，按距离升序，距离相同按用户ID排序
    pub async fn find_nearby(
        &self,
        requester_id: &str,
        requester: Coordinate,
        radius_meters: f64,
        now: DateTime<Utc>,
    ) -> Result<Vec<NearbyPresence>, DiscoveryError> {
        let requester = requester.validated()?;
        validate_radius(radius_meters)?;

        let bounds = BoundingBox::around(&requester, radius_meters);
        let candidates = self
            .store
            .fresh_participants_near(requester_id, now, &bounds)
            .await?;
        let scanned = candidates.len();

        let mut nearby: Vec<NearbyPresence> = candidates
            .into_iter()
            .filter(|p| p.user_id != requester_id && p.is_discoverable(now))
            .filter_map(|presence| {
                let distance_meters = requester.distance_to(&presence.coordinate()?);
                (distance_meters <= radius_meters).then_some(NearbyPresence {
                    presence,
                    distance_meters,
                })
            })
            .collect();

        nearby.sort_by(|a, b| {
            a.distance_meters
                .total_cmp(&b.distance_meters)
                .then_with(|| a.presence.user_id.cmp(&b.presence.user_id))
        });
        nearby.truncate(MAX_RESULTS);

        tracing::debug!(
            requester_id,
            radius_meters,
            scanned,
            found = nearby.len(),
            "Nearby search finished"
        );
        Ok(nearby)
    }

    /// 双方都开启发现时才能搜索附近的人
    pub async fn discover(
        &self,
        requester_id: &str,
        requester: Coordinate,
        radius_meters: f64,
    ) -> Result<Vec<NearbyPresence>, DiscoveryError> {
        let now = self.now();
        self.ensure_participating(requester_id).await?;
        self.find_nearby(requester_id, requester, radius_meters, now)
            .await
    }

    /// 服务端重新计算GPS候选，再用客户端扫描到的信标ID确认。
    ///
    /// 坐标缺省时使用请求者最近一次上报的位置；请求者没有任何位置时返回空列表。
    pub async fn verify_beacons(
        &self,
        requester_id: &str,
        observed_beacon_ids: &[String],
        requester: Option<Coordinate>,
        radius_meters: f64,
    ) -> Result<Vec<NearbyPresence>, DiscoveryError> {
        let now = self.now();
        let presence = self.ensure_participating(requester_id).await?;

        let Some(origin) = requester.or_else(|| presence.coordinate()) else {
            tracing::debug!(requester_id, "No location to verify beacons against");
            return Ok(Vec::new());
        };

        let observed: Vec<String> = observed_beacon_ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();

        let candidates = self
            .find_nearby(requester_id, origin, radius_meters, now)
            .await?;
        let gps_matches = candidates.len();
        let verified = corroborate(candidates, &observed);

        tracing::debug!(
            requester_id,
            observed = observed.len(),
            gps_matches,
            verified = verified.len(),
            "Beacon verification finished"
        );
        Ok(verified)
    }

    async fn ensure_participating(&self, user_id: &str) -> Result<UserPresence, DiscoveryError> {
        let presence = self.presence(user_id).await?;
        if !presence.opted_in {
            return Err(DiscoveryError::NotParticipating);
        }
        Ok(presence)
    }
}

pub fn validate_radius(radius_meters: f64) -> Result<(), DiscoveryError> {
    if !radius_meters.is_finite() || radius_meters < 0.0 {
        return Err(DiscoveryError::InvalidRadius(radius_meters));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discover::clock::ManualClock;
    use crate::discover::freshness::staleness_window;
    use crate::discover::store::MemoryPresenceStore;
    use chrono::{Duration, TimeZone};

    struct Fixture {
        engine: DiscoveryEngine,
        clock: Arc<ManualClock>,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 20, 18, 30, 0).unwrap()
    }

    fn coord(lat: f64, lon: f64) -> Coordinate {
        Coordinate::new(lat, lon).unwrap()
    }

    async fn fixture(users: &[&str]) -> Fixture {
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = DiscoveryEngine::new(Arc::new(MemoryPresenceStore::new()), clock.clone());
        for user in users {
            engine.register(user).await.unwrap();
        }
        Fixture { engine, clock }
    }

    fn ids(list: &[NearbyPresence]) -> Vec<&str> {
        list.iter().map(|n| n.presence.user_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_neighbour_expires_after_staleness_window() {
        let f = fixture(&["a", "b"]).await;
        f.engine.set_opt_in("a", true, None, Some(coord(0.0, 0.0))).await.unwrap();
        f.engine.set_opt_in("b", true, None, Some(coord(0.0, 0.0009))).await.unwrap();

        let found = f.engine.find_nearby("a", coord(0.0, 0.0), 150.0, t0()).await.unwrap();
        assert_eq!(ids(&found), vec!["b"]);
        assert!((found[0].distance_meters - 100.0).abs() < 1.0);

        let later = t0() + staleness_window() + Duration::seconds(1);
        let found = f.engine.find_nearby("a", coord(0.0, 0.0), 150.0, later).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_neighbour_visible() {
        let f = fixture(&["a", "b"]).await;
        f.engine.set_opt_in("a", true, None, Some(coord(0.0, 0.0))).await.unwrap();
        f.engine.set_opt_in("b", true, None, Some(coord(0.0, 0.0009))).await.unwrap();

        for _ in 0..3 {
            f.clock.advance(Duration::minutes(4));
            f.engine.heartbeat("b", None).await.unwrap();
        }
        let found = f
            .engine
            .find_nearby("a", coord(0.0, 0.0), 150.0, f.clock.now())
            .await
            .unwrap();
        assert_eq!(ids(&found), vec!["b"]);
    }

    #[tokio::test]
    async fn test_requester_never_sees_itself() {
        let f = fixture(&["a", "b"]).await;
        f.engine.set_opt_in("a", true, None, Some(coord(10.0, 10.0))).await.unwrap();
        f.engine.set_opt_in("b", true, None, Some(coord(10.0, 10.0))).await.unwrap();

        let found = f.engine.find_nearby("a", coord(10.0, 10.0), 1000.0, t0()).await.unwrap();
        assert_eq!(ids(&found), vec!["b"]);
    }

    #[tokio::test]
    async fn test_zero_radius_only_matches_exact_position() {
        let f = fixture(&["a", "same", "close", "cm"]).await;
        f.engine.set_opt_in("a", true, None, Some(coord(45.0, 7.0))).await.unwrap();
        f.engine.set_opt_in("same", true, None, Some(coord(45.0, 7.0))).await.unwrap();
        f.engine.set_opt_in("close", true, None, Some(coord(45.0, 7.00001))).await.unwrap();
        f.engine.set_opt_in("cm", true, None, Some(coord(45.0000001, 7.0))).await.unwrap();

        let found = f.engine.find_nearby("a", coord(45.0, 7.0), 0.0, t0()).await.unwrap();
        assert_eq!(ids(&found), vec!["same"]);
        assert_eq!(found[0].distance_meters, 0.0);
    }

    #[tokio::test]
    async fn test_results_are_ranked_and_ties_broken_by_user_id() {
        let f = fixture(&["me", "far", "zed", "amy", "mid"]).await;
        f.engine.set_opt_in("me", true, None, Some(coord(0.0, 0.0))).await.unwrap();
        f.engine.set_opt_in("far", true, None, Some(coord(0.0, 0.0008))).await.unwrap();
        f.engine.set_opt_in("zed", true, None, Some(coord(0.0, 0.0002))).await.unwrap();
        f.engine.set_opt_in("amy", true, None, Some(coord(0.0, -0.0002))).await.unwrap();
        f.engine.set_opt_in("mid", true, None, Some(coord(0.0004, 0.0))).await.unwrap();

        let found = f.engine.find_nearby("me", coord(0.0, 0.0), 500.0, t0()).await.unwrap();
        assert_eq!(ids(&found), vec!["amy", "zed", "mid", "far"]);
        assert!(found.windows(2).all(|w| w[0].distance_meters <= w[1].distance_meters));
    }

    #[tokio::test]
    async fn test_results_are_capped() {
        let users: Vec<String> = (0..60).map(|i| format!("u{:02}", i)).collect();
        let refs: Vec<&str> = users.iter().map(String::as_str).collect();
        let f = fixture(&refs).await;
        f.engine.register("me").await.unwrap();
        for (i, user) in users.iter().enumerate() {
            let lon = i as f64 * 0.00001;
            f.engine.set_opt_in(user, true, None, Some(coord(0.0, lon))).await.unwrap();
        }

        let found = f.engine.find_nearby("me", coord(0.0, 0.0), 1000.0, t0()).await.unwrap();
        assert_eq!(found.len(), MAX_RESULTS);
        assert_eq!(found[0].presence.user_id, "u00");
        assert_eq!(found[MAX_RESULTS - 1].presence.user_id, "u49");
    }

    #[tokio::test]
    async fn test_opt_out_removes_user_until_opt_in() {
        let f = fixture(&["a", "b"]).await;
        f.engine.set_opt_in("a", true, None, Some(coord(0.0, 0.0))).await.unwrap();
        f.engine.set_opt_in("b", true, None, Some(coord(0.0, 0.0001))).await.unwrap();

        f.engine.set_opt_in("b", false, None, None).await.unwrap();
        let found = f.engine.find_nearby("a", coord(0.0, 0.0), 100.0, t0()).await.unwrap();
        assert!(found.is_empty());

        f.engine.set_opt_in("b", true, None, None).await.unwrap();
        let found = f.engine.find_nearby("a", coord(0.0, 0.0), 100.0, t0()).await.unwrap();
        assert_eq!(ids(&found), vec!["b"]);
    }

    #[tokio::test]
    async fn test_updates_while_opted_out_fail_without_mutation() {
        let f = fixture(&["a"]).await;
        f.engine.set_opt_in("a", false, None, Some(coord(1.0, 1.0))).await.unwrap();

        let err = f.engine.update_location("a", coord(2.0, 2.0)).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::NotParticipating));
        let err = f.engine.heartbeat("a", Some(coord(3.0, 3.0))).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::NotParticipating));

        let presence = f.engine.presence("a").await.unwrap();
        assert_eq!(presence.coordinate(), Some(coord(1.0, 1.0)));
    }

    #[tokio::test]
    async fn test_invalid_input_is_rejected() {
        let f = fixture(&["a"]).await;
        let bad = Coordinate {
            latitude: 91.0,
            longitude: 0.0,
        };
        assert!(matches!(
            f.engine.find_nearby("a", bad, 100.0, t0()).await,
            Err(DiscoveryError::InvalidCoordinate(_))
        ));
        assert!(matches!(
            f.engine.find_nearby("a", coord(0.0, 0.0), -5.0, t0()).await,
            Err(DiscoveryError::InvalidRadius(_))
        ));
        f.engine.set_opt_in("a", true, None, None).await.unwrap();
        assert!(matches!(
            f.engine.update_location("a", bad).await,
            Err(DiscoveryError::InvalidCoordinate(_))
        ));
        assert!(matches!(
            f.engine.set_opt_in("ghost", true, None, None).await,
            Err(DiscoveryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_discover_requires_requester_opt_in() {
        let f = fixture(&["a", "b"]).await;
        f.engine.set_opt_in("b", true, None, Some(coord(0.0, 0.0))).await.unwrap();
        assert!(matches!(
            f.engine.discover("a", coord(0.0, 0.0), 100.0).await,
            Err(DiscoveryError::NotParticipating)
        ));

        f.engine.set_opt_in("a", true, None, None).await.unwrap();
        let found = f.engine.discover("a", coord(0.0, 0.0), 100.0).await.unwrap();
        assert_eq!(ids(&found), vec!["b"]);
    }

    #[tokio::test]
    async fn test_verify_beacons() {
        let f = fixture(&["a", "b", "c", "d"]).await;
        f.engine.set_opt_in("a", true, None, Some(coord(0.0, 0.0))).await.unwrap();
        f.engine.set_opt_in("b", true, Some("X1".into()), Some(coord(0.0, 0.0002))).await.unwrap();
        f.engine.set_opt_in("c", true, Some("X3".into()), Some(coord(0.0, 0.0003))).await.unwrap();
        // 信标ID匹配但不在GPS范围内
        f.engine.set_opt_in("d", true, Some("X2".into()), Some(coord(1.0, 1.0))).await.unwrap();

        let observed = vec!["X1".to_string(), "X2".to_string()];
        let verified = f.engine.verify_beacons("a", &observed, None, 100.0).await.unwrap();
        assert_eq!(ids(&verified), vec!["b"]);

        let all = f.engine.verify_beacons("a", &[], None, 100.0).await.unwrap();
        assert_eq!(ids(&all), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_verify_beacons_without_any_location_is_empty() {
        let f = fixture(&["a", "b"]).await;
        f.engine.set_opt_in("a", true, None, None).await.unwrap();
        f.engine.set_opt_in("b", true, Some("X1".into()), Some(coord(0.0, 0.0))).await.unwrap();

        let observed = vec!["X1".to_string()];
        let verified = f.engine.verify_beacons("a", &observed, None, 100.0).await.unwrap();
        assert!(verified.is_empty());
    }
}
