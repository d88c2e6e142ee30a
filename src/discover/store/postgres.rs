use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::PresenceStore;
use crate::discover::freshness::freshness_cutoff;
use crate::discover::geo::{BoundingBox, Coordinate};
use crate::discover::presence::UserPresence;
use crate::error::DiscoveryError;

// users 表由身份服务维护，这里只管理 user_presence
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS user_presence (
        user_id TEXT PRIMARY KEY REFERENCES users(user_id) ON DELETE CASCADE,
        opted_in BOOLEAN NOT NULL DEFAULT false,
        beacon_id VARCHAR(255),
        latitude DOUBLE PRECISION CHECK (latitude BETWEEN -90 AND 90),
        longitude DOUBLE PRECISION CHECK (longitude BETWEEN -180 AND 180),
        sample_at TIMESTAMPTZ,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CHECK ((latitude IS NULL) = (longitude IS NULL))
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_user_presence_discoverable
    ON user_presence (latitude, longitude, sample_at)
    WHERE opted_in
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_user_presence_beacon_id
    ON user_presence (beacon_id)
    "#,
];

const PRESENCE_COLUMNS: &str =
    "user_id, opted_in, beacon_id, latitude, longitude, sample_at, updated_at";

#[derive(Clone)]
pub struct PgPresenceStore {
    pool: PgPool,
}

impl PgPresenceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 建表和索引，可重复执行
    pub async fn init_schema(&self) -> Result<(), DiscoveryError> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(&self.pool).await?;
        }
        tracing::info!("user_presence table ready");
        Ok(())
    }

    // 条件更新没有命中时，区分用户不存在和未开启发现
    async fn missing_row_error(&self, user_id: &str) -> DiscoveryError {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM users WHERE user_id = $1)",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await;

        match exists {
            Ok(true) => DiscoveryError::NotParticipating,
            Ok(false) => DiscoveryError::NotFound(user_id.to_string()),
            Err(e) => e.into(),
        }
    }
}

#[async_trait]
impl PresenceStore for PgPresenceStore {
    async fn register(&self, user_id: &str, now: DateTime<Utc>) -> Result<(), DiscoveryError> {
        sqlx::query(
            r#"
            INSERT INTO user_presence (user_id, updated_at)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch(&self, user_id: &str) -> Result<Option<UserPresence>, DiscoveryError> {
        // 没有 user_presence 行的用户视为默认状态
        let presence = sqlx::query_as::<_, UserPresence>(
            r#"
            SELECT
                u.user_id,
                COALESCE(p.opted_in, false) AS opted_in,
                p.beacon_id,
                p.latitude,
                p.longitude,
                p.sample_at,
                COALESCE(p.updated_at, NOW()) AS updated_at
            FROM users u
            LEFT JOIN user_presence p ON p.user_id = u.user_id
            WHERE u.user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(presence)
    }

    async fn set_opt_in(
        &self,
        user_id: &str,
        opted_in: bool,
        beacon_id: Option<String>,
        coord: Option<Coordinate>,
        now: DateTime<Utc>,
    ) -> Result<UserPresence, DiscoveryError> {
        let sample_at = coord.map(|_| now);
        let sql = format!(
            r#"
            INSERT INTO user_presence (
                user_id, opted_in, beacon_id, latitude, longitude, sample_at, updated_at
            )
            SELECT u.user_id, $2, $3, $4, $5, $6, $7
            FROM users u
            WHERE u.user_id = $1
            ON CONFLICT (user_id) DO UPDATE SET
                opted_in = EXCLUDED.opted_in,
                beacon_id = EXCLUDED.beacon_id,
                latitude = COALESCE(EXCLUDED.latitude, user_presence.latitude),
                longitude = COALESCE(EXCLUDED.longitude, user_presence.longitude),
                sample_at = COALESCE(EXCLUDED.sample_at, user_presence.sample_at),
                updated_at = EXCLUDED.updated_at
            RETURNING {}
            "#,
            PRESENCE_COLUMNS
        );

        sqlx::query_as::<_, UserPresence>(&sql)
            .bind(user_id)
            .bind(opted_in)
            .bind(beacon_id)
            .bind(coord.map(|c| c.latitude))
            .bind(coord.map(|c| c.longitude))
            .bind(sample_at)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DiscoveryError::NotFound(user_id.to_string()))
    }

    async fn update_location(
        &self,
        user_id: &str,
        coord: Coordinate,
        now: DateTime<Utc>,
    ) -> Result<UserPresence, DiscoveryError> {
        let sql = format!(
            r#"
            UPDATE user_presence
            SET latitude = $2,
                longitude = $3,
                sample_at = $4,
                updated_at = $4
            WHERE user_id = $1 AND opted_in = true
            RETURNING {}
            "#,
            PRESENCE_COLUMNS
        );

        let updated = sqlx::query_as::<_, UserPresence>(&sql)
            .bind(user_id)
            .bind(coord.latitude)
            .bind(coord.longitude)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        match updated {
            Some(presence) => Ok(presence),
            None => Err(self.missing_row_error(user_id).await),
        }
    }

    async fn heartbeat(
        &self,
        user_id: &str,
        coord: Option<Coordinate>,
        now: DateTime<Utc>,
    ) -> Result<UserPresence, DiscoveryError> {
        let sql = format!(
            r#"
            UPDATE user_presence
            SET latitude = COALESCE($2, latitude),
                longitude = COALESCE($3, longitude),
                sample_at = $4,
                updated_at = $4
            WHERE user_id = $1 AND opted_in = true
            RETURNING {}
            "#,
            PRESENCE_COLUMNS
        );

        let updated = sqlx::query_as::<_, UserPresence>(&sql)
            .bind(user_id)
            .bind(coord.map(|c| c.latitude))
            .bind(coord.map(|c| c.longitude))
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        match updated {
            Some(presence) => Ok(presence),
            None => Err(self.missing_row_error(user_id).await),
        }
    }

    async fn fresh_participants(
        &self,
        exclude_user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<UserPresence>, DiscoveryError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM user_presence
            WHERE opted_in = true
                AND user_id <> $1
                AND latitude IS NOT NULL
                AND longitude IS NOT NULL
                AND sample_at >= $2
            "#,
            PRESENCE_COLUMNS
        );

        let participants = sqlx::query_as::<_, UserPresence>(&sql)
            .bind(exclude_user_id)
            .bind(freshness_cutoff(now))
            .fetch_all(&self.pool)
            .await?;
        Ok(participants)
    }

    async fn fresh_participants_near(
        &self,
        exclude_user_id: &str,
        now: DateTime<Utc>,
        bounds: &BoundingBox,
    ) -> Result<Vec<UserPresence>, DiscoveryError> {
        // 先用经纬度范围粗筛，精确距离由调用方计算
        let sql = format!(
            r#"
            SELECT {}
            FROM user_presence
            WHERE opted_in = true
                AND user_id <> $1
                AND latitude IS NOT NULL
                AND longitude IS NOT NULL
                AND sample_at >= $2
                AND latitude BETWEEN $3 AND $4
                AND ($5::DOUBLE PRECISION IS NULL
                    OR longitude BETWEEN $5::DOUBLE PRECISION AND $6::DOUBLE PRECISION)
            "#,
            PRESENCE_COLUMNS
        );

        let participants = sqlx::query_as::<_, UserPresence>(&sql)
            .bind(exclude_user_id)
            .bind(freshness_cutoff(now))
            .bind(bounds.min_latitude)
            .bind(bounds.max_latitude)
            .bind(bounds.longitude.map(|(min, _)| min))
            .bind(bounds.longitude.map(|(_, max)| max))
            .fetch_all(&self.pool)
            .await?;
        Ok(participants)
    }
}

// 需要 DATABASE_URL 指向可建库的 Postgres：cargo test -- --ignored
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
    }

    fn coord(lat: f64, lon: f64) -> Coordinate {
        Coordinate::new(lat, lon).unwrap()
    }

    // users 表在生产环境由身份服务创建
    async fn store_with_users(pool: PgPool, users: &[&str]) -> PgPresenceStore {
        sqlx::query("CREATE TABLE users (user_id TEXT PRIMARY KEY, nickname TEXT NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        for user in users {
            sqlx::query("INSERT INTO users (user_id, nickname) VALUES ($1, $1)")
                .bind(*user)
                .execute(&pool)
                .await
                .unwrap();
        }
        let store = PgPresenceStore::new(pool);
        store.init_schema().await.unwrap();
        store.init_schema().await.unwrap();
        store
    }

    #[sqlx::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_user_without_row_has_default_presence(pool: PgPool) {
        let store = store_with_users(pool, &["alice"]).await;

        let presence = store.fetch("alice").await.unwrap().unwrap();
        assert!(!presence.opted_in);
        assert_eq!(presence.coordinate(), None);
        assert!(store.fetch("ghost").await.unwrap().is_none());
    }

    #[sqlx::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_conditional_updates_distinguish_missing_and_opted_out(pool: PgPool) {
        let store = store_with_users(pool, &["alice"]).await;

        assert!(matches!(
            store.update_location("alice", coord(1.0, 1.0), t0()).await,
            Err(DiscoveryError::NotParticipating)
        ));
        assert!(matches!(
            store.heartbeat("ghost", None, t0()).await,
            Err(DiscoveryError::NotFound(id)) if id == "ghost"
        ));
        assert!(matches!(
            store.set_opt_in("ghost", true, None, None, t0()).await,
            Err(DiscoveryError::NotFound(_))
        ));

        store
            .set_opt_in("alice", false, Some("B1".into()), Some(coord(1.0, 1.0)), t0())
            .await
            .unwrap();
        assert!(matches!(
            store.heartbeat("alice", Some(coord(2.0, 2.0)), t0()).await,
            Err(DiscoveryError::NotParticipating)
        ));
        let presence = store.fetch("alice").await.unwrap().unwrap();
        assert_eq!(presence.coordinate(), Some(coord(1.0, 1.0)));
    }

    #[sqlx::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_toggle_keeps_coordinate_and_heartbeat_refreshes(pool: PgPool) {
        let store = store_with_users(pool, &["alice"]).await;

        store
            .set_opt_in("alice", true, Some("B1".into()), Some(coord(10.0, 20.0)), t0())
            .await
            .unwrap();
        let later = t0() + Duration::minutes(3);
        let presence = store.set_opt_in("alice", true, Some("B2".into()), None, later).await.unwrap();
        assert_eq!(presence.coordinate(), Some(coord(10.0, 20.0)));
        assert_eq!(presence.sample_at, Some(t0()));
        assert_eq!(presence.beacon_id.as_deref(), Some("B2"));

        let presence = store.heartbeat("alice", None, later).await.unwrap();
        assert_eq!(presence.coordinate(), Some(coord(10.0, 20.0)));
        assert_eq!(presence.sample_at, Some(later));
    }

    #[sqlx::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_fresh_participants_near_applies_bounds(pool: PgPool) {
        let store =
            store_with_users(pool, &["me", "near", "far", "stale", "off", "dateline"]).await;
        let old = t0() - Duration::minutes(10);
        store.set_opt_in("me", true, None, Some(coord(0.0, 0.0)), t0()).await.unwrap();
        store.set_opt_in("near", true, None, Some(coord(0.0, 0.0005)), t0()).await.unwrap();
        store.set_opt_in("far", true, None, Some(coord(0.0, 0.5)), t0()).await.unwrap();
        store.set_opt_in("stale", true, None, Some(coord(0.0, 0.0001)), old).await.unwrap();
        store.set_opt_in("off", false, None, Some(coord(0.0, 0.0001)), t0()).await.unwrap();
        store
            .set_opt_in("dateline", true, None, Some(coord(0.0, -179.9999)), t0())
            .await
            .unwrap();

        let bounds = BoundingBox::around(&coord(0.0, 0.0), 100.0);
        let ids: Vec<String> = store
            .fresh_participants_near("me", t0(), &bounds)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.user_id)
            .collect();
        assert_eq!(ids, vec!["near".to_string()]);

        // 经度不受限时只按纬度筛选
        let bounds = BoundingBox::around(&coord(0.0, 179.9999), 100.0);
        assert_eq!(bounds.longitude, None);
        let mut ids: Vec<String> = store
            .fresh_participants_near("nobody", t0(), &bounds)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.user_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["dateline", "far", "me", "near"]);
    }
}
