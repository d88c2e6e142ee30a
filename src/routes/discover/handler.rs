use axum::{
    Extension,
    body::Bytes,
    extract::{Json, State},
};

use super::model::{
    ApiJson, HeartbeatRequest, HeartbeatResponse, LocationResponse, NearbyRequest, NearbyResponse,
    NearbyUser, PresenceSummary, ToggleDiscoverRequest, UpdateLocationRequest,
    VerifyBeaconRequest, VerifyBeaconResponse,
};
use crate::{
    AppState,
    discover::{Coordinate, NearbyPresence},
    error::DiscoveryError,
    utils::{ApiResponse, Claims, success_to_api_response},
};

type ApiResult<T> = Result<Json<ApiResponse<T>>, DiscoveryError>;

// 合并资料服务提供的公开字段
async fn with_profiles(
    state: &AppState,
    nearby: Vec<NearbyPresence>,
) -> Result<Vec<NearbyUser>, DiscoveryError> {
    let ids: Vec<String> = nearby.iter().map(|n| n.presence.user_id.clone()).collect();
    let mut profiles = state.profiles.public_profiles(&ids).await?;

    Ok(nearby
        .into_iter()
        .map(|n| {
            let profile = profiles.remove(&n.presence.user_id);
            NearbyUser::new(n, profile)
        })
        .collect())
}

// 开启/关闭发现模式
pub async fn toggle_discover(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<ToggleDiscoverRequest>,
) -> ApiResult<PresenceSummary> {
    let coord = Coordinate::from_optional(req.latitude, req.longitude)?;
    let presence = state
        .engine
        .set_opt_in(&claims.sub, req.discover_status, req.beacon_id, coord)
        .await?;

    Ok(success_to_api_response(PresenceSummary::from(presence)))
}

pub async fn update_location(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<UpdateLocationRequest>,
) -> ApiResult<LocationResponse> {
    let coord = req.coordinate()?;
    let presence = state.engine.update_location(&claims.sub, coord).await?;

    Ok(success_to_api_response(LocationResponse::from(presence)))
}

// 心跳，保持在发现列表中；请求体可以为空
pub async fn heartbeat(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    body: Bytes,
) -> ApiResult<HeartbeatResponse> {
    let req = HeartbeatRequest::parse(&body)?;
    let coord = Coordinate::from_optional(req.latitude, req.longitude)?;
    let presence = state.engine.heartbeat(&claims.sub, coord).await?;

    Ok(success_to_api_response(HeartbeatResponse::from(presence)))
}

// 按GPS位置查找附近的人
pub async fn find_nearby(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<NearbyRequest>,
) -> ApiResult<NearbyResponse> {
    let coord = req.coordinate()?;
    let radius = state.config.search_radius(req.radius_meters);

    let nearby = state.engine.discover(&claims.sub, coord, radius).await?;
    let users = with_profiles(&state, nearby).await?;

    tracing::info!(user_id = %claims.sub, radius, count = users.len(), "Nearby users found");
    Ok(success_to_api_response(NearbyResponse {
        count: users.len(),
        users,
    }))
}

// 信标二次确认，beacon_ids 为空时退回仅GPS匹配
pub async fn verify_beacon(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<VerifyBeaconRequest>,
) -> ApiResult<VerifyBeaconResponse> {
    let coord = Coordinate::from_optional(req.latitude, req.longitude)?;
    let radius = state.config.search_radius(req.radius_meters);

    let verified = state
        .engine
        .verify_beacons(&claims.sub, &req.beacon_ids, coord, radius)
        .await?;
    let users = with_profiles(&state, verified).await?;

    Ok(success_to_api_response(VerifyBeaconResponse {
        count: users.len(),
        verified_users: users,
    }))
}

pub async fn my_presence(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<PresenceSummary> {
    let presence = state.engine.presence(&claims.sub).await?;
    Ok(success_to_api_response(PresenceSummary::from(presence)))
}
