mod handler;
mod model;

pub use handler::{
    find_nearby,
    heartbeat,
    my_presence,
    toggle_discover,
    update_location,
    verify_beacon,
};
pub use model::{
    HeartbeatResponse, LocationResponse, NearbyResponse, NearbyUser, PresenceSummary,
    VerifyBeaconResponse,
};
