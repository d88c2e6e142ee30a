pub mod beacon;
pub mod clock;
pub mod engine;
pub mod freshness;
pub mod geo;
pub mod presence;
pub mod profile;
pub mod store;

pub use beacon::corroborate;
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{DEFAULT_RADIUS_METERS, DiscoveryEngine, MAX_RESULTS};
pub use freshness::{STALENESS_WINDOW_SECS, is_fresh, staleness_window};
pub use geo::{BoundingBox, Coordinate, distance_meters};
pub use presence::{NearbyPresence, UserId, UserPresence};
pub use profile::{MemoryProfileDirectory, PgProfileDirectory, ProfileDirectory, PublicProfile};
pub use store::{MemoryPresenceStore, PgPresenceStore, PresenceStore};
