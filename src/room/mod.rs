//! Rooms, their access PINs and membership

mod registry;
mod state;

pub use registry::{normalize_room_id, AccessCheck, RoomCredentials, RoomRegistry, SweeperHandle};
pub use state::{Removal, Role, Room};
