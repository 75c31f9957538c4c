// ABOUTME: Server role - replica provisioning and the HTTP sync surface

pub mod provision;
pub mod routes;

pub use provision::{validate_room_name, ReplicaCache};
pub use routes::{serve, ServerState};
