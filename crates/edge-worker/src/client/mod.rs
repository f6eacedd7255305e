//! Control plane client.

mod control_plane;

pub use control_plane::{client_info, ControlPlaneClient};
