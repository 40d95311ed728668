pub mod descriptor;
pub mod error;
pub mod hash_id;
pub mod lengths;
pub mod peer_id;
pub mod rate_window;
pub mod spawn_utils;

pub use descriptor::TorrentDescriptor;
pub use error::{Error, Result};
pub use hash_id::Id20;
pub use peer_id::PeerId;
