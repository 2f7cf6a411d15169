pub mod api;
pub mod pdv;
pub mod pdv_data;
pub mod profile;
pub mod rewards;

pub use pdv::{PdvMessage, PdvMessageMeta, PdvMeta};
pub use pdv_data::{ObjectType, PdvData, PdvObject};
pub use profile::{Profile, ProfileParams};
pub use rewards::{PdvDelta, RewardsQueueItem};
