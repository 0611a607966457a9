mod closest_peers;
mod id;
mod peer;
mod routing_table;
mod storage;

pub use closest_peers::*;
pub use id::*;
pub use peer::*;
pub use routing_table::*;
pub use storage::*;
