//! Identity and addressing
//!
//! Node identifiers, the append-only hop path carried by every envelope, and
//! per-node request ids.

mod node_id;
mod path;
mod request_id;

pub use node_id::NodeId;
pub use path::{NetworkPath, MAX_PATH_LEN};
pub use request_id::{CorrelationKey, RequestId, RequestIdGenerator, REQUEST_ID_OFFSET};
