//! In-pipeline transforms.
//!
//! - `filter`: label / confidence filtering
//! - `custom_node`: externally hosted transform reached over a sequenced session
//! - `scenario`: the counting-line and zone event engines
//!
//! Transforms mutate the frame they own and decide whether it moves on. They
//! MUST NOT keep a reference to a frame after returning from `process()`.

pub mod custom_node;
pub mod filter;
pub mod scenario;

pub use custom_node::{
    CustomNodeChannel, CustomNodeConnector, CustomNodeTransform, HandshakeReply, HandshakeRequest,
    HttpCustomNodeConnector, ProcessReply, ProcessRequest,
};
pub use filter::FilterTransform;
pub use scenario::ScenarioTransform;
