// tether-core: anchors, block mapping, relocation and the AI gateway conflict layer

pub mod anchor;
pub mod config;
pub mod crdt;
pub mod dirty;
pub mod frontier;
pub mod gateway;
pub mod hash;
pub mod mapping;
pub mod relocate;
pub mod snapshot;

pub use anchor::{Anchor, Bias};
pub use config::GatewayConfig;
pub use frontier::FrontierOrdering;
pub use mapping::{create_block_mapping, BlockMapping, BlockTransform, MappingError, MappingOptions};
pub use relocate::{RelocationLevel, RelocationMethod, RelocationOutcome};
pub use snapshot::DocumentSnapshot;
