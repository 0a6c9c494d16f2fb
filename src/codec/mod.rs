pub mod ack;
pub mod chunk;
pub mod framing;

pub use ack::normalize_analysis_ack;
pub use chunk::{ChunkPlan, ChunkPlanner, EnrichedItem};
pub use framing::{strip_transport_marker, TRANSPORT_MARKER};
