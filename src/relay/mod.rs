pub mod coordinator;
pub mod correlation;
pub mod host;
pub mod origin;
pub mod queue;
pub mod registry;

pub use coordinator::{ClientAttachment, Coordinator, WorkerAttachment};
pub use correlation::{CommitResolver, CorrelationTable};
pub use host::{ClientSession, RelayHandle, RelayHost, WorkerForwarder, WorkerSession};
pub use origin::{EvictionPolicy, RequestOriginTracker};
pub use queue::OutboundQueue;
pub use registry::{ChannelRegistry, ClientChannel};
