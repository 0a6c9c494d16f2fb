pub mod fetch;
pub mod ipc;
pub mod runtime;
pub mod upstream;
pub mod worker;

pub use fetch::{HttpPayloadFetcher, PayloadFetcher};
pub use ipc::IpcServer;
pub use upstream::{PushEvent, TcpUpstream, UpstreamClient};
pub use worker::WorkerRuntime;
