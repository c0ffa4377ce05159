//! Worker transport.
//!
//! The broker talks to every worker through a [`WorkerProxy`]:
//! - **Process workers**: external programs speaking JSON lines on stdin/stdout
//! - **Channel workers**: in-process tasks connected by tokio channels
//!
//! # Components
//!
//! - [`protocol`]: wire envelopes (`ClientRequest`, `WorkerCall`, `WorkerReply`)
//! - [`ProcessWorker`] / [`ProcessSpawner`]: child-process transport
//! - [`ChannelWorker`] / [`InProcessSpawner`]: in-process transport
//! - [`heartbeat`]: periodic liveness events
//!
//! # Lifecycle
//!
//! 1. The broker reserves a worker id and asks a [`WorkerSpawner`] for a proxy
//! 2. The worker reports `ready`, then heartbeats while alive
//! 3. Each call is answered by exactly one reply carrying the call's job id
//! 4. `close` tears the channel down; a closed worker is never reused

pub mod channel;
pub mod heartbeat;
pub mod process;
pub mod protocol;
pub mod proxy;

pub use channel::{ChannelWorker, InProcessSpawner, RemoteWorker};
pub use process::{ProcessSpawner, ProcessWorker};
pub use protocol::{ClientRequest, ResultBytes, WorkerCall, WorkerEvent, WorkerMessage, WorkerReply};
pub use proxy::{WorkerProxy, WorkerSpawner};
