//! Session coordination between the coordinator node and its workers.
//!
//! - [`protocol`]: control messages exchanged over TCP
//! - [`codec`]: length-prefixed JSON framing
//! - [`session`]: registration, rank assignment and the session state machine
//! - [`schedule`]: pairing of nodes into bandwidth measurement waves
//! - [`host`]: the coordinator event loop
//! - [`worker`]: the worker side of a session

pub mod codec;
pub mod host;
pub mod protocol;
pub mod schedule;
pub mod session;
pub mod worker;

pub use host::{Coordinator, SessionReport};
pub use protocol::{Assignment, Message, WorkerCapabilities};
pub use schedule::{schedule_waves, ScheduledPair};
pub use session::{ClusterSession, NodeInfo, NodeRole, NodeStatus, RegistrationError, SessionState};
pub use worker::{WorkerClient, WorkerOutcome, WorkerState};
