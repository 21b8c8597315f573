//! # vepline-engine
//!
//! The asynchronous core between a submitting client and the external
//! annotation service:
//!
//! ```text
//! submit ─▶ ModeRouter ─▶ bus lane ─▶ WorkerPool ─▶ annotated lane ─▶ ResultCorrelator ─▶ client
//!                                                                       ▲
//!                              HeartbeatScheduler ── progress frames ───┘
//! ```
//!
//! Every component is an explicit value assembled by [`Pipeline`]; there is
//! no process-global state.

pub mod bus;
pub mod correlator;
pub mod error;
pub mod format;
pub mod heartbeat;
pub mod hgvs;
pub mod pipeline;
pub mod router;
pub mod session;
pub mod worker;

pub use bus::{InMemoryBus, MessageBus};
pub use correlator::{DeliveryOutcome, ResultCorrelator};
pub use error::{BusError, SubmitError};
pub use heartbeat::{HeartbeatScheduler, TickOutcome};
pub use hgvs::NotationConverter;
pub use pipeline::{Ack, HealthReport, Pipeline};
pub use router::{ModeRouter, Routed, Submission};
pub use session::{Frame, Session, SessionHandle, SessionRegistry};
pub use worker::{AnnotationWorker, WorkerPool};
