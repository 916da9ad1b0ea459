#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! # Traffic shaping for simulated radio links
//!
//! Turns per-peer [`LinkQuality`](manet_model::LinkQuality) into a packet scheduler
//! configuration on the egress interface, and reads back what actually went through it.
//!
//! - [`RuleCompiler`] rebuilds the whole class hierarchy from a list of [`LinkPlan`]s.
//! - [`SchedulerBackend`] is the seam to the host: [`TcBackend`] drives `tc`,
//!   [`RecordingBackend`] only records (dry runs and tests).
//! - [`TrafficTracker`] samples the counters of the installed classes and derives rates.

pub mod backend;
pub mod class;
pub mod command;
pub mod compiler;
pub mod rate;
pub mod recording;
pub mod stats;
pub mod tc;

pub use backend::{BackendError, SchedulerBackend};
pub use class::ShapingClass;
pub use compiler::{ClassMap, CompileReport, LinkPlan, RuleCompiler, ShapingError};
pub use rate::{InterfaceTraffic, LinkTraffic, RateTracker, TrafficSnapshot, TrafficTracker};
pub use recording::RecordingBackend;
pub use stats::{ClassCounters, Counters, InterfaceCounters};
pub use tc::TcBackend;
