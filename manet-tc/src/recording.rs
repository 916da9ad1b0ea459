//! In-memory [`SchedulerBackend`] used for dry runs and tests.

use std::{collections::VecDeque, fmt, net::Ipv4Addr};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, trace};

use crate::{
    backend::{BackendError, SchedulerBackend},
    stats::Counters,
    ShapingClass,
};

/// A single backend call, as seen by the [`RecordingBackend`].
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    ResetInterface,
    SetRootCap { bandwidth_kbps: u64 },
    AddClass(ShapingClass),
    AddEmulationStage(ShapingClass),
    AddSteeringRule { class_id: u32, destination: Ipv4Addr },
    ReadCounters,
}

/// What would currently be installed on the interface.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Installed {
    pub bandwidth_kbps: Option<u64>,
    pub classes: Vec<ShapingClass>,
    pub stages: Vec<ShapingClass>,
    pub rules: Vec<(u32, Ipv4Addr)>,
}

type Predicate = Box<dyn Fn(&Operation) -> bool + Send + Sync>;

struct Failure {
    predicate: Predicate,
    remaining: Option<usize>,
}

#[derive(Default)]
struct Inner {
    operations: Vec<Operation>,
    counter_reads: u64,
    installed: Installed,
    failures: Vec<Failure>,
    counters: VecDeque<Counters>,
    last_counters: Counters,
}

/// Records every configuration call and keeps a model of the installed configuration, without
/// touching the host. Failures can be injected per operation.
///
/// Counter reads happen on a fixed cadence for the whole life of a node, so they are only
/// counted, not kept in the operation log.
#[derive(Default)]
pub struct RecordingBackend {
    inner: Mutex<Inner>,
}

impl fmt::Debug for RecordingBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("RecordingBackend")
            .field("operations", &inner.operations.len())
            .field("counter_reads", &inner.counter_reads)
            .field("installed", &inner.installed)
            .field("failures", &inner.failures.len())
            .finish()
    }
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every operation matching `predicate`.
    pub fn fail_on(&self, predicate: impl Fn(&Operation) -> bool + Send + Sync + 'static) {
        self.inner.lock().failures.push(Failure { predicate: Box::new(predicate), remaining: None });
    }

    /// Fail the next `times` operations matching `predicate`.
    pub fn fail_times(
        &self,
        times: usize,
        predicate: impl Fn(&Operation) -> bool + Send + Sync + 'static,
    ) {
        self.inner.lock().failures.push(Failure { predicate: Box::new(predicate), remaining: Some(times) });
    }

    /// Removes every injected failure.
    pub fn clear_failures(&self) {
        self.inner.lock().failures.clear();
    }

    /// Queue a counter reading. Once the queue is drained, the last reading is repeated.
    pub fn push_counters(&self, counters: Counters) {
        self.inner.lock().counters.push_back(counters);
    }

    /// Every operation recorded so far.
    pub fn operations(&self) -> Vec<Operation> {
        self.inner.lock().operations.clone()
    }

    /// Number of counter reads served so far.
    pub fn counter_reads(&self) -> u64 {
        self.inner.lock().counter_reads
    }

    /// Drains the recorded operations.
    pub fn take_operations(&self) -> Vec<Operation> {
        std::mem::take(&mut self.inner.lock().operations)
    }

    /// The configuration that would be installed after the recorded operations.
    pub fn installed(&self) -> Installed {
        self.inner.lock().installed.clone()
    }

    fn record(&self, op: Operation) -> Result<(), BackendError> {
        let mut inner = self.inner.lock();
        if op == Operation::ReadCounters {
            inner.counter_reads += 1;
        } else {
            inner.operations.push(op.clone());
        }

        let failed = inner.failures.iter_mut().any(|failure| {
            if failure.remaining == Some(0) || !(failure.predicate)(&op) {
                return false;
            }
            if let Some(remaining) = failure.remaining.as_mut() {
                *remaining -= 1;
            }
            true
        });

        if failed {
            return Err(BackendError::Injected(format!("{op:?}")));
        }

        if op == Operation::ReadCounters {
            trace!("dry run counter read");
        } else {
            info!(?op, "dry run");
        }

        let installed = &mut inner.installed;
        match op {
            Operation::ResetInterface => *installed = Installed::default(),
            Operation::SetRootCap { bandwidth_kbps } => installed.bandwidth_kbps = Some(bandwidth_kbps),
            Operation::AddClass(class) => installed.classes.push(class),
            Operation::AddEmulationStage(class) => installed.stages.push(class),
            Operation::AddSteeringRule { class_id, destination } => {
                installed.rules.push((class_id, destination))
            }
            Operation::ReadCounters => {}
        }

        Ok(())
    }
}

#[async_trait]
impl SchedulerBackend for RecordingBackend {
    async fn reset_interface(&self) -> Result<(), BackendError> {
        self.record(Operation::ResetInterface)
    }

    async fn set_root_cap(&self, bandwidth_kbps: u64) -> Result<(), BackendError> {
        self.record(Operation::SetRootCap { bandwidth_kbps })
    }

    async fn add_class(&self, class: &ShapingClass) -> Result<(), BackendError> {
        self.record(Operation::AddClass(*class))
    }

    async fn add_emulation_stage(&self, class: &ShapingClass) -> Result<(), BackendError> {
        self.record(Operation::AddEmulationStage(*class))
    }

    async fn add_steering_rule(
        &self,
        class: &ShapingClass,
        destination: Ipv4Addr,
    ) -> Result<(), BackendError> {
        self.record(Operation::AddSteeringRule { class_id: class.class_id, destination })
    }

    async fn read_counters(&self) -> Result<Counters, BackendError> {
        self.record(Operation::ReadCounters)?;

        let mut inner = self.inner.lock();
        if let Some(next) = inner.counters.pop_front() {
            inner.last_counters = next;
        }
        Ok(inner.last_counters.clone())
    }
}
