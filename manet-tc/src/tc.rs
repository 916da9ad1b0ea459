//! [`SchedulerBackend`] driving the Linux `tc` utility.

use std::{fmt, net::Ipv4Addr, path::PathBuf, time::Duration};

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::{
    backend::{BackendError, SchedulerBackend},
    class::{self, DEFAULT_CLASS, ROOT_CLASS, ROOT_MAJOR},
    command::{self, Runner},
    stats::{self, Counters},
    ShapingClass,
};

const TC: &str = "tc";

/// Default location of the interface counter table.
pub const PROC_NET_DEV: &str = "/proc/net/dev";

/// Messages `tc` prints when asked to delete a root qdisc that is not there.
const NOTHING_TO_DELETE: &[&str] = &[
    "No such file or directory",
    "Cannot delete qdisc with handle of zero",
    "Cannot find specified qdisc",
];

/// A single `tc` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcCommand {
    args: Vec<String>,
}

impl fmt::Display for TcCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(TC)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

impl TcCommand {
    fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { args: args.into_iter().map(Into::into).collect() }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// `qdisc del dev <dev> root`
    pub fn delete_root(dev: &str) -> Self {
        Self::new(["qdisc", "del", "dev", dev, "root"])
    }

    /// The HTB root qdisc, sending unclassified traffic to the default class.
    pub fn root_qdisc(dev: &str) -> Self {
        let handle = class::fmt_qdisc(ROOT_MAJOR);
        let default = format!("{DEFAULT_CLASS:x}");
        Self::new([
            "qdisc",
            "add",
            "dev",
            dev,
            "root",
            handle.as_str(),
            "htb",
            "default",
            default.as_str(),
        ])
    }

    /// An HTB class below `parent`.
    pub fn htb_class(dev: &str, parent: &str, class_id: u32, rate_kbps: u64, ceil_kbps: u64) -> Self {
        let classid = class::fmt_class(class_id);
        let rate = format!("{rate_kbps}kbit");
        let ceil = format!("{ceil_kbps}kbit");
        Self::new([
            "class",
            "add",
            "dev",
            dev,
            "parent",
            parent,
            "classid",
            classid.as_str(),
            "htb",
            "rate",
            rate.as_str(),
            "ceil",
            ceil.as_str(),
        ])
    }

    /// A u32 filter matching the destination host.
    pub fn dst_filter(dev: &str, class_id: u32, destination: Ipv4Addr) -> Self {
        let parent = class::fmt_qdisc(ROOT_MAJOR);
        let prio = class::filter_prio(class_id).to_string();
        let dst = format!("{destination}/32");
        let flowid = class::fmt_class(class_id);
        Self::new([
            "filter",
            "add",
            "dev",
            dev,
            "protocol",
            "ip",
            "parent",
            parent.as_str(),
            "prio",
            prio.as_str(),
            "u32",
            "match",
            "ip",
            "dst",
            dst.as_str(),
            "flowid",
            flowid.as_str(),
        ])
    }

    /// `-s -j class show dev <dev>`
    pub fn class_stats(dev: &str) -> Self {
        Self::new(["-s", "-j", "class", "show", "dev", dev])
    }
}

/// Netem emulation stage attached below a peer class.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Netem {
    /// Delay and jitter in microseconds.
    pub delay: Option<(u64, u64)>,
    /// Packet loss in percent.
    pub loss: Option<f64>,
}

impl Netem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delay and its variation, in microseconds.
    pub fn delay(mut self, delay_us: u64, jitter_us: u64) -> Self {
        self.delay = Some((delay_us, jitter_us));
        self
    }

    /// Set the packet loss rate in percent.
    pub fn loss(mut self, loss_percent: f64) -> Self {
        self.loss = Some(loss_percent);
        self
    }

    /// The stage for `class`, without zero-valued parameters.
    pub fn for_class(class: &ShapingClass) -> Self {
        let mut netem = Self::new();
        if class.delay_us > 0 {
            netem = netem.delay(class.delay_us, class.jitter_us);
        }
        if class.loss_percent > 0.0 {
            netem = netem.loss(class.loss_percent);
        }
        netem
    }

    /// Builds the command attaching the stage below `class_id`, with handle `<class_id>:`.
    pub fn build(&self, dev: &str, class_id: u32) -> TcCommand {
        let parent = class::fmt_class(class_id);
        let handle = class::fmt_qdisc(class_id);
        let mut args: Vec<String> =
            ["qdisc", "add", "dev", dev, "parent", parent.as_str(), "handle", handle.as_str(), "netem"]
                .into_iter()
                .map(String::from)
                .collect();

        if let Some((delay, jitter)) = self.delay {
            args.extend(["delay".to_string(), format!("{delay}us"), format!("{jitter}us")]);
        }

        if let Some(loss) = self.loss {
            args.extend(["loss".to_string(), format!("{loss}%")]);
        }

        TcCommand { args }
    }
}

/// Shapes egress traffic of a single interface through `tc`.
#[derive(Debug, Clone)]
pub struct TcBackend {
    interface: String,
    runner: Runner,
    net_dev: PathBuf,
}

impl TcBackend {
    pub fn new(interface: impl Into<String>) -> Self {
        Self { interface: interface.into(), runner: Runner::default(), net_dev: PROC_NET_DEV.into() }
    }

    /// Bound every `tc` invocation by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.runner = Runner::new(timeout);
        self
    }

    /// Read interface counters from `path` instead of [`PROC_NET_DEV`].
    pub fn with_net_dev(mut self, path: impl Into<PathBuf>) -> Self {
        self.net_dev = path.into();
        self
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    async fn exec(&self, cmd: TcCommand) -> Result<command::Output, BackendError> {
        trace!(%cmd, "tc");
        self.runner
            .run(TC, cmd.args())
            .await
            .map_err(|source| BackendError::Command { command: cmd.to_string(), source })
    }
}

#[async_trait]
impl SchedulerBackend for TcBackend {
    async fn reset_interface(&self) -> Result<(), BackendError> {
        match self.exec(TcCommand::delete_root(&self.interface)).await {
            Err(BackendError::Command { source, .. })
                if source.stderr().is_some_and(|stderr| {
                    NOTHING_TO_DELETE.iter().any(|msg| stderr.contains(msg))
                }) =>
            {
                debug!(interface = %self.interface, "no root qdisc to delete");
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    async fn set_root_cap(&self, bandwidth_kbps: u64) -> Result<(), BackendError> {
        let dev = &self.interface;
        let root = class::fmt_qdisc(ROOT_MAJOR);
        let parent = class::fmt_class(ROOT_CLASS);

        self.exec(TcCommand::root_qdisc(dev)).await?;
        self.exec(TcCommand::htb_class(dev, &root, ROOT_CLASS, bandwidth_kbps, bandwidth_kbps)).await?;
        self.exec(TcCommand::htb_class(dev, &parent, DEFAULT_CLASS, bandwidth_kbps, bandwidth_kbps))
            .await?;

        Ok(())
    }

    async fn add_class(&self, class: &ShapingClass) -> Result<(), BackendError> {
        let parent = class::fmt_class(ROOT_CLASS);
        let cmd =
            TcCommand::htb_class(&self.interface, &parent, class.class_id, class.rate_kbps, class.ceil_kbps);
        self.exec(cmd).await.map(|_| ())
    }

    async fn add_emulation_stage(&self, class: &ShapingClass) -> Result<(), BackendError> {
        let cmd = Netem::for_class(class).build(&self.interface, class.class_id);
        self.exec(cmd).await.map(|_| ())
    }

    async fn add_steering_rule(
        &self,
        class: &ShapingClass,
        destination: Ipv4Addr,
    ) -> Result<(), BackendError> {
        let cmd = TcCommand::dst_filter(&self.interface, class.class_id, destination);
        self.exec(cmd).await.map(|_| ())
    }

    async fn read_counters(&self) -> Result<Counters, BackendError> {
        let output = self.exec(TcCommand::class_stats(&self.interface)).await?;
        let classes = stats::parse_class_stats(&output.stdout)?;

        let net_dev = tokio::fs::read_to_string(&self.net_dev)
            .await
            .map_err(|source| BackendError::Io { path: self.net_dev.clone(), source })?;
        let interface = stats::parse_net_dev(&net_dev, &self.interface)?;

        Ok(Counters { interface, classes })
    }
}
