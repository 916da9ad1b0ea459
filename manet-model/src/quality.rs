//! Synthetic link quality.
//!
//! A [`LinkQuality`] is computed in three stages, always in this order:
//!
//! 1. The [`DistanceCurve`] maps the distance between two nodes to a base [`Degradation`] by
//!    linear interpolation between configured breakpoints. Beyond `max_range_m` the link is
//!    unreachable and the remaining stages are skipped.
//! 2. The active [`EnvironmentProfile`] scales latency and loss.
//! 3. An optional [`LinkOverride`] either partitions the link or adds extra latency and loss.
//!
//! Everything here is a pure function of its inputs.

use serde::{Deserialize, Serialize};

use crate::geometry::Position;

/// Loss can never exceed 100%.
const MAX_LOSS_PERCENT: f64 = 100.0;

/// One breakpoint of the distance degradation curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistanceThreshold {
    /// Distance at which this breakpoint applies, in meters.
    pub range_m: f64,
    /// One-way latency at this distance, in milliseconds.
    pub latency_ms: f64,
    /// Packet loss at this distance, in percent.
    pub loss_percent: f64,
}

impl DistanceThreshold {
    /// Create a new breakpoint.
    pub const fn new(range_m: f64, latency_ms: f64, loss_percent: f64) -> Self {
        Self { range_m, latency_ms, loss_percent }
    }
}

/// Errors raised when building a [`DistanceCurve`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CurveError {
    #[error("at least one distance threshold is required")]
    Empty,
    #[error("max_range_m must be a positive number, got {0}")]
    InvalidMaxRange(f64),
    #[error("threshold {index} is not finite or has negative latency/loss")]
    InvalidThreshold { index: usize },
    #[error("threshold {index} has range {range_m}m, lower than the previous threshold")]
    Decreasing { index: usize, range_m: f64 },
    #[error("threshold {index} has loss {loss_percent}%, outside 0..=100")]
    LossOutOfBounds { index: usize, loss_percent: f64 },
}

/// Latency and loss of a link before reachability is decided.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Degradation {
    /// Latency in milliseconds.
    pub latency_ms: f64,
    /// Packet loss in percent.
    pub loss_percent: f64,
}

/// The piecewise-linear degradation curve: an ordered threshold table bounded by
/// `max_range_m`.
///
/// The table is validated on construction: it is never empty and its `range_m` values never
/// decrease.
#[derive(Debug, Clone, PartialEq)]
pub struct DistanceCurve {
    thresholds: Vec<DistanceThreshold>,
    max_range_m: f64,
}

impl DistanceCurve {
    /// Build a curve from a threshold table, validating it.
    pub fn new(thresholds: Vec<DistanceThreshold>, max_range_m: f64) -> Result<Self, CurveError> {
        if !(max_range_m.is_finite() && max_range_m > 0.0) {
            return Err(CurveError::InvalidMaxRange(max_range_m));
        }
        if thresholds.is_empty() {
            return Err(CurveError::Empty);
        }

        let mut previous = f64::NEG_INFINITY;
        for (index, t) in thresholds.iter().enumerate() {
            let finite = t.range_m.is_finite() && t.latency_ms.is_finite() && t.loss_percent.is_finite();
            if !finite || t.latency_ms < 0.0 || t.loss_percent < 0.0 || t.range_m < 0.0 {
                return Err(CurveError::InvalidThreshold { index });
            }
            if t.loss_percent > MAX_LOSS_PERCENT {
                return Err(CurveError::LossOutOfBounds { index, loss_percent: t.loss_percent });
            }
            if t.range_m < previous {
                return Err(CurveError::Decreasing { index, range_m: t.range_m });
            }
            previous = t.range_m;
        }

        Ok(Self { thresholds, max_range_m })
    }

    /// The breakpoints of this curve.
    pub fn thresholds(&self) -> &[DistanceThreshold] {
        &self.thresholds
    }

    /// Distance at and beyond which links are unreachable.
    pub fn max_range_m(&self) -> f64 {
        self.max_range_m
    }

    /// Base degradation at `distance_m`, or `None` if the distance is out of range.
    ///
    /// Distances below the first breakpoint or above the last one (but still in range) are
    /// clamped to that breakpoint. A distance equal to a breakpoint returns that breakpoint
    /// exactly.
    pub fn degrade(&self, distance_m: f64) -> Option<Degradation> {
        if distance_m >= self.max_range_m {
            return None;
        }

        let mut lower = &self.thresholds[0];
        let mut upper = &self.thresholds[self.thresholds.len() - 1];
        for t in &self.thresholds {
            if t.range_m <= distance_m {
                lower = t;
            }
            if t.range_m >= distance_m {
                upper = t;
                break;
            }
        }

        if lower.range_m == upper.range_m {
            return Some(Degradation { latency_ms: lower.latency_ms, loss_percent: lower.loss_percent });
        }

        let ratio = (distance_m - lower.range_m) / (upper.range_m - lower.range_m);
        Some(Degradation {
            latency_ms: lower.latency_ms + ratio * (upper.latency_ms - lower.latency_ms),
            loss_percent: lower.loss_percent + ratio * (upper.loss_percent - lower.loss_percent),
        })
    }

    /// Compute the quality of the link from `from` to `to`.
    pub fn link_quality(
        &self,
        from: &Position,
        to: &Position,
        environment: &EnvironmentProfile,
        link_override: Option<&LinkOverride>,
    ) -> LinkQuality {
        let distance_m = from.distance_to(to);
        let Some(base) = self.degrade(distance_m) else {
            return LinkQuality::unreachable(distance_m);
        };

        let degraded = environment.apply(base);
        let quality = LinkQuality {
            latency_ms: degraded.latency_ms,
            loss_percent: degraded.loss_percent,
            reachable: true,
            distance_m,
        };

        match link_override {
            Some(o) => o.apply(quality),
            None => quality,
        }
    }
}

fn one() -> f64 {
    1.0
}

/// A named set of multipliers describing the weather or terrain around a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentProfile {
    /// Factor applied to latency.
    #[serde(default = "one")]
    pub latency_multiplier: f64,
    /// Factor applied to loss (the result is capped at 100%).
    #[serde(default = "one")]
    pub loss_multiplier: f64,
    /// Factor applied to the node's total radio bandwidth.
    #[serde(default = "one")]
    pub bandwidth_multiplier: f64,
}

impl Default for EnvironmentProfile {
    fn default() -> Self {
        Self::CLEAR
    }
}

impl EnvironmentProfile {
    /// The neutral profile: every multiplier is `1.0`.
    pub const CLEAR: Self =
        Self { latency_multiplier: 1.0, loss_multiplier: 1.0, bandwidth_multiplier: 1.0 };

    /// Scale a base degradation by this profile.
    pub fn apply(&self, base: Degradation) -> Degradation {
        Degradation {
            latency_ms: base.latency_ms * self.latency_multiplier,
            loss_percent: (base.loss_percent * self.loss_multiplier).min(MAX_LOSS_PERCENT),
        }
    }

    /// Total radio bandwidth under this profile, in kbit/s (truncated).
    pub fn bandwidth_kbps(&self, base_kbps: u64) -> u64 {
        (base_kbps as f64 * self.bandwidth_multiplier) as u64
    }

    /// Returns `true` if every multiplier is finite and strictly positive.
    pub fn is_valid(&self) -> bool {
        [self.latency_multiplier, self.loss_multiplier, self.bandwidth_multiplier]
            .iter()
            .all(|m| m.is_finite() && *m > 0.0)
    }
}

/// A manual adjustment on top of the computed quality of one directed link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkOverride {
    /// Latency added to the link, in milliseconds.
    pub extra_latency_ms: f64,
    /// Loss added to the link, in percent.
    pub extra_loss_percent: f64,
    /// Force the link down regardless of distance.
    pub partition: bool,
}

impl LinkOverride {
    /// A partition override.
    pub const PARTITION: Self =
        Self { extra_latency_ms: 0.0, extra_loss_percent: 0.0, partition: true };

    /// Apply this override to an already environment-adjusted quality.
    ///
    /// Out-of-range links stay untouched, partitions always yield 100% loss.
    pub fn apply(&self, quality: LinkQuality) -> LinkQuality {
        if self.partition {
            return LinkQuality::unreachable(quality.distance_m);
        }
        if !quality.reachable {
            return quality;
        }

        LinkQuality {
            latency_ms: quality.latency_ms + self.extra_latency_ms,
            loss_percent: (quality.loss_percent + self.extra_loss_percent).min(MAX_LOSS_PERCENT),
            ..quality
        }
    }

    /// Returns `true` if the values are finite and within bounds.
    pub fn is_valid(&self) -> bool {
        self.extra_latency_ms.is_finite()
            && self.extra_latency_ms >= 0.0
            && self.extra_loss_percent.is_finite()
            && (0.0..=MAX_LOSS_PERCENT).contains(&self.extra_loss_percent)
    }
}

/// Derived quality of a directed link. Never mutated in place, always recomputed wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkQuality {
    /// One-way latency in milliseconds.
    pub latency_ms: f64,
    /// Packet loss in percent.
    pub loss_percent: f64,
    /// Whether packets can get through at all.
    pub reachable: bool,
    /// Distance between the two nodes, in meters.
    pub distance_m: f64,
}

impl LinkQuality {
    /// An unreachable link at the given distance.
    pub const fn unreachable(distance_m: f64) -> Self {
        Self { latency_ms: 0.0, loss_percent: MAX_LOSS_PERCENT, reachable: false, distance_m }
    }

    /// The same link, forced down.
    pub const fn down(self) -> Self {
        Self::unreachable(self.distance_m)
    }

    /// Returns `true` if every packet on this link is dropped.
    pub fn drops_everything(&self) -> bool {
        !self.reachable || self.loss_percent >= MAX_LOSS_PERCENT
    }
}
