//! Decides when a lazily loaded list has stopped growing.
//!
//! No single signal is reliable on this site, so the detector combines
//! them: a visible "load more" control or spinner always means continue;
//! otherwise convergence needs `required_signals` of the weak signals
//! (height unchanged, scrolled to bottom, repeated tail) at once, or
//! `max_idle_attempts` consecutive attempts without new items. The attempt
//! cap is enforced by the scroll driver, not here.

use crate::page::ScrollMetrics;
use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Tunable thresholds. The defaults were tuned against one snapshot of the
/// site and should be revalidated when it changes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceSettings {
    /// How many trailing items are inspected for repeats.
    #[serde(default = "default_repeat_window")]
    pub repeat_window: usize,

    /// Repeats within the window that count as a signal.
    #[serde(default = "default_repeat_threshold")]
    pub repeat_threshold: usize,

    /// Scrolled ratio at which the page counts as "at the bottom".
    #[serde(default = "default_bottom_ratio")]
    pub bottom_ratio: f64,

    /// Weak signals that must agree.
    #[serde(default = "default_required_signals")]
    pub required_signals: usize,

    /// Consecutive attempts without new items before giving up.
    #[serde(default = "default_max_idle_attempts")]
    pub max_idle_attempts: u32,
}

fn default_repeat_window() -> usize {
    10
}

fn default_repeat_threshold() -> usize {
    3
}

fn default_bottom_ratio() -> f64 {
    0.95
}

fn default_required_signals() -> usize {
    2
}

fn default_max_idle_attempts() -> u32 {
    3
}

impl Default for ConvergenceSettings {
    fn default() -> Self {
        Self {
            repeat_window: default_repeat_window(),
            repeat_threshold: default_repeat_threshold(),
            bottom_ratio: default_bottom_ratio(),
            required_signals: default_required_signals(),
            max_idle_attempts: default_max_idle_attempts(),
        }
    }
}

impl ConvergenceSettings {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.bottom_ratio > 0.0 && self.bottom_ratio <= 1.0,
            "convergence.bottom_ratio must be in (0, 1], got {}",
            self.bottom_ratio
        );
        ensure!(self.repeat_threshold > 0, "convergence.repeat_threshold must be at least 1");
        ensure!(
            self.repeat_window >= self.repeat_threshold,
            "convergence.repeat_window ({}) is smaller than repeat_threshold ({})",
            self.repeat_window,
            self.repeat_threshold
        );
        ensure!(
            (1..=3).contains(&self.required_signals),
            "convergence.required_signals must be between 1 and 3"
        );
        ensure!(self.max_idle_attempts > 0, "convergence.max_idle_attempts must be at least 1");
        Ok(())
    }
}

/// What the scroll driver saw after one load attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Observation {
    pub load_more_visible: bool,
    pub loading_visible: bool,
    /// `None` when the measurement itself failed.
    pub metrics: Option<ScrollMetrics>,
    pub new_items: usize,
    pub tail_repeats: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceReason {
    /// The page fit in the viewport with nothing to load.
    ShortPage,
    /// Enough weak signals agreed.
    Signals,
    /// The driver ran out of attempts before the detector converged.
    AttemptCap,
    Idle,
}

impl fmt::Display for ConvergenceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvergenceReason::ShortPage => write!(f, "page fits the viewport"),
            ConvergenceReason::Signals => write!(f, "signals agree"),
            ConvergenceReason::AttemptCap => write!(f, "attempt cap reached"),
            ConvergenceReason::Idle => write!(f, "no new items"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    /// A loading indicator is up; give it time before the next attempt.
    Wait,
    Converged(ConvergenceReason),
}

/// Per-run convergence state. One instance per scroll run.
#[derive(Debug)]
pub struct ConvergenceDetector {
    settings: ConvergenceSettings,
    attempts: u32,
    idle_streak: u32,
    last_height: Option<f64>,
}

impl ConvergenceDetector {
    pub fn new(settings: ConvergenceSettings) -> Self {
        Self { settings, attempts: 0, idle_streak: 0, last_height: None }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Seeds the height baseline (e.g. from the initial inspection).
    pub fn baseline(&mut self, metrics: ScrollMetrics) {
        self.last_height = Some(metrics.scroll_height);
    }

    /// Number of weak signals present in `obs`.
    fn weak_signals(&self, obs: &Observation, height_stalled: bool) -> usize {
        let at_bottom =
            obs.metrics.is_some_and(|m| m.scrolled_ratio() >= self.settings.bottom_ratio);
        let repeating = obs.tail_repeats >= self.settings.repeat_threshold;
        [height_stalled, at_bottom, repeating].iter().filter(|s| **s).count()
    }

    /// Records one attempt and decides whether to keep loading.
    pub fn observe(&mut self, obs: &Observation) -> Verdict {
        self.attempts += 1;

        if obs.new_items == 0 {
            self.idle_streak += 1;
        } else {
            self.idle_streak = 0;
        }

        let height = obs.metrics.map(|m| m.scroll_height);
        let height_stalled = self.attempts > 1
            && matches!((height, self.last_height), (Some(now), Some(before)) if now <= before);
        if height.is_some() {
            self.last_height = height;
        }

        if obs.load_more_visible {
            return Verdict::Continue;
        }
        if obs.loading_visible {
            return Verdict::Wait;
        }
        if self.weak_signals(obs, height_stalled) >= self.settings.required_signals {
            return Verdict::Converged(ConvergenceReason::Signals);
        }
        if self.idle_streak >= self.settings.max_idle_attempts {
            return Verdict::Converged(ConvergenceReason::Idle);
        }
        Verdict::Continue
    }
}

/// Counts repeats among the last `window` items of a pass: keys seen in an
/// earlier pass, or listed more than once within the window.
///
/// A list that only re-renders scores high even when one new item trails
/// it; a list that grew past the window scores low.
pub fn trailing_repeats(
    pass_keys: &[String],
    seen_before: &HashSet<String>,
    window: usize,
) -> usize {
    let tail = &pass_keys[pass_keys.len().saturating_sub(window)..];
    let mut in_window: HashSet<&str> = HashSet::with_capacity(tail.len());
    tail.iter()
        .filter(|key| {
            let first_in_window = in_window.insert(key.as_str());
            seen_before.contains(*key) || !first_in_window
        })
        .count()
}
