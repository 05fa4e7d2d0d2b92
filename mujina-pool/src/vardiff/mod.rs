//! Per-session difficulty control.
//!
//! The controller aims for one accepted share per target interval. It keeps
//! an exponential moving average of inter-share intervals and retargets at
//! most once per retarget interval:
//!
//! - Inside the dead-band around the target nothing changes.
//! - Outside it the correction ratio is clamped to the step limits, damped,
//!   and the result clamped to `[min, max]`. The EMA is rescaled by the
//!   applied factor so the next decision starts from the expected interval
//!   at the new difficulty.
//! - A first share arriving far sooner than the target triggers one
//!   undamped fast-ramp jump.
//! - A session that goes quiet for several target intervals is lowered.
//!
//! All methods take `now` so the loop can be driven by a paused clock in
//! tests.

mod store;

pub use store::{JsonFileStore, MemoryStore, Snapshot, SnapshotStore};

use std::time::Duration;

use tokio::time::Instant;

use crate::types::{Difficulty, ShareRate};

#[derive(Debug, Clone)]
pub struct VardiffParams {
    pub target_interval: ShareRate,
    pub min: Difficulty,
    pub max: Difficulty,
    pub start: Difficulty,
    pub retarget_interval: Duration,
    /// Fractional tolerance around the target rate
    pub dead_band: f64,
    pub max_step_up: f64,
    pub max_step_down: f64,
    /// Fraction of a correction applied per retarget
    pub dampening: f64,
    /// Weight of the newest interval in the EMA
    pub ema_alpha: f64,
    pub fast_ramp_threshold: f64,
    pub fast_ramp_cap: f64,
    /// How long a difficulty must hold before it is worth persisting
    pub min_stable: Duration,
    pub idle_intervals: u32,
    pub snapshot_ttl: Duration,
}

impl Default for VardiffParams {
    fn default() -> Self {
        Self {
            target_interval: ShareRate::default(),
            min: Difficulty::from(1),
            max: Difficulty::from(1u64 << 50),
            start: Difficulty::from(1),
            retarget_interval: Duration::from_secs(30),
            dead_band: 0.2,
            max_step_up: 2.0,
            max_step_down: 0.5,
            dampening: 0.5,
            ema_alpha: 0.3,
            fast_ramp_threshold: 4.0,
            fast_ramp_cap: 64.0,
            min_stable: Duration::from_secs(300),
            idle_intervals: 6,
            snapshot_ttl: Duration::from_secs(86400),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    /// No share yet
    Initializing,
    /// Converging after the first share, a ramp, or a manual change
    Ramping,
    /// Inside the dead-band
    Stable,
    /// Last retarget moved the difficulty
    Adjusting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ChangeReason {
    FastRamp,
    EmaAdjust,
    ReconnectRestore,
    Manual,
}

impl ChangeReason {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DifficultyChange {
    pub old: Difficulty,
    pub new: Difficulty,
    pub reason: ChangeReason,
}

#[derive(Debug)]
pub struct VardiffController {
    params: VardiffParams,
    difficulty: Difficulty,
    phase: Phase,
    /// Smoothed inter-share interval, seconds
    ema: Option<f64>,
    /// When the current difficulty took effect
    since: Instant,
    last_share: Option<Instant>,
    last_retarget: Instant,
    stable_count: u32,
    stable_since: Option<Instant>,
    last_stable: Option<Difficulty>,
}

impl VardiffController {
    pub fn new(params: VardiffParams, now: Instant) -> Self {
        let difficulty = params.start.clamp(params.min, params.max);
        Self {
            params,
            difficulty,
            phase: Phase::Initializing,
            ema: None,
            since: now,
            last_share: None,
            last_retarget: now,
            stable_count: 0,
            stable_since: None,
            last_stable: None,
        }
    }

    pub fn difficulty(&self) -> Difficulty {
        self.difficulty
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Consecutive retarget checks that landed inside the dead-band.
    pub fn stable_count(&self) -> u32 {
        self.stable_count
    }

    fn target_secs(&self) -> f64 {
        self.params.target_interval.as_interval().as_secs_f64()
    }

    fn apply(&mut self, new: Difficulty, reason: ChangeReason, now: Instant) -> Option<DifficultyChange> {
        let new = new.clamp(self.params.min, self.params.max);
        let old = self.difficulty;
        if new == old {
            return None;
        }
        self.leave_stable(now);
        self.difficulty = new;
        self.since = now;
        self.last_retarget = now;
        Some(DifficultyChange { old, new, reason })
    }

    fn leave_stable(&mut self, now: Instant) {
        if self.phase == Phase::Stable && self.held_long_enough(now) {
            self.last_stable = Some(self.difficulty);
        }
        self.stable_count = 0;
        self.stable_since = None;
    }

    fn held_long_enough(&self, now: Instant) -> bool {
        self.stable_since
            .is_some_and(|since| now.saturating_duration_since(since) >= self.params.min_stable)
    }

    /// Seed the difficulty from a persisted snapshot.
    pub fn restore(&mut self, difficulty: Difficulty, now: Instant) -> Option<DifficultyChange> {
        let change = self.apply(difficulty, ChangeReason::ReconnectRestore, now);
        self.phase = Phase::Ramping;
        change
    }

    /// The miner asked for a difficulty (`mining.suggest_difficulty`).
    pub fn on_suggest(&mut self, difficulty: Difficulty, now: Instant) -> Option<DifficultyChange> {
        let change = self.apply(difficulty, ChangeReason::Manual, now)?;
        self.ema = None;
        self.phase = Phase::Ramping;
        Some(change)
    }

    /// Update on an accepted share.
    pub fn on_share_accepted(&mut self, now: Instant) -> Option<DifficultyChange> {
        let Some(last_share) = self.last_share.replace(now) else {
            return self.first_share(now);
        };

        let interval = now.saturating_duration_since(last_share).as_secs_f64();
        let alpha = self.params.ema_alpha;
        let ema = match self.ema {
            Some(ema) => alpha * interval + (1.0 - alpha) * ema,
            None => interval,
        };
        self.ema = Some(ema);

        if now.saturating_duration_since(self.last_retarget) < self.params.retarget_interval {
            return None;
        }
        self.retarget(ema, now)
    }

    fn first_share(&mut self, now: Instant) -> Option<DifficultyChange> {
        let elapsed = now.saturating_duration_since(self.since).as_secs_f64();
        let target = self.target_secs();
        let initializing = self.phase == Phase::Initializing;
        self.phase = Phase::Ramping;

        if initializing && elapsed * self.params.fast_ramp_threshold < target {
            let factor = if elapsed > 0.0 {
                (target / elapsed).min(self.params.fast_ramp_cap)
            } else {
                self.params.fast_ramp_cap
            };
            self.ema = None;
            return self.apply(self.difficulty.scale(factor), ChangeReason::FastRamp, now);
        }
        self.ema = Some(elapsed);
        None
    }

    fn retarget(&mut self, ema: f64, now: Instant) -> Option<DifficultyChange> {
        let ratio = self.params.target_interval.speedup(Duration::from_secs_f64(ema));
        if (ratio - 1.0).abs() <= self.params.dead_band {
            self.last_retarget = now;
            self.stable_count += 1;
            if self.phase != Phase::Stable {
                self.phase = Phase::Stable;
                self.stable_since = Some(now);
            }
            return None;
        }

        let step = ratio.clamp(self.params.max_step_down, self.params.max_step_up);
        let factor = 1.0 + (step - 1.0) * self.params.dampening;
        let old = self.difficulty;
        let change = self.apply(old.scale(factor), ChangeReason::EmaAdjust, now);
        self.last_retarget = now;
        if let Some(change) = &change {
            self.ema = Some(ema * change.new.as_f64() / old.as_f64());
            self.phase = Phase::Adjusting;
        }
        change
    }

    /// Periodic check; lowers difficulty after a long silence.
    pub fn on_idle(&mut self, now: Instant) -> Option<DifficultyChange> {
        let quiet_since = self.last_share.unwrap_or(self.since).max(self.since);
        let silence = now.saturating_duration_since(quiet_since);
        let limit = self.params.target_interval.as_interval() * self.params.idle_intervals;
        if silence < limit
            || now.saturating_duration_since(self.last_retarget) < self.params.retarget_interval
        {
            return None;
        }

        let ratio = self.params.target_interval.speedup(silence);
        let step = ratio.clamp(self.params.max_step_down, 1.0);
        let factor = 1.0 + (step - 1.0) * self.params.dampening;
        let old = self.difficulty;
        let change = self.apply(old.scale(factor), ChangeReason::EmaAdjust, now);
        self.last_retarget = now;
        if let Some(change) = &change {
            self.ema = Some(silence.as_secs_f64() * change.new.as_f64() / old.as_f64());
            self.phase = Phase::Adjusting;
        }
        change
    }

    /// Difficulty worth persisting when the session ends.
    pub fn finish(&self, now: Instant) -> Option<Difficulty> {
        if self.phase == Phase::Stable && self.held_long_enough(now) {
            Some(self.difficulty)
        } else {
            self.last_stable
        }
    }
}
