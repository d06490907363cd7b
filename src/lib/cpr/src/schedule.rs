use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CprError;

/// Position of the outer solver in its time loop, as reported by the
/// caller's recorder: outer report step, ministep within the step, and
/// nonlinear subiteration within the ministep. All 1-based.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ProgressRecorder {
    pub step: usize,
    pub ministep: usize,
    pub subiteration: usize,
}

impl ProgressRecorder {
    pub fn new(step: usize, ministep: usize, subiteration: usize) -> Self {
        ProgressRecorder {
            step,
            ministep,
            subiteration,
        }
    }
}

/// Granularity at which a refresh may trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateInterval {
    /// Only on the very first call.
    Once,
    /// Every nonlinear subiteration.
    Iteration,
    /// First subiteration of every ministep.
    Ministep,
    /// First subiteration of every outer step.
    Step,
}

impl FromStr for UpdateInterval {
    type Err = CprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "once" => Ok(UpdateInterval::Once),
            "iteration" => Ok(UpdateInterval::Iteration),
            "ministep" => Ok(UpdateInterval::Ministep),
            "step" => Ok(UpdateInterval::Step),
            other => Err(CprError::BadScheduleConfig {
                reason: format!("unknown update interval '{other}'"),
            }),
        }
    }
}

/// When to refresh a subcomponent: an interval picks the counter, the
/// frequency thins it out.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct UpdateSchedule {
    pub interval: UpdateInterval,
    pub frequency: usize,
}

impl UpdateSchedule {
    pub fn new(interval: UpdateInterval, frequency: usize) -> Self {
        UpdateSchedule { interval, frequency }
    }

    /// Whether a refresh of this kind is due. The first call on an empty
    /// preconditioner always refreshes, whatever the schedule says.
    ///
    /// Counters are 1-based, so `n % frequency == 1` fires on the first
    /// of every `frequency` consecutive counter values.
    pub fn should_update(&self, recorder: &ProgressRecorder, first_call: bool) -> bool {
        if first_call {
            return true;
        }
        let (criterion, counter) = match self.interval {
            UpdateInterval::Once => return false,
            UpdateInterval::Iteration => (true, recorder.subiteration),
            UpdateInterval::Ministep => (recorder.subiteration == 1, recorder.ministep),
            UpdateInterval::Step => (recorder.subiteration == 1, recorder.step),
        };
        criterion && (self.frequency == 1 || counter % self.frequency == 1)
    }
}
