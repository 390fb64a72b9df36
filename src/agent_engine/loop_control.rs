use crate::agent_engine::state::{EndReason, LoopConfig};

/// Step budget and consecutive-failure limit of one episode.
pub struct LoopController {
    config: LoopConfig,
    steps: u32,
    failure_count: u32,
}

impl LoopController {
    pub fn new(config: LoopConfig) -> Self {
        Self {
            config,
            steps: 0,
            failure_count: 0,
        }
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn record_step(&mut self) {
        self.steps += 1;
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
    }

    pub fn record_success(&mut self) {
        self.failure_count = 0;
    }

    pub fn should_stop(&self) -> Option<EndReason> {
        if self.config.max_consecutive_failures > 0
            && self.failure_count >= self.config.max_consecutive_failures
        {
            return Some(EndReason::FailureLimit);
        }
        if self.steps >= self.config.max_steps {
            return Some(EndReason::StepLimit);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_on_step_budget() {
        let mut ctrl = LoopController::new(LoopConfig { max_steps: 2, max_consecutive_failures: 0 });
        ctrl.record_step();
        assert_eq!(ctrl.should_stop(), None);
        ctrl.record_step();
        assert_eq!(ctrl.should_stop(), Some(EndReason::StepLimit));
    }

    #[test]
    fn success_resets_failures() {
        let mut ctrl = LoopController::new(LoopConfig { max_steps: 10, max_consecutive_failures: 2 });
        ctrl.record_failure();
        ctrl.record_success();
        ctrl.record_failure();
        assert_eq!(ctrl.should_stop(), None);
        ctrl.record_failure();
        assert_eq!(ctrl.should_stop(), Some(EndReason::FailureLimit));
    }
}
