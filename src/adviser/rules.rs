use super::Adviser;
use cadence_common::{Advise, AdviserObtainment, ExhaustedAction, NodeExecution, Status};

/// Adviser backed by one declared rule.
pub struct RuleAdviser {
    rule: AdviserObtainment,
}

impl RuleAdviser {
    pub fn new(rule: AdviserObtainment) -> Self {
        Self { rule }
    }

    pub fn rule(&self) -> &AdviserObtainment {
        &self.rule
    }
}

impl Adviser for RuleAdviser {
    fn can_advise(&self, node_execution: &NodeExecution, status: Status) -> bool {
        if !self.rule.applies_to(status) {
            return false;
        }
        match &self.rule {
            // An exhausted retry rule that would only propagate steps aside so
            // later rules get a say.
            AdviserObtainment::Retry {
                max_attempts,
                on_exhausted,
                ..
            } => node_execution.attempt() < *max_attempts || *on_exhausted != ExhaustedAction::Propagate,
            _ => true,
        }
    }

    fn advise(&self, node_execution: &NodeExecution, _status: Status) -> Advise {
        match &self.rule {
            AdviserObtainment::NextStep { next_node_id, .. } => Advise::NextStep {
                node_id: next_node_id.clone(),
            },
            AdviserObtainment::Retry {
                max_attempts,
                wait_ms,
                parameters,
                on_exhausted,
                ..
            } => {
                if node_execution.attempt() < *max_attempts {
                    Advise::Retry {
                        parameters: parameters.clone(),
                        wait_ms: *wait_ms,
                    }
                } else {
                    tracing::debug!(
                        node_execution = %node_execution.uuid,
                        attempts = node_execution.attempt(),
                        "retry rule exhausted"
                    );
                    on_exhausted.to_advise()
                }
            }
            AdviserObtainment::Rollback {
                strategy_node_id, ..
            } => Advise::Rollback {
                strategy_node_id: strategy_node_id.clone(),
            },
            AdviserObtainment::MarkSuccess { .. } => Advise::MarkSuccess,
            AdviserObtainment::EndPlan { final_status, .. } => Advise::EndPlan {
                final_status: *final_status,
            },
        }
    }
}
