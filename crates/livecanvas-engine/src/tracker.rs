use livecanvas_contracts::{GenerationRequest, ParameterUpdate};

/// Current and last-triggered parameter snapshots. Owned by the control loop
/// alone, so no locking.
#[derive(Debug, Clone, Default)]
pub struct TriggerState {
    current: GenerationRequest,
    last_triggered: GenerationRequest,
}

impl TriggerState {
    /// Both snapshots start at `initial`, so nothing is dirty until an update
    /// changes a field.
    pub fn new(initial: GenerationRequest) -> Self {
        Self {
            current: initial.clone(),
            last_triggered: initial,
        }
    }

    pub fn apply(&mut self, update: &ParameterUpdate) {
        update.apply_to(&mut self.current);
    }

    pub fn is_dirty(&self) -> bool {
        self.current.differs_from(&self.last_triggered)
    }

    /// Advances `last_triggered` to `current` and returns the snapshot to render.
    pub fn mark_triggered(&mut self) -> GenerationRequest {
        self.last_triggered.clone_from(&self.current);
        self.current.clone()
    }

    pub fn current(&self) -> &GenerationRequest {
        &self.current
    }

    pub fn last_triggered(&self) -> &GenerationRequest {
        &self.last_triggered
    }
}
