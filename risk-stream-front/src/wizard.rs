//! Step-wizard state machine.
//!
//! Tracks the step the user is looking at and the furthest step the
//! workflow output has proven complete. The high-water mark only moves
//! forward until an explicit new run.

pub mod rules;
pub mod store;

use crate::error::Result;
use crate::types::ids::ThreadId;
use crate::types::state::risk_rows;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use rules::{default_rules, derive_high_water_mark, ProgressCondition, ProgressRule};
pub use store::{
    FileStepStateStore, InMemoryStepStateStore, SharedStepStateStore, StepStateStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bookend {
    Start,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bookend: Option<Bookend>,
}

impl StepDef {
    pub fn numbered(label: &str) -> Self {
        Self {
            label: label.to_string(),
            bookend: None,
        }
    }

    pub fn bookend(label: &str, bookend: Bookend) -> Self {
        Self {
            label: label.to_string(),
            bookend: Some(bookend),
        }
    }

    pub fn is_numbered(&self) -> bool {
        self.bookend.is_none()
    }
}

pub fn default_steps() -> Vec<StepDef> {
    vec![
        StepDef::bookend("File Upload", Bookend::Start),
        StepDef::numbered("Document Ingestion"),
        StepDef::numbered("Information Extraction"),
        StepDef::numbered("Report Refinement"),
        StepDef::numbered("Cause & Consequence Analysis"),
        StepDef::numbered("Risk Evaluation"),
        StepDef::numbered("Hazard Identification"),
        StepDef::numbered("Protection Strategy Development"),
        StepDef::bookend("Risk Analysis", Bookend::Complete),
    ]
}

/// 1-based visible number of a numbered step; bookends have none.
pub fn step_number(steps: &[StepDef], idx: usize) -> Option<usize> {
    let step = steps.get(idx)?;
    if !step.is_numbered() {
        return None;
    }
    Some(steps[..idx].iter().filter(|s| s.is_numbered()).count() + 1)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    pub current_step_index: usize,
    pub completed_steps_high_water_mark: usize,
}

/// Wizard for one thread.
pub struct StepWizard {
    thread_id: ThreadId,
    steps: Vec<StepDef>,
    rules: Vec<ProgressRule>,
    store: SharedStepStateStore,
    state: StepState,
    loading: bool,
    navigated_this_run: bool,
    has_risk_data: bool,
    reset_token: Uuid,
}

impl StepWizard {
    /// Build a wizard and restore the thread's persisted state.
    pub async fn load(
        thread_id: ThreadId,
        steps: Vec<StepDef>,
        rules: Vec<ProgressRule>,
        store: SharedStepStateStore,
    ) -> Result<Self> {
        let mut state = store.load(&thread_id).await?.unwrap_or_default();
        let last = steps.len().saturating_sub(1);
        state.current_step_index = state.current_step_index.min(last);
        state.completed_steps_high_water_mark = state.completed_steps_high_water_mark.min(last);
        tracing::debug!("step state of thread {}: {:?}", thread_id, state);
        Ok(Self {
            thread_id,
            steps,
            rules,
            store,
            state,
            loading: false,
            navigated_this_run: false,
            has_risk_data: false,
            reset_token: Uuid::new_v4(),
        })
    }

    /// Wizard with the default steps and rules
    pub async fn with_defaults(thread_id: ThreadId, store: SharedStepStateStore) -> Result<Self> {
        Self::load(thread_id, default_steps(), default_rules(), store).await
    }

    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    pub fn steps(&self) -> &[StepDef] {
        &self.steps
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    pub fn current_step(&self) -> usize {
        self.state.current_step_index
    }

    pub fn high_water_mark(&self) -> usize {
        self.state.completed_steps_high_water_mark
    }

    pub fn reset_token(&self) -> Uuid {
        self.reset_token
    }

    pub fn step_number(&self, idx: usize) -> Option<usize> {
        step_number(&self.steps, idx)
    }

    pub fn is_navigable(&self, idx: usize) -> bool {
        idx < self.steps.len() && idx <= self.state.completed_steps_high_water_mark
    }

    fn complete_index(&self) -> usize {
        self.steps
            .iter()
            .position(|s| s.bookend == Some(Bookend::Complete))
            .unwrap_or(self.steps.len().saturating_sub(1))
    }

    async fn commit(&mut self, next: StepState) -> Result<bool> {
        if next == self.state {
            return Ok(false);
        }
        self.state = next;
        self.store.save(&self.thread_id, &self.state).await?;
        Ok(true)
    }

    /// Recompute the high-water mark from the latest accumulated values.
    pub async fn on_values(&mut self, values: &Value) -> Result<bool> {
        self.has_risk_data = !risk_rows(values).is_empty();
        let last = self.steps.len().saturating_sub(1);
        let derived = derive_high_water_mark(
            &self.rules,
            values,
            self.state.completed_steps_high_water_mark,
        )
        .min(last)
        .max(self.state.completed_steps_high_water_mark);
        let next = StepState {
            completed_steps_high_water_mark: derived,
            ..self.state
        };
        if next != self.state {
            tracing::debug!(
                "thread {} reached step {}",
                self.thread_id,
                next.completed_steps_high_water_mark
            );
        }
        self.commit(next).await
    }

    /// Track the run's loading flag; auto-advances on loading -> idle.
    pub async fn on_loading_changed(&mut self, loading: bool) -> Result<bool> {
        let was_loading = std::mem::replace(&mut self.loading, loading);
        if loading {
            if !was_loading {
                self.navigated_this_run = false;
            }
            return Ok(false);
        }
        if !was_loading || !self.has_risk_data || self.navigated_this_run {
            return Ok(false);
        }
        let complete = self.complete_index();
        tracing::info!("run on thread {} finished, advancing to step {}", self.thread_id, complete);
        let next = StepState {
            current_step_index: complete,
            completed_steps_high_water_mark: self.state.completed_steps_high_water_mark.max(complete),
        };
        self.commit(next).await
    }

    /// Manual navigation; rejected past the high-water mark.
    pub async fn request_step(&mut self, target: usize) -> Result<bool> {
        if !self.is_navigable(target) {
            tracing::debug!(
                "step {} not reachable (high-water mark {})",
                target,
                self.state.completed_steps_high_water_mark
            );
            return Ok(false);
        }
        self.navigated_this_run = true;
        let next = StepState {
            current_step_index: target,
            ..self.state
        };
        self.commit(next).await?;
        Ok(true)
    }

    /// Back to the start with a fresh reset token and no stored state.
    pub async fn new_run(&mut self) -> Result<()> {
        self.state = StepState::default();
        self.navigated_this_run = false;
        self.has_risk_data = false;
        self.reset_token = Uuid::new_v4();
        self.store.clear(&self.thread_id).await?;
        tracing::info!("step wizard of thread {} reset", self.thread_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    async fn wizard(store: SharedStepStateStore) -> StepWizard {
        StepWizard::with_defaults(ThreadId::new("T1"), store).await.unwrap()
    }

    fn risk_values() -> Value {
        json!({"input_file": "a.pdf", "risk_data": [{"Id": "R1", "Nível de Risco": "Alto"}]})
    }

    #[test]
    fn test_step_numbers() {
        let steps = default_steps();
        assert_eq!(steps.len(), 9);
        assert_eq!(step_number(&steps, 0), None);
        assert_eq!(step_number(&steps, 1), Some(1));
        assert_eq!(step_number(&steps, 7), Some(7));
        assert_eq!(step_number(&steps, 8), None);
        assert_eq!(step_number(&steps, 9), None);
    }

    #[test]
    fn test_state_wire_format() {
        let state = StepState {
            current_step_index: 2,
            completed_steps_high_water_mark: 5,
        };
        assert_eq!(
            serde_json::to_value(state).unwrap(),
            json!({"currentStepIndex": 2, "completedStepsHighWaterMark": 5})
        );
    }

    #[tokio::test]
    async fn test_navigation_gated_by_mark() {
        let mut w = wizard(InMemoryStepStateStore::shared()).await;
        assert!(!w.request_step(3).await.unwrap());
        w.on_values(&json!({"risk_data": [{"Id": "R1"}]})).await.unwrap();
        assert_eq!(w.high_water_mark(), 3);
        assert!(w.request_step(3).await.unwrap());
        assert_eq!(w.current_step(), 3);
        assert!(w.request_step(0).await.unwrap());
        assert!(!w.request_step(4).await.unwrap());
        assert_eq!(w.current_step(), 0);
    }

    #[tokio::test]
    async fn test_auto_advance_only_on_loading_transition() {
        let mut w = wizard(InMemoryStepStateStore::shared()).await;
        w.on_loading_changed(true).await.unwrap();
        w.on_values(&risk_values()).await.unwrap();
        assert_eq!(w.current_step(), 0);

        assert!(w.on_loading_changed(false).await.unwrap());
        assert_eq!(w.current_step(), 8);

        // further data updates do not move the current step
        w.request_step(2).await.unwrap();
        w.on_values(&risk_values()).await.unwrap();
        assert!(!w.on_loading_changed(false).await.unwrap());
        assert_eq!(w.current_step(), 2);
    }

    #[tokio::test]
    async fn test_manual_navigation_suppresses_auto_advance() {
        let mut w = wizard(InMemoryStepStateStore::shared()).await;
        w.on_loading_changed(true).await.unwrap();
        w.on_values(&risk_values()).await.unwrap();
        w.request_step(4).await.unwrap();
        assert!(!w.on_loading_changed(false).await.unwrap());
        assert_eq!(w.current_step(), 4);

        // a new loading period re-arms the advance
        w.on_loading_changed(true).await.unwrap();
        assert!(w.on_loading_changed(false).await.unwrap());
        assert_eq!(w.current_step(), 8);
    }

    #[tokio::test]
    async fn test_no_advance_without_risk_data() {
        let mut w = wizard(InMemoryStepStateStore::shared()).await;
        w.on_loading_changed(true).await.unwrap();
        w.on_values(&json!({"input_file": "a.pdf"})).await.unwrap();
        assert!(!w.on_loading_changed(false).await.unwrap());
        assert_eq!(w.current_step(), 0);
        assert_eq!(w.high_water_mark(), 1);
    }

    #[tokio::test]
    async fn test_state_survives_reload_and_reset_clears_it() {
        let dir = tempfile::tempdir().unwrap();
        let store: SharedStepStateStore = Arc::new(FileStepStateStore::new(dir.path()));

        let mut w = wizard(store.clone()).await;
        w.on_values(&risk_values()).await.unwrap();
        w.request_step(5).await.unwrap();
        let token = w.reset_token();

        let mut reloaded = wizard(store.clone()).await;
        assert_eq!(
            reloaded.state(),
            StepState {
                current_step_index: 5,
                completed_steps_high_water_mark: 5
            }
        );

        reloaded.new_run().await.unwrap();
        assert_eq!(reloaded.state(), StepState::default());
        assert_ne!(reloaded.reset_token(), token);
        assert_eq!(store.load(&ThreadId::new("T1")).await.unwrap(), None);
    }
}
