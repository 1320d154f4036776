//! # Shared capture state

use crate::prelude::v1::*;
use std::sync::Arc;

/// Lifecycle of a capture worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureStatus {
    Idle,
    Capturing,
    Stopped,
}

impl Default for CaptureStatus {
    fn default() -> Self {
        Self::Idle
    }
}

/// Latest published values of the loop.
///
/// Consumers that only care about the current flow read this instead of draining the result
/// channel.
#[derive(Clone, Debug, Default)]
pub struct SharedState {
    /// Flow of the last successful tick.
    pub flow: Option<Arc<FlowField>>,
    /// Index of the last successful tick.
    pub count: usize,
    /// Description of the last failure, cleared by the next successful tick.
    pub cv_error: Option<String>,
    pub status: CaptureStatus,
    /// The loop gave up after a failure and is no longer ticking.
    pub stalled: bool,
    /// Results dropped because the result queue was full.
    pub dropped: usize,
}

impl SharedState {
    /// Fold a tick result into the state.
    pub fn apply(&mut self, result: &FrameResult) {
        match (&result.flow, &result.error) {
            (_, Some(err)) => self.cv_error = Some(err.clone()),
            (Some(flow), None) => {
                self.flow = Some(flow.clone());
                self.count = result.tick_index;
                self.cv_error = None;
            }
            (None, None) => {}
        }
    }

    /// Reset to the state of a freshly started capture.
    pub fn restart(&mut self) {
        *self = Self {
            status: CaptureStatus::Capturing,
            ..Default::default()
        };
    }
}
