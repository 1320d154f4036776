//! # Frame processing loop
//!
//! One tick reads a frame, converts it to grayscale, computes flow against the previous
//! grayscale frame, publishes the result and finally makes the current frame the new reference.

use crate::prelude::v1::*;
use crate::timer::Timer;
use log::*;
use std::sync::Arc;
use std::time::Duration;

/// Immutable output of a single tick.
#[derive(Clone, Debug)]
pub struct FrameResult {
    /// Zero-based index of the successful tick. Failed ticks carry the index the next successful
    /// tick will get.
    pub tick_index: usize,
    pub flow: Option<Arc<FlowField>>,
    pub error: Option<String>,
    /// Time spent reading, converting and computing flow.
    pub elapsed: Duration,
}

impl FrameResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// What happened during a tick, and how long to wait before the next one.
#[derive(Debug)]
pub enum TickOutcome {
    /// Flow was computed and published.
    Published { delay: Duration },
    /// Frame size changed, the reference frame was replaced and nothing was published.
    Resynced { delay: Duration },
    /// The tick failed. The failure was published, the reference frame was left untouched.
    Failed { error: CaptureError, delay: Duration },
}

impl TickOutcome {
    /// Throttling delay computed at the end of the tick.
    pub fn delay(&self) -> Duration {
        match self {
            Self::Published { delay } | Self::Resynced { delay } | Self::Failed { delay, .. } => {
                *delay
            }
        }
    }
}

/// Single-owner frame loop state.
///
/// The previous grayscale buffer is only touched by `tick`, which runs to completion before the
/// next one starts.
pub struct FrameLoop<S, E> {
    source: S,
    estimator: E,
    settings: LoopSettings,
    gray: GrayFrame,
    prev_gray: GrayFrame,
    last_flow: Option<Arc<FlowField>>,
    tick_index: usize,
}

impl<S: FrameSource, E: FlowEstimator> FrameLoop<S, E> {
    pub fn new(source: S, estimator: E, settings: LoopSettings) -> Self {
        Self {
            source,
            estimator,
            settings,
            gray: GrayFrame::default(),
            prev_gray: GrayFrame::default(),
            last_flow: None,
            tick_index: 0,
        }
    }

    /// Read the first frame and make it the reference for the first tick.
    pub fn prime(&mut self) -> Result<()> {
        let frame = self.source.read_frame()?;
        frame.to_gray_into(&mut self.prev_gray);
        debug!("primed with {:?} {:?} frame", frame.dim(), frame.format());
        Ok(())
    }

    /// Number of successful ticks so far.
    pub fn ticks(&self) -> usize {
        self.tick_index
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    /// Run a single tick, handing its result to `publish`.
    pub fn tick(&mut self, publish: impl FnOnce(FrameResult)) -> TickOutcome {
        let timer = Timer::default();
        let interval = self.settings.frame_interval();

        match self.compute() {
            Ok(Some(flow)) => {
                let tick_index = self.tick_index;
                self.tick_index += 1;
                self.last_flow = Some(flow.clone());

                trace!("tick {} computed in {:?}", tick_index, timer.elapsed());

                publish(FrameResult {
                    tick_index,
                    flow: Some(flow),
                    error: None,
                    elapsed: timer.elapsed(),
                });

                std::mem::swap(&mut self.prev_gray, &mut self.gray);

                TickOutcome::Published {
                    delay: timer.delay(interval),
                }
            }
            Ok(None) => {
                std::mem::swap(&mut self.prev_gray, &mut self.gray);
                TickOutcome::Resynced {
                    delay: timer.delay(interval),
                }
            }
            Err(e) => {
                let error = CaptureError::TickFailure {
                    tick: self.tick_index,
                    message: format!("{:#}", e),
                };

                publish(FrameResult {
                    tick_index: self.tick_index,
                    flow: None,
                    error: Some(error.to_string()),
                    elapsed: timer.elapsed(),
                });

                TickOutcome::Failed {
                    error,
                    delay: timer.delay(interval),
                }
            }
        }
    }

    /// Read, convert and compute flow. `None` means the reference frame had to be replaced.
    fn compute(&mut self) -> Result<Option<Arc<FlowField>>> {
        let frame = self.source.read_frame()?;
        frame.to_gray_into(&mut self.gray);

        if self.gray.dim() != self.prev_gray.dim() {
            warn!(
                "frame size changed from {:?} to {:?}, resetting reference",
                self.prev_gray.dim(),
                self.gray.dim()
            );
            return Ok(None);
        }

        let params = &self.settings.flow;

        let mut flow = match &self.last_flow {
            Some(last) if params.use_initial_flow() => FlowField::clone(last),
            _ => FlowField::default(),
        };

        self.estimator
            .estimate(&self.prev_gray, &self.gray, params, &mut flow)?;

        if flow.dim() != self.gray.dim() {
            return Err(anyhow!(
                "{} produced a {:?} field for {:?} frames",
                self.estimator.name(),
                flow.dim(),
                self.gray.dim()
            ));
        }

        Ok(Some(Arc::new(flow)))
    }

    /// Release the source and drop all frame buffers.
    pub fn release(&mut self) {
        self.source.release();
        self.gray.release();
        self.prev_gray.release();
        self.last_flow = None;
    }
}
