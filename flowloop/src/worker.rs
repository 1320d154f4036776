//! # Background capture worker
//!
//! The worker owns the frame loop on a dedicated thread. Ticks run strictly one after another
//! and re-arm themselves with the throttling delay; stopping is cooperative through an atomic
//! flag checked before every tick and while sleeping.

use crate::frame_loop::{FrameLoop, FrameResult, TickOutcome};
use crate::prelude::v1::*;
use crate::timer::sleep_while;
use log::*;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::{self, Receiver, SyncSender, TrySendError},
    Arc, RwLock,
};
use std::thread::{Builder, JoinHandle};

/// Owner of a capture session.
pub struct CaptureWorker {
    settings: LoopSettings,
    state: Arc<RwLock<SharedState>>,
    streaming: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    results_tx: SyncSender<FrameResult>,
    results_rx: Option<Receiver<FrameResult>>,
}

impl core::ops::Deref for CaptureWorker {
    type Target = RwLock<SharedState>;

    fn deref(&self) -> &Self::Target {
        &self.state
    }
}

impl Default for CaptureWorker {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl CaptureWorker {
    pub fn new(settings: LoopSettings) -> Self {
        let (results_tx, results_rx) = mpsc::sync_channel(settings.result_queue.max(1));

        Self {
            settings,
            state: Default::default(),
            streaming: Arc::new(AtomicBool::new(false)),
            handle: None,
            results_tx,
            results_rx: Some(results_rx),
        }
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    /// Take the receiving end of the result channel.
    ///
    /// Every tick, successful or not, sends one `FrameResult`. When the consumer falls more than
    /// `result_queue` results behind, new results are dropped. Returns `None` if already taken.
    pub fn take_results(&mut self) -> Option<Receiver<FrameResult>> {
        self.results_rx.take()
    }

    /// Snapshot of the shared state.
    pub fn snapshot(&self) -> SharedState {
        self.state
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn status(&self) -> CaptureStatus {
        self.snapshot().status
    }

    /// Whether the worker has been asked to keep streaming.
    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    /// Whether the loop thread is still ticking.
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Open a source and start ticking.
    ///
    /// `open` receives the configured constraints and returns the source. Opening errors and
    /// a failure to read the first frame are returned to the caller and leave the worker idle.
    /// If capture is already running, it is stopped first.
    ///
    /// # Arguments
    ///
    /// * `open` - source constructor.
    /// * `estimator` - flow estimator to run on every tick.
    pub fn start_capture<S, E, F>(&mut self, open: F, estimator: E) -> Result<()>
    where
        S: FrameSource + 'static,
        E: FlowEstimator + 'static,
        F: FnOnce(&CaptureConstraints) -> Result<S>,
    {
        if self.handle.is_some() {
            info!("restarting capture");
            self.stop_capture()?;
        }

        self.settings.validate()?;

        let source = open(&self.settings.constraints).map_err(|e| {
            warn!("unable to start capture: {:#}", e);
            e
        })?;

        if let Some(fps) = source.framerate() {
            info!("source reports {:.2} fps", fps);
        }

        let mut frame_loop = FrameLoop::new(source, estimator, self.settings);

        if let Err(e) = frame_loop.prime() {
            warn!("no first frame: {:#}", e);
            frame_loop.release();
            return Err(e);
        }

        if let Ok(mut state) = self.state.write() {
            state.restart();
        }

        self.streaming.store(true, Ordering::Release);

        let state = self.state.clone();
        let streaming = self.streaming.clone();
        let tx = self.results_tx.clone();
        let policy = self.settings.error_policy;

        info!(
            "capture started at {:?} fps, policy {:?}",
            self.settings.target_fps, policy
        );

        let handle = Builder::new()
            .name("flowloop-capture".into())
            .spawn(move || run(frame_loop, state, streaming, tx, policy));

        match handle {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.streaming.store(false, Ordering::Release);
                if let Ok(mut state) = self.state.write() {
                    state.status = CaptureStatus::Stopped;
                }
                Err(e.into())
            }
        }
    }

    /// Stop capturing.
    ///
    /// A tick that is already executing runs to completion, after which the loop releases its
    /// buffers and the source. Calling this when not capturing does nothing.
    pub fn stop_capture(&mut self) -> Result<()> {
        self.streaming.store(false, Ordering::Release);

        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => return Ok(()),
        };

        let joined = handle.join();

        if let Ok(mut state) = self.state.write() {
            state.status = CaptureStatus::Stopped;
        }

        info!("capture stopped");

        joined.map_err(|_| anyhow!("capture thread panicked"))
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        if let Err(e) = self.stop_capture() {
            error!("{}", e);
        }
    }
}

fn publish(state: &RwLock<SharedState>, tx: &SyncSender<FrameResult>, result: FrameResult) {
    if let Ok(mut state) = state.write() {
        state.apply(&result);
    }

    match tx.try_send(result) {
        Err(TrySendError::Full(result)) => {
            let dropped = state
                .write()
                .map(|mut state| {
                    state.dropped += 1;
                    state.dropped
                })
                .unwrap_or_default();
            warn!(
                "result queue full, dropped tick {} ({} dropped so far)",
                result.tick_index, dropped
            );
        }
        // Nobody is listening, the shared state still has the value.
        Err(TrySendError::Disconnected(_)) | Ok(()) => {}
    }
}

fn run<S: FrameSource, E: FlowEstimator>(
    mut frame_loop: FrameLoop<S, E>,
    state: Arc<RwLock<SharedState>>,
    streaming: Arc<AtomicBool>,
    tx: SyncSender<FrameResult>,
    policy: ErrorPolicy,
) {
    let mut failures = 0;

    while streaming.load(Ordering::Acquire) {
        let outcome = frame_loop.tick(|result| publish(&state, &tx, result));

        let delay = match outcome {
            TickOutcome::Published { delay } | TickOutcome::Resynced { delay } => {
                failures = 0;
                delay
            }
            TickOutcome::Failed { error, delay } => {
                error!("{}", error);
                failures += 1;

                match policy.retry_delay(failures) {
                    Some(backoff) => {
                        warn!("retrying in {:?} ({} consecutive failures)", backoff, failures);
                        delay.max(backoff)
                    }
                    None => {
                        warn!("capture loop stalled after {} failures", failures);
                        if let Ok(mut state) = state.write() {
                            state.stalled = true;
                        }
                        break;
                    }
                }
            }
        };

        if !sleep_while(&streaming, delay) {
            break;
        }
    }

    frame_loop.release();

    debug!("capture loop exited after {} ticks", frame_loop.ticks());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_loop::tests::{CountingSource, RecordingEstimator};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn settings(policy: ErrorPolicy) -> LoopSettings {
        LoopSettings {
            target_fps: 200.0,
            error_policy: policy,
            ..Default::default()
        }
    }

    #[test]
    fn publishes_sequential_results() {
        let mut worker = CaptureWorker::new(settings(ErrorPolicy::Stall));
        let rx = worker.take_results().unwrap();
        assert!(worker.take_results().is_none());

        worker
            .start_capture(
                |c| Ok(CountingSource::new(c.width, c.height)),
                RecordingEstimator::default(),
            )
            .unwrap();
        assert_eq!(worker.status(), CaptureStatus::Capturing);

        for i in 0..5 {
            let r = rx.recv_timeout(WAIT).unwrap();
            assert_eq!(r.tick_index, i);
            assert_eq!(r.flow.unwrap().dim(), (640, 480));
        }

        worker.stop_capture().unwrap();

        let state = worker.snapshot();
        assert!(state.count >= 4);
        assert!(state.cv_error.is_none());
        assert_eq!(state.status, CaptureStatus::Stopped);
    }

    #[test]
    fn start_errors_propagate() {
        let mut worker = CaptureWorker::default();

        let err = worker
            .start_capture(
                |_| -> Result<CountingSource> {
                    Err(CaptureError::PermissionDenied("camera 0".into()).into())
                },
                RecordingEstimator::default(),
            )
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<CaptureError>(),
            Some(CaptureError::PermissionDenied(_))
        ));
        assert_eq!(worker.status(), CaptureStatus::Idle);
        assert!(!worker.is_running());
    }

    #[test]
    fn rejects_too_low_fps() {
        let mut worker = CaptureWorker::new(settings(ErrorPolicy::Stall));
        worker.settings.target_fps = 1e-20;

        let opened = Arc::new(AtomicUsize::new(0));
        let counter = opened.clone();

        assert!(worker
            .start_capture(
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(CountingSource::new(8, 8))
                },
                RecordingEstimator::default(),
            )
            .is_err());

        assert_eq!(opened.load(Ordering::SeqCst), 0);
        assert_eq!(worker.status(), CaptureStatus::Idle);
        assert!(!worker.is_running());
    }

    #[test]
    fn ticks_are_throttled() {
        let mut worker = CaptureWorker::new(settings(ErrorPolicy::Stall));
        worker.settings.target_fps = 30.0;
        let rx = worker.take_results().unwrap();

        worker
            .start_capture(|_| Ok(CountingSource::new(8, 8)), RecordingEstimator::default())
            .unwrap();

        rx.recv_timeout(WAIT).unwrap();
        let start = std::time::Instant::now();
        for _ in 0..3 {
            rx.recv_timeout(WAIT).unwrap();
        }
        let elapsed = start.elapsed();

        worker.stop_capture().unwrap();

        // Three intervals of 33.3ms, minus some slack for timer granularity.
        assert!(elapsed >= Duration::from_millis(90), "{:?}", elapsed);
    }

    #[test]
    fn full_queue_counts_drops() {
        let mut worker = CaptureWorker::new(LoopSettings {
            result_queue: 1,
            ..settings(ErrorPolicy::Stall)
        });
        let rx = worker.take_results().unwrap();

        worker
            .start_capture(|_| Ok(CountingSource::new(8, 8)), RecordingEstimator::default())
            .unwrap();

        let start = std::time::Instant::now();
        while worker.snapshot().dropped < 3 && start.elapsed() < WAIT {
            std::thread::sleep(Duration::from_millis(5));
        }

        worker.stop_capture().unwrap();

        let state = worker.snapshot();
        assert!(state.dropped >= 3);
        // Only the first result fit into the queue.
        let queued = rx.try_iter().collect::<Vec<_>>();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].tick_index, 0);
        assert_eq!(state.count, state.dropped);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut worker = CaptureWorker::default();
        worker.stop_capture().unwrap();
        assert_eq!(worker.status(), CaptureStatus::Idle);

        worker
            .start_capture(|_| Ok(CountingSource::new(8, 8)), RecordingEstimator::default())
            .unwrap();
        worker.stop_capture().unwrap();
        worker.stop_capture().unwrap();
        assert_eq!(worker.status(), CaptureStatus::Stopped);
        assert!(!worker.is_streaming());
    }

    #[test]
    fn stall_on_error() {
        let mut worker = CaptureWorker::new(settings(ErrorPolicy::Stall));
        let rx = worker.take_results().unwrap();
        let est = RecordingEstimator::default();
        est.fail_on.lock().unwrap().push(1);

        worker
            .start_capture(|_| Ok(CountingSource::new(8, 8)), est.clone())
            .unwrap();

        assert!(rx.recv_timeout(WAIT).unwrap().is_ok());
        let failed = rx.recv_timeout(WAIT).unwrap();
        assert!(failed.flow.is_none());
        assert!(failed.error.unwrap().contains("injected failure"));

        // No rescheduling after the failure.
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(est.calls.lock().unwrap().len(), 2);

        let state = worker.snapshot();
        assert_eq!(state.count, 0);
        assert!(state.cv_error.is_some());
        assert!(state.stalled);
        assert_eq!(state.status, CaptureStatus::Capturing);
        assert!(!worker.is_running());

        worker.stop_capture().unwrap();
        assert_eq!(worker.status(), CaptureStatus::Stopped);
    }

    #[test]
    fn restart_after_stall() {
        let mut worker = CaptureWorker::new(settings(ErrorPolicy::Stall));
        let rx = worker.take_results().unwrap();
        let est = RecordingEstimator::default();
        est.fail_on.lock().unwrap().push(0);

        worker
            .start_capture(|_| Ok(CountingSource::new(8, 8)), est.clone())
            .unwrap();
        assert!(!rx.recv_timeout(WAIT).unwrap().is_ok());

        worker
            .start_capture(|_| Ok(CountingSource::new(8, 8)), est.clone())
            .unwrap();
        let r = rx.recv_timeout(WAIT).unwrap();
        assert!(r.is_ok());
        assert_eq!(r.tick_index, 0);
        assert!(worker.snapshot().cv_error.is_none());
    }

    #[test]
    fn retry_policy_recovers() {
        let mut worker = CaptureWorker::new(settings(ErrorPolicy::Retry {
            backoff_ms: 1,
            max_retries: 3,
        }));
        let rx = worker.take_results().unwrap();
        let est = RecordingEstimator::default();
        est.fail_on.lock().unwrap().extend([1, 2]);

        worker
            .start_capture(|_| Ok(CountingSource::new(8, 8)), est)
            .unwrap();

        let results = (0..4)
            .map(|_| rx.recv_timeout(WAIT).unwrap())
            .collect::<Vec<_>>();

        assert!(results[0].is_ok());
        assert!(!results[1].is_ok());
        assert!(!results[2].is_ok());
        assert!(results[3].is_ok());
        assert_eq!(results[3].tick_index, 1);

        worker.stop_capture().unwrap();
        assert!(worker.snapshot().cv_error.is_none());
        assert!(!worker.snapshot().stalled);
    }

    #[test]
    fn retry_policy_gives_up() {
        let mut worker = CaptureWorker::new(settings(ErrorPolicy::Retry {
            backoff_ms: 1,
            max_retries: 2,
        }));
        let rx = worker.take_results().unwrap();
        let est = RecordingEstimator::default();
        est.fail_on.lock().unwrap().extend(0..100);

        worker
            .start_capture(|_| Ok(CountingSource::new(8, 8)), est.clone())
            .unwrap();

        for _ in 0..3 {
            assert!(!rx.recv_timeout(WAIT).unwrap().is_ok());
        }
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(est.calls.lock().unwrap().len(), 3);
        assert!(worker.snapshot().stalled);
    }

    /// Blocks inside `estimate` until told to continue.
    struct GatedEstimator {
        entered: mpsc::Sender<()>,
        proceed: Arc<Mutex<mpsc::Receiver<()>>>,
        calls: Arc<AtomicUsize>,
    }

    impl FlowEstimator for GatedEstimator {
        fn estimate(
            &mut self,
            _: &GrayFrame,
            next: &GrayFrame,
            _: &FarnebackParams,
            out: &mut FlowField,
        ) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.send(()).ok();
            self.proceed.lock().unwrap().recv().ok();
            let (w, h) = next.dim();
            out.reset(w, h);
            Ok(())
        }
    }

    #[test]
    fn in_flight_tick_finishes_on_stop() {
        let mut worker = CaptureWorker::new(settings(ErrorPolicy::Stall));
        let rx = worker.take_results().unwrap();

        let (entered_tx, entered_rx) = mpsc::channel();
        let (proceed_tx, proceed_rx) = mpsc::channel();
        let calls = Arc::new(AtomicUsize::new(0));

        worker
            .start_capture(
                |_| Ok(CountingSource::new(8, 8)),
                GatedEstimator {
                    entered: entered_tx,
                    proceed: Arc::new(Mutex::new(proceed_rx)),
                    calls: calls.clone(),
                },
            )
            .unwrap();

        entered_rx.recv_timeout(WAIT).unwrap();

        // Ask to stop while the tick is inside the estimator, then let it finish.
        worker.streaming.store(false, Ordering::Release);
        proceed_tx.send(()).unwrap();
        worker.stop_capture().unwrap();

        let published = rx.try_iter().collect::<Vec<_>>();
        assert_eq!(published.len(), 1);
        assert!(published[0].is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_releases_source() {
        let mut worker = CaptureWorker::new(settings(ErrorPolicy::Stall));
        let rx = worker.take_results().unwrap();

        let src = CountingSource::new(8, 8);
        let reads = src.reads.clone();
        let released = src.released.clone();

        worker
            .start_capture(move |_| Ok(src), RecordingEstimator::default())
            .unwrap();

        rx.recv_timeout(WAIT).unwrap();
        rx.recv_timeout(WAIT).unwrap();

        worker.stop_capture().unwrap();
        assert!(released.load(Ordering::SeqCst));

        let after_stop = reads.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(reads.load(Ordering::SeqCst), after_stop);
    }
}
