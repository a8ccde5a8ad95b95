//! Recognition orchestrator.
//!
//! One session owns the frame source and runs the cycle
//! `waiting → motion_detected → searching → (processing) → dwell → waiting`.
//! The cycle runs inline in the session task, so motion is not sampled
//! while a cycle is in flight and at most one outcome is ever pending.

use crate::config::SessionConfig;
use crate::gallery::GalleryCache;
use crate::matcher::FaceMatcher;
use crate::mirror::{self, AuditMirror};
use porter_core::{AuditLog, AuditLogEntry, DecisionPolicy, Gallery, Verdict};
use porter_hw::{CameraError, Frame, FrameSource, MotionDetector};
use serde::Serialize;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    Waiting,
    MotionDetected,
    Searching,
    Processing,
}

/// Snapshot published on every transition.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: SystemState,
    /// True while a match call is in flight.
    pub processing: bool,
    /// Outcome on display during the dwell, cleared afterwards.
    pub latest: Option<AuditLogEntry>,
    /// Set when the camera could not be acquired; the session is stopped.
    pub halted: Option<String>,
    /// Completed recognition cycles.
    pub cycles: u64,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SystemState::Waiting,
            processing: false,
            latest: None,
            halted: None,
            cycles: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionTiming {
    pub poll_interval: Duration,
    pub settle_delay: Duration,
    pub dwell_success: Duration,
    pub dwell_failure: Duration,
}

impl From<&SessionConfig> for SessionTiming {
    fn from(config: &SessionConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            settle_delay: Duration::from_millis(config.settle_delay_ms),
            dwell_success: Duration::from_millis(config.dwell_success_ms),
            dwell_failure: Duration::from_millis(config.dwell_failure_ms),
        }
    }
}

/// Everything a session needs; the session takes ownership.
pub struct SessionParts {
    pub source: Box<dyn FrameSource>,
    pub motion: MotionDetector,
    pub matcher: Arc<dyn FaceMatcher>,
    pub gallery: Arc<GalleryCache>,
    pub policy: DecisionPolicy,
    pub audit: Arc<Mutex<AuditLog>>,
    pub mirror: Option<Arc<dyn AuditMirror>>,
    pub timing: SessionTiming,
}

pub struct Session {
    camera: BlockingSource,
    motion: MotionDetector,
    matcher: Arc<dyn FaceMatcher>,
    gallery: Arc<GalleryCache>,
    policy: DecisionPolicy,
    audit: Arc<Mutex<AuditLog>>,
    mirror: Option<Arc<dyn AuditMirror>>,
    timing: SessionTiming,
    status: watch::Sender<SessionStatus>,
    cancel: CancellationToken,
}

/// The frame source, driven from the blocking pool so a stalled device
/// never holds up an async worker. The source is moved into each call and
/// handed back when it returns; a call abandoned at teardown keeps it, and
/// dropping it there releases the device.
struct BlockingSource {
    source: Option<Box<dyn FrameSource>>,
}

impl BlockingSource {
    async fn call<T, F>(&mut self, op: F) -> Result<T, CameraError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn FrameSource) -> Result<T, CameraError> + Send + 'static,
    {
        let mut source = self.source.take().ok_or(CameraError::NotStarted)?;
        let (source, result) = tokio::task::spawn_blocking(move || {
            let result = op(source.as_mut());
            (source, result)
        })
        .await
        .map_err(|e| CameraError::CaptureFailed(format!("frame source task failed: {e}")))?;
        self.source = Some(source);
        result
    }

    async fn start(&mut self) -> Result<(), CameraError> {
        self.call(|source| source.start()).await
    }

    async fn capture(&mut self) -> Result<Frame, CameraError> {
        self.call(|source| source.capture()).await
    }

    async fn stop(&mut self) {
        let _ = self
            .call(|source| {
                source.stop();
                Ok(())
            })
            .await;
    }
}

/// Control and observation of a running session.
pub struct SessionHandle {
    status: watch::Receiver<SessionStatus>,
    audit: Arc<Mutex<AuditLog>>,
    cancel: CancellationToken,
    done: oneshot::Receiver<()>,
}

impl Session {
    fn build(parts: SessionParts) -> (Self, SessionHandle, oneshot::Sender<()>) {
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let (done_tx, done_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let handle = SessionHandle {
            status: status_rx,
            audit: parts.audit.clone(),
            cancel: cancel.clone(),
            done: done_rx,
        };
        let session = Self {
            camera: BlockingSource {
                source: Some(parts.source),
            },
            motion: parts.motion,
            matcher: parts.matcher,
            gallery: parts.gallery,
            policy: parts.policy,
            audit: parts.audit,
            mirror: parts.mirror,
            timing: parts.timing,
            status: status_tx,
            cancel,
        };
        (session, handle, done_tx)
    }

    /// Run the session as a task on the current runtime.
    pub fn spawn(parts: SessionParts) -> SessionHandle {
        let (session, handle, done) = Self::build(parts);
        tokio::spawn(session.run(done));
        handle
    }

    async fn run(mut self, done: oneshot::Sender<()>) {
        if let Err(e) = self.camera.start().await {
            let message = format!("Camera unavailable: {e}");
            tracing::error!(error = %e, "cannot start frame source; session halted");
            self.publish(|s| s.halted = Some(message));
            let _ = done.send(());
            return;
        }
        tracing::info!(mode = %self.policy.mode, "recognition session started");

        let cancel = self.cancel.clone();
        let mut ticker = interval(self.timing.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let captured = tokio::select! {
                _ = cancel.cancelled() => break,
                c = self.camera.capture() => c,
            };
            let frame = match captured {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!(error = %e, "poll capture failed; skipping tick");
                    continue;
                }
            };
            if !self.motion.sample(&frame) {
                continue;
            }

            if self.cycle().await.is_break() {
                break;
            }
            ticker.reset();
        }

        self.camera.stop().await;
        self.publish(|s| {
            s.state = SystemState::Waiting;
            s.processing = false;
            s.latest = None;
        });
        tracing::info!("recognition session stopped");
        let _ = done.send(());
    }

    /// One recognition cycle. `Break` means the session was torn down and
    /// nothing from this cycle may be recorded.
    async fn cycle(&mut self) -> ControlFlow<()> {
        let cancel = self.cancel.clone();
        let timing = self.timing;

        tracing::info!("motion detected");
        self.set_state(SystemState::MotionDetected);
        pause(&cancel, timing.settle_delay).await?;

        self.set_state(SystemState::Searching);
        let probe = tokio::select! {
            _ = cancel.cancelled() => return ControlFlow::Break(()),
            p = self.camera.capture() => p,
        };

        self.publish(|s| {
            s.state = SystemState::Processing;
            s.processing = true;
        });

        let verdict = match probe {
            Err(e) => {
                tracing::error!(error = %e, "probe capture failed");
                Verdict::from_failure(e)
            }
            Ok(frame) => {
                let gallery = tokio::select! {
                    _ = cancel.cancelled() => return ControlFlow::Break(()),
                    g = current_gallery(&self.gallery) => g,
                };
                let matcher = self.matcher.clone();
                let result = tokio::select! {
                    _ = cancel.cancelled() => return ControlFlow::Break(()),
                    r = matcher.match_face(frame, gallery.clone()) => r,
                };
                match result {
                    Ok(face) => self.policy.decide(&face, &gallery),
                    Err(e) => {
                        tracing::error!(error = %e, "face matcher failed");
                        Verdict::from_failure(e)
                    }
                }
            }
        };

        // A result that lands after teardown is discarded.
        if cancel.is_cancelled() {
            return ControlFlow::Break(());
        }

        let entry = AuditLogEntry::from_verdict(self.policy.mode, &verdict);
        self
            .audit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .append(entry.clone());

        tracing::info!(
            id = %entry.outcome.id,
            decision = %entry.outcome.decision,
            reason = ?entry.outcome.reason,
            confidence = entry.outcome.confidence,
            identity = entry.outcome.matched_identity_id.as_deref().unwrap_or("-"),
            "recognition outcome"
        );

        let authorized = entry.outcome.decision.is_authorized();
        if let Some(sink) = self.mirror.clone() {
            let mirrored = entry.clone();
            tokio::spawn(async move { mirror::forward(sink.as_ref(), &mirrored).await });
        }

        self.publish(|s| {
            s.state = SystemState::Searching;
            s.processing = false;
            s.latest = Some(entry);
            s.cycles += 1;
        });

        let dwell = if authorized {
            timing.dwell_success
        } else {
            timing.dwell_failure
        };
        pause(&cancel, dwell).await?;

        self.motion.reset();
        self.publish(|s| {
            s.state = SystemState::Waiting;
            s.latest = None;
        });
        ControlFlow::Continue(())
    }

    fn set_state(&self, state: SystemState) {
        self.publish(|s| s.state = state);
    }

    fn publish(&self, update: impl FnOnce(&mut SessionStatus)) {
        self.status.send_modify(update);
    }
}

async fn pause(cancel: &CancellationToken, duration: Duration) -> ControlFlow<()> {
    tokio::select! {
        _ = cancel.cancelled() => ControlFlow::Break(()),
        _ = sleep(duration) => ControlFlow::Continue(()),
    }
}

/// A gallery that fails to load is treated as empty for this cycle.
async fn current_gallery(cache: &GalleryCache) -> Arc<Gallery> {
    match cache.load(false).await {
        Ok(gallery) => gallery,
        Err(e) => {
            tracing::warn!(error = %e, "gallery unavailable; matching against an empty gallery");
            Arc::new(Gallery::empty())
        }
    }
}

impl SessionHandle {
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn audit(&self) -> Arc<Mutex<AuditLog>> {
        self.audit.clone()
    }

    /// Up to `n` audit entries, newest first.
    pub fn recent(&self, n: usize) -> Vec<AuditLogEntry> {
        self.audit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recent(n)
    }

    /// Cancel the session, abandon any in-flight match and wait for the
    /// camera to be released.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.done.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::tests::{stored, FakeExtractor, FakeSource};
    use crate::matcher::MatchError;
    use crate::mirror::tests::RecordingMirror;
    use async_trait::async_trait;
    use porter_core::{Decision, FaceMatch, OperatingMode, Reason};
    use porter_hw::MotionConfig;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::Instant;

    const DARK: u8 = 10;
    const BRIGHT: u8 = 200;

    fn frame(value: u8) -> Frame {
        Frame::from_rgb(vec![value; 4 * 4 * 3], 4, 4).unwrap()
    }

    /// Replays scripted captures, then repeats the last frame forever.
    struct ScriptedSource {
        script: VecDeque<Result<u8, &'static str>>,
        last: u8,
        start_error: Option<CameraError>,
        stopped: Arc<AtomicBool>,
    }

    impl ScriptedSource {
        fn new(script: &[Result<u8, &'static str>]) -> Self {
            Self {
                script: script.iter().cloned().collect(),
                last: DARK,
                start_error: None,
                stopped: Arc::new(AtomicBool::new(false)),
            }
        }

        /// Dark baseline, then `flips` alternations between bright and dark.
        fn flickering(flips: usize) -> Self {
            let mut script = vec![Ok(DARK), Ok(DARK)];
            for i in 0..flips {
                let v = if i % 2 == 0 { BRIGHT } else { DARK };
                // Motion frame, probe frame, post-dwell baseline.
                script.extend([Ok(v), Ok(v), Ok(v)]);
            }
            Self::new(&script)
        }
    }

    impl FrameSource for ScriptedSource {
        fn start(&mut self) -> Result<(), CameraError> {
            match self.start_error.take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        fn capture(&mut self) -> Result<Frame, CameraError> {
            match self.script.pop_front() {
                Some(Ok(v)) => {
                    self.last = v;
                    Ok(frame(v))
                }
                Some(Err(msg)) => Err(CameraError::CaptureFailed(msg.into())),
                None => Ok(frame(self.last)),
            }
        }

        fn stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        fn is_active(&self) -> bool {
            !self.stopped.load(Ordering::SeqCst)
        }
    }

    impl Drop for ScriptedSource {
        fn drop(&mut self) {
            self.stop();
        }
    }

    /// Blocks inside `capture` until the test releases it.
    struct StalledSource {
        entered: tokio::sync::mpsc::UnboundedSender<()>,
        release: std::sync::mpsc::Receiver<()>,
        dropped: Arc<AtomicBool>,
    }

    impl FrameSource for StalledSource {
        fn start(&mut self) -> Result<(), CameraError> {
            Ok(())
        }

        fn capture(&mut self) -> Result<Frame, CameraError> {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            Ok(frame(DARK))
        }

        fn stop(&mut self) {}

        fn is_active(&self) -> bool {
            true
        }
    }

    impl Drop for StalledSource {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    /// Returns scripted results after `delay`, tracking overlap.
    struct ScriptedMatcher {
        results: Mutex<VecDeque<Result<FaceMatch, &'static str>>>,
        delay: Duration,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        completed: AtomicUsize,
    }

    impl ScriptedMatcher {
        fn new(results: Vec<Result<FaceMatch, &'static str>>, delay: Duration) -> Self {
            Self {
                results: Mutex::new(results.into()),
                delay,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl FaceMatcher for ScriptedMatcher {
        async fn match_face(
            &self,
            _frame: Frame,
            _gallery: Arc<Gallery>,
        ) -> Result<FaceMatch, MatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            sleep(self.delay).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);
            let next = self.results.lock().unwrap().pop_front();
            match next {
                Some(Ok(face)) => Ok(face),
                Some(Err(msg)) => Err(MatchError::Unavailable(msg.into())),
                None => Ok(FaceMatch::NoFace {
                    detection_confidence: 0.0,
                }),
            }
        }
    }

    fn resident() -> FaceMatch {
        FaceMatch::Match {
            identity_id: "10".into(),
            distance: 0.1,
        }
    }

    fn timing() -> SessionTiming {
        SessionTiming::from(&SessionConfig::default())
    }

    struct Harness {
        handle: SessionHandle,
        matcher: Arc<ScriptedMatcher>,
        stopped: Arc<AtomicBool>,
    }

    fn start(
        source: ScriptedSource,
        matcher: ScriptedMatcher,
        mode: OperatingMode,
        mirror: Option<Arc<dyn AuditMirror>>,
    ) -> Harness {
        let stopped = source.stopped.clone();
        let matcher = Arc::new(matcher);
        let gallery = Arc::new(GalleryCache::new(
            Arc::new(FakeSource::with(vec![stored("10", vec![1.0, 0.0])])),
            Arc::new(FakeExtractor),
            Duration::from_secs(300),
        ));
        let handle = Session::spawn(SessionParts {
            source: Box::new(source),
            motion: MotionDetector::new(MotionConfig::default()),
            matcher: matcher.clone(),
            gallery,
            policy: DecisionPolicy::new(mode, 0.55),
            audit: Arc::new(Mutex::new(AuditLog::with_capacity(50))),
            mirror,
            timing: timing(),
        });
        Harness {
            handle,
            matcher,
            stopped,
        }
    }

    async fn wait_for(
        rx: &mut watch::Receiver<SessionStatus>,
        pred: impl Fn(&SessionStatus) -> bool,
    ) {
        let wait = async {
            loop {
                if pred(&rx.borrow_and_update()) {
                    return;
                }
                rx.changed().await.unwrap();
            }
        };
        tokio::time::timeout(Duration::from_secs(600), wait)
            .await
            .expect("status never reached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_authorized_cycle() {
        let h = start(
            ScriptedSource::flickering(1),
            ScriptedMatcher::new(vec![Ok(resident())], Duration::from_millis(300)),
            OperatingMode::Access,
            None,
        );
        let mut rx = h.handle.subscribe();

        wait_for(&mut rx, |s| s.state == SystemState::MotionDetected).await;
        wait_for(&mut rx, |s| s.processing).await;
        wait_for(&mut rx, |s| s.latest.is_some()).await;

        let status = h.handle.status();
        assert!(!status.processing);
        let entry = status.latest.unwrap();
        assert_eq!(entry.outcome.decision, Decision::Authorized);
        assert_eq!(entry.identity.unwrap().display_name, "person 10");
        assert_eq!(h.handle.recent(10).len(), 1);

        wait_for(&mut rx, |s| s.state == SystemState::Waiting).await;
        assert!(h.handle.status().latest.is_none());
        h.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dwell_is_shorter_on_success() {
        for (result, expected) in [
            (resident(), Duration::from_secs(3)),
            (
                FaceMatch::Unknown { distance: 0.9 },
                Duration::from_secs(5),
            ),
        ] {
            let h = start(
                ScriptedSource::flickering(1),
                ScriptedMatcher::new(vec![Ok(result)], Duration::from_millis(100)),
                OperatingMode::Access,
                None,
            );
            let mut rx = h.handle.subscribe();
            wait_for(&mut rx, |s| s.latest.is_some()).await;
            let shown = Instant::now();
            wait_for(&mut rx, |s| s.latest.is_none()).await;
            let dwell = shown.elapsed();
            assert!(
                dwell >= expected && dwell < expected + Duration::from_millis(100),
                "dwell {dwell:?}, expected {expected:?}"
            );
            h.handle.shutdown().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_never_overlap() {
        let matcher = ScriptedMatcher::new(vec![], Duration::from_secs(2));
        let h = start(
            ScriptedSource::flickering(8),
            matcher,
            OperatingMode::Surveillance,
            None,
        );

        sleep(Duration::from_secs(120)).await;

        assert_eq!(h.matcher.max_in_flight.load(Ordering::SeqCst), 1);
        let calls = h.matcher.calls.load(Ordering::SeqCst);
        assert_eq!(calls, 8);
        let entries = h.handle.recent(50);
        assert_eq!(entries.len(), calls);
        assert!(entries
            .iter()
            .all(|e| e.outcome.decision == Decision::Intruder));
        // Newest first, strictly ordered in time.
        for pair in entries.windows(2) {
            assert!(pair[0].outcome.timestamp >= pair[1].outcome.timestamp);
        }
        assert_eq!(h.handle.status().cycles, 8);
        h.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_discards_in_flight_result() {
        let h = start(
            ScriptedSource::flickering(1),
            ScriptedMatcher::new(vec![Ok(resident())], Duration::from_secs(30)),
            OperatingMode::Access,
            None,
        );
        let mut rx = h.handle.subscribe();
        wait_for(&mut rx, |s| s.processing).await;

        let audit = h.handle.audit();
        h.handle.shutdown().await;
        sleep(Duration::from_secs(60)).await;

        assert_eq!(h.matcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.matcher.completed.load(Ordering::SeqCst), 0);
        assert!(audit.lock().unwrap().is_empty());
        assert!(h.stopped.load(Ordering::SeqCst));
        let last = rx.borrow().clone();
        assert!(last.latest.is_none());
        assert!(!last.processing);
        assert_eq!(last.state, SystemState::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_during_dwell() {
        let h = start(
            ScriptedSource::flickering(1),
            ScriptedMatcher::new(vec![Ok(resident())], Duration::from_millis(100)),
            OperatingMode::Access,
            None,
        );
        let mut rx = h.handle.subscribe();
        wait_for(&mut rx, |s| s.latest.is_some()).await;

        let started = Instant::now();
        let audit = h.handle.audit();
        h.handle.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(audit.lock().unwrap().len(), 1);
        assert!(h.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_matcher_failure_becomes_error_outcome_then_recovers() {
        let h = start(
            ScriptedSource::flickering(2),
            ScriptedMatcher::new(
                vec![Err("model crashed"), Ok(resident())],
                Duration::from_millis(100),
            ),
            OperatingMode::Surveillance,
            None,
        );

        sleep(Duration::from_secs(60)).await;

        let entries = h.handle.recent(10);
        assert_eq!(entries.len(), 2);
        let failed = &entries[1].outcome;
        assert_eq!(failed.decision, Decision::Error);
        assert_eq!(failed.reason, Reason::CapabilityFailure);
        assert!(failed.message.contains("model crashed"), "{}", failed.message);
        assert_eq!(entries[0].outcome.decision, Decision::Authorized);
        assert_eq!(h.handle.status().state, SystemState::Waiting);
        h.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_capture_failure_becomes_error_outcome() {
        let source = ScriptedSource::new(&[Ok(DARK), Ok(BRIGHT), Err("dequeue timeout")]);
        let h = start(
            source,
            ScriptedMatcher::new(vec![], Duration::from_millis(100)),
            OperatingMode::Access,
            None,
        );

        sleep(Duration::from_secs(30)).await;

        let entries = h.handle.recent(10);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome.decision, Decision::Error);
        assert_eq!(h.matcher.calls.load(Ordering::SeqCst), 0);
        h.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_capture_failure_is_skipped() {
        let source = ScriptedSource::new(&[Ok(DARK), Err("glitch"), Err("glitch"), Ok(DARK)]);
        let h = start(
            source,
            ScriptedMatcher::new(vec![], Duration::from_millis(100)),
            OperatingMode::Access,
            None,
        );

        sleep(Duration::from_secs(10)).await;

        assert!(h.handle.recent(10).is_empty());
        assert_eq!(h.handle.status().state, SystemState::Waiting);
        assert!(h.handle.status().halted.is_none());
        h.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_failure_halts() {
        let mut source = ScriptedSource::flickering(1);
        source.start_error = Some(CameraError::Permission("/dev/video0".into()));
        let h = start(
            source,
            ScriptedMatcher::new(vec![], Duration::from_millis(100)),
            OperatingMode::Access,
            None,
        );
        let mut rx = h.handle.subscribe();
        wait_for(&mut rx, |s| s.halted.is_some()).await;

        let halted = h.handle.status().halted.unwrap();
        assert!(halted.contains("access denied"), "{halted}");
        sleep(Duration::from_secs(10)).await;
        assert_eq!(h.matcher.calls.load(Ordering::SeqCst), 0);
        h.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_mirror_failure_keeps_local_entry() {
        let mirror = Arc::new(RecordingMirror {
            fail: true,
            ..Default::default()
        });
        let h = start(
            ScriptedSource::flickering(1),
            ScriptedMatcher::new(vec![Ok(FaceMatch::Unknown { distance: 0.8 })], Duration::ZERO),
            OperatingMode::Access,
            Some(mirror.clone() as Arc<dyn AuditMirror>),
        );

        sleep(Duration::from_secs(20)).await;

        assert_eq!(mirror.calls.lock().unwrap().len(), 1);
        let entries = h.handle.recent(10);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome.decision, Decision::Denied);
        h.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_gallery_failure_matches_against_empty_gallery() {
        let source = Arc::new(FakeSource::with(vec![]));
        source.fail.store(true, Ordering::SeqCst);
        let gallery = Arc::new(GalleryCache::new(
            source,
            Arc::new(FakeExtractor),
            Duration::from_secs(300),
        ));
        let matcher = Arc::new(ScriptedMatcher::new(vec![Ok(resident())], Duration::ZERO));
        let handle = Session::spawn(SessionParts {
            source: Box::new(ScriptedSource::flickering(1)),
            motion: MotionDetector::new(MotionConfig::default()),
            matcher,
            gallery,
            policy: DecisionPolicy::new(OperatingMode::Access, 0.55),
            audit: Arc::new(Mutex::new(AuditLog::default())),
            mirror: None,
            timing: timing(),
        });

        sleep(Duration::from_secs(20)).await;

        // The match names an identity the (empty) gallery cannot resolve.
        let entries = handle.recent(10);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome.decision, Decision::Denied);
        assert_eq!(entries[0].outcome.reason, Reason::NotInRoster);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_stalled_capture_does_not_block_runtime_or_shutdown() {
        let (entered_tx, mut entered) = tokio::sync::mpsc::unbounded_channel();
        let (release, release_rx) = std::sync::mpsc::channel();
        let dropped = Arc::new(AtomicBool::new(false));
        let handle = Session::spawn(SessionParts {
            source: Box::new(StalledSource {
                entered: entered_tx,
                release: release_rx,
                dropped: dropped.clone(),
            }),
            motion: MotionDetector::new(MotionConfig::default()),
            matcher: Arc::new(ScriptedMatcher::new(vec![], Duration::ZERO)),
            gallery: Arc::new(GalleryCache::new(
                Arc::new(FakeSource::with(vec![])),
                Arc::new(FakeExtractor),
                Duration::from_secs(300),
            )),
            policy: DecisionPolicy::new(OperatingMode::Access, 0.55),
            audit: Arc::new(Mutex::new(AuditLog::default())),
            mirror: None,
            timing: timing(),
        });

        // The capture is parked on the blocking pool; this single-threaded
        // runtime keeps running tasks and timers.
        entered.recv().await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.status().state, SystemState::Waiting);

        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .expect("shutdown waited on a stalled capture");

        // The abandoned capture still owns the source and drops it on return.
        release.send(()).unwrap();
        let released = async {
            while !dropped.load(Ordering::SeqCst) {
                sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(1), released)
            .await
            .expect("stalled source was never released");
    }
}
