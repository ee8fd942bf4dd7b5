//! The load-then-capture state machine.
//!
//! ```text
//! Created -> Loading -> Loaded -> Delaying -> Capturing -> Done
//!    \__________\__________\_________\___________\______-> Errored
//! ```
//!
//! The only open-ended suspension point is the wait on the engine's
//! [`LoadSignal`](crate::LoadSignal). A surface, once acquired, is released on
//! every path out of the machine.

use crate::output;
use crate::{CaptureReport, CaptureRequest, Engine, Error, EventLoop, Result, Surface};
use log::{debug, info, warn};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Loading,
    Loaded,
    Delaying,
    Capturing,
    Done,
    Errored,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::Errored)
    }

    fn can_transition_to(self, next: State) -> bool {
        use State::*;
        match (self, next) {
            (Created, Loading)
            | (Loading, Loaded)
            | (Loaded, Delaying)
            | (Delaying, Capturing)
            | (Capturing, Done) => true,
            (from, Errored) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Drives one [`CaptureRequest`] through an [`Engine`].
///
/// A sequencer runs at most once; its transition history stays available
/// afterwards.
#[derive(Debug)]
pub struct CaptureSequencer {
    state: State,
    history: Vec<State>,
}

impl Default for CaptureSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSequencer {
    pub fn new() -> Self {
        Self {
            state: State::Created,
            history: vec![State::Created],
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Every state visited so far, starting with `Created`.
    pub fn history(&self) -> &[State] {
        &self.history
    }

    fn transition(&mut self, next: State) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::CaptureFailure(format!(
                "illegal state transition {:?} -> {:?}",
                self.state, next
            )));
        }
        debug!("capture state {:?} -> {:?}", self.state, next);
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Run the capture. Calling this on a sequencer that already ran is an error.
    pub async fn run<E: Engine>(
        &mut self,
        engine: &mut E,
        request: &CaptureRequest,
    ) -> Result<CaptureReport> {
        if self.state != State::Created {
            return Err(Error::InvalidInput(format!(
                "capture sequencer already ran (state {:?})",
                self.state
            )));
        }

        let started = Instant::now();
        match self.drive(engine, request).await {
            Ok((png, (width, height))) => {
                let report = CaptureReport {
                    engine: engine.name().to_string(),
                    address: request.address.clone(),
                    output_path: request.output_path.display().to_string(),
                    width,
                    height,
                    bytes: png.len(),
                    sha256: output::sha256_hex(&png),
                    duration_ms: started.elapsed().as_millis() as u64,
                };
                info!(
                    "captured {} to {} ({}x{}, {} bytes, {}ms)",
                    report.address,
                    report.output_path,
                    width,
                    height,
                    report.bytes,
                    report.duration_ms
                );
                Ok(report)
            }
            Err(err) => {
                warn!("capture of {} failed in {:?}: {}", request.address, self.state, err);
                // Errored is reachable from every non-terminal state
                let _ = self.transition(State::Errored);
                Err(err)
            }
        }
    }

    async fn drive<E: Engine>(
        &mut self,
        engine: &mut E,
        request: &CaptureRequest,
    ) -> Result<(Vec<u8>, (u32, u32))> {
        request.validate()?;
        output::preflight(&request.output_path)?;

        self.transition(State::Loading)?;
        let mut surface = engine.create_surface(&request.surface_options())?;
        let res = self.drive_surface(&mut surface, request).await;

        match (res, surface.release()) {
            (Ok(out), Ok(())) => {
                self.transition(State::Done)?;
                Ok(out)
            }
            (Ok(out), Err(e)) => {
                // The image is already on disk; a failed teardown does not undo it
                warn!("failed to release {} surface: {}", engine.name(), e);
                self.transition(State::Done)?;
                Ok(out)
            }
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_err)) => {
                warn!("failed to release {} surface: {}", engine.name(), release_err);
                Err(e)
            }
        }
    }

    async fn drive_surface<S: Surface>(
        &mut self,
        surface: &mut S,
        request: &CaptureRequest,
    ) -> Result<(Vec<u8>, (u32, u32))> {
        if let Some(ua) = &request.user_agent {
            surface.set_user_agent(ua)?;
        }

        let signal = surface.load(&request.address)?;
        match request.load_timeout() {
            Some(limit) => tokio::time::timeout(limit, signal.wait())
                .await
                .map_err(|_| Error::LoadTimeout(limit.as_millis() as u64))??,
            None => signal.wait().await?,
        }
        self.transition(State::Loaded)?;

        self.transition(State::Delaying)?;
        tokio::time::sleep(Duration::from_millis(request.post_load_delay_ms)).await;

        self.transition(State::Capturing)?;
        let bitmap = surface.extract_bitmap(request.full_page)?;
        let bitmap = if request.full_page {
            bitmap
        } else {
            let (width, height) = request.surface_size();
            output::normalize(bitmap, width, height)
        };

        let png = output::encode_png(&bitmap)?;
        output::write_atomic(&request.output_path, &png)?;
        Ok((png, bitmap.dimensions()))
    }
}

/// Capture `request` inside an already running tokio runtime.
pub async fn capture_async<E: Engine>(mut engine: E, request: &CaptureRequest) -> Result<CaptureReport> {
    CaptureSequencer::new().run(&mut engine, request).await
}

/// Capture `request`, owning an event loop for the duration of the call.
///
/// The loop is started before the engine is asked to load anything and is
/// stopped exactly once whether the capture succeeds or fails.
pub fn capture<E: Engine>(engine: E, request: &CaptureRequest) -> Result<CaptureReport> {
    let event_loop = EventLoop::start()?;
    let res = event_loop.run(capture_async(engine, request));
    event_loop.stop();
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{EngineEvent, LoadBehavior, ScriptedEngine};
    use crate::Viewport;
    use std::path::Path;

    fn request(dir: &Path, delay_ms: u64) -> CaptureRequest {
        CaptureRequest {
            viewport: Viewport { width: 80, height: 60 },
            post_load_delay_ms: delay_ms,
            ..CaptureRequest::new("https://example.com", dir.join("out.png"))
        }
    }

    #[tokio::test]
    async fn success_visits_every_state_once() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), 0);
        let mut engine = ScriptedEngine::default();
        let mut seq = CaptureSequencer::new();

        let report = seq.run(&mut engine, &req).await.unwrap();

        use State::*;
        assert_eq!(seq.history(), &[Created, Loading, Loaded, Delaying, Capturing, Done]);
        assert_eq!((report.width, report.height), (80, 60));
        assert_eq!(report.engine, "scripted");
        assert_eq!(report.bytes as u64, std::fs::metadata(&req.output_path).unwrap().len());
    }

    #[tokio::test]
    async fn zero_delay_still_captures_after_load() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ScriptedEngine::new(LoadBehavior::CompleteAfter(Duration::from_millis(30)));
        let journal = engine.journal();

        capture_async(engine, &request(dir.path(), 0)).await.unwrap();

        let loaded = journal.position(|e| *e == EngineEvent::LoadCompleted).unwrap();
        let extracted = journal
            .position(|e| matches!(e, EngineEvent::BitmapExtracted { .. }))
            .unwrap();
        assert!(loaded < extracted);
    }

    #[tokio::test]
    async fn every_step_happens_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ScriptedEngine::default();
        let journal = engine.journal();

        capture_async(engine, &request(dir.path(), 5)).await.unwrap();

        assert_eq!(journal.count(|e| matches!(e, EngineEvent::SurfaceCreated { .. })), 1);
        assert_eq!(journal.count(|e| matches!(e, EngineEvent::LoadIssued(_))), 1);
        assert_eq!(journal.count(|e| matches!(e, EngineEvent::BitmapExtracted { .. })), 1);
        assert_eq!(journal.count(|e| *e == EngineEvent::Released), 1);
    }

    #[tokio::test]
    async fn post_load_delay_is_observed() {
        let dir = tempfile::tempdir().unwrap();
        let started = Instant::now();
        capture_async(ScriptedEngine::default(), &request(dir.path(), 60))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn user_agent_applied_before_load() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ScriptedEngine::default();
        let journal = engine.journal();
        let req = CaptureRequest {
            user_agent: Some("CustomBot/1.0".into()),
            ..request(dir.path(), 0)
        };

        capture_async(engine, &req).await.unwrap();

        let ua = journal
            .position(|e| *e == EngineEvent::UserAgentSet("CustomBot/1.0".into()))
            .unwrap();
        let load = journal.position(|e| matches!(e, EngineEvent::LoadIssued(_))).unwrap();
        assert!(ua < load);
    }

    #[tokio::test]
    async fn load_failure_releases_and_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), 0);
        let mut engine = ScriptedEngine::new(LoadBehavior::Fail("net::ERR_NAME_NOT_RESOLVED".into()));
        let journal = engine.journal();
        let mut seq = CaptureSequencer::new();

        let err = seq.run(&mut engine, &req).await.unwrap_err();

        assert!(matches!(err, Error::LoadFailure(_)));
        assert!(!req.output_path.exists());
        assert_eq!(journal.count(|e| *e == EngineEvent::Released), 1);
        assert_eq!(seq.history(), &[State::Created, State::Loading, State::Errored]);
    }

    #[tokio::test]
    async fn rejected_load_is_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), 0);
        let engine = ScriptedEngine::new(LoadBehavior::Reject("Cannot navigate to invalid URL".into()));
        let journal = engine.journal();

        let err = capture_async(engine, &req).await.unwrap_err();

        assert!(matches!(err, Error::LoadFailure(_)));
        assert_eq!(journal.count(|e| *e == EngineEvent::Released), 1);
    }

    #[tokio::test]
    async fn load_timeout_is_opt_in() {
        let dir = tempfile::tempdir().unwrap();
        let req = CaptureRequest {
            load_timeout_ms: Some(50),
            ..request(dir.path(), 0)
        };
        let engine = ScriptedEngine::new(LoadBehavior::Never);
        let journal = engine.journal();

        let err = capture_async(engine, &req).await.unwrap_err();

        assert!(matches!(err, Error::LoadTimeout(50)));
        assert!(!req.output_path.exists());
        assert_eq!(journal.count(|e| *e == EngineEvent::Released), 1);
    }

    #[tokio::test]
    async fn unwritable_output_never_touches_engine() {
        let dir = tempfile::tempdir().unwrap();
        let req = CaptureRequest::new("https://example.com", dir.path().join("nope").join("out.png"));
        let mut engine = ScriptedEngine::default();
        let journal = engine.journal();
        let mut seq = CaptureSequencer::new();

        let err = seq.run(&mut engine, &req).await.unwrap_err();

        assert!(matches!(err, Error::EncodeOrWriteFailure(_)));
        assert!(journal.events().is_empty());
        assert_eq!(seq.history(), &[State::Created, State::Errored]);
    }

    #[tokio::test]
    async fn invalid_viewport_never_touches_engine() {
        let dir = tempfile::tempdir().unwrap();
        let req = CaptureRequest {
            viewport: Viewport { width: 0, height: 0 },
            ..request(dir.path(), 0)
        };
        let engine = ScriptedEngine::default();
        let journal = engine.journal();

        let err = capture_async(engine, &req).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(journal.events().is_empty());
    }

    #[tokio::test]
    async fn extraction_failure_releases_surface() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), 0);
        let mut engine = ScriptedEngine::default().failing_extraction("surface lost");
        let journal = engine.journal();
        let mut seq = CaptureSequencer::new();

        let err = seq.run(&mut engine, &req).await.unwrap_err();

        assert!(matches!(err, Error::CaptureFailure(_)));
        assert!(!req.output_path.exists());
        assert_eq!(journal.count(|e| *e == EngineEvent::Released), 1);
        assert_eq!(seq.history().last(), Some(&State::Errored));
        assert!(seq.history().contains(&State::Capturing));
    }

    #[tokio::test]
    async fn surface_allocation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ScriptedEngine::default().failing_surface("out of memory");
        let journal = engine.journal();

        let err = capture_async(engine, &request(dir.path(), 0)).await.unwrap_err();
        assert!(matches!(err, Error::CaptureFailure(_)));
        assert!(journal.events().is_empty());
    }

    #[tokio::test]
    async fn sequencer_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), 0);
        let mut engine = ScriptedEngine::default();
        let journal = engine.journal();
        let mut seq = CaptureSequencer::new();

        seq.run(&mut engine, &req).await.unwrap();
        let err = seq.run(&mut engine, &req).await.unwrap_err();

        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(seq.state(), State::Done);
        assert_eq!(journal.count(|e| matches!(e, EngineEvent::LoadIssued(_))), 1);
    }

    #[tokio::test]
    async fn oversized_render_is_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), 0);
        let engine = ScriptedEngine::default().with_render_size(95, 60);

        let report = capture_async(engine, &req).await.unwrap();
        assert_eq!((report.width, report.height), (80, 60));
    }

    #[tokio::test]
    async fn full_page_keeps_document_height() {
        let dir = tempfile::tempdir().unwrap();
        let req = CaptureRequest {
            full_page: true,
            ..request(dir.path(), 0)
        };
        let engine = ScriptedEngine::default().with_document_height(200);

        let report = capture_async(engine, &req).await.unwrap();
        assert_eq!((report.width, report.height), (80, 200));
    }

    #[test]
    fn transitions_are_restricted() {
        use State::*;
        assert!(Created.can_transition_to(Loading));
        assert!(!Loaded.can_transition_to(Loading));
        assert!(!Created.can_transition_to(Capturing));
        assert!(Delaying.can_transition_to(Errored));
        assert!(!Done.can_transition_to(Errored));
        assert!(!Errored.can_transition_to(Errored));
    }

    #[test]
    fn blocking_capture_owns_its_loop() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), 0);
        let first = capture(ScriptedEngine::default(), &req).unwrap();
        let second = capture(ScriptedEngine::default(), &req).unwrap();
        assert_eq!(first.sha256, second.sha256);
    }
}
