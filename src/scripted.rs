//! A deterministic, in-process engine.
//!
//! `ScriptedEngine` never touches the network. Its load behaviour is chosen up
//! front and the bitmap it renders is a pure function of the address and the
//! surface size, which makes it suitable for exercising the capture sequence
//! in tests and for dry runs. Every engine call is appended to a shared
//! [`Journal`] so callers can assert on ordering.

use crate::{Bitmap, Engine, Error, LoadNotifier, LoadSignal, Result, Surface, SurfaceOptions};
use image::Rgba;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How the scripted surface answers a load request
#[derive(Debug, Clone)]
pub enum LoadBehavior {
    /// Signal completion from a helper thread after the given time
    CompleteAfter(Duration),
    /// Signal a load error asynchronously
    Fail(String),
    /// Refuse the load request synchronously
    Reject(String),
    /// Never signal
    Never,
}

/// Engine call recorded by the scripted engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    SurfaceCreated { width: u32, height: u32 },
    UserAgentSet(String),
    LoadIssued(String),
    LoadCompleted,
    LoadFailed(String),
    BitmapExtracted { width: u32, height: u32 },
    Released,
}

/// Shared, ordered record of engine calls
#[derive(Debug, Clone, Default)]
pub struct Journal {
    events: Arc<Mutex<Vec<EngineEvent>>>,
}

impl Journal {
    fn push(&self, ev: EngineEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ev);
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Position of the first event matching `pred`
    pub fn position(&self, pred: impl Fn(&EngineEvent) -> bool) -> Option<usize> {
        self.events().iter().position(pred)
    }

    pub fn count(&self, pred: impl Fn(&EngineEvent) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }
}

pub struct ScriptedEngine {
    load: LoadBehavior,
    surface_error: Option<String>,
    extract_error: Option<String>,
    render_size: Option<(u32, u32)>,
    document_height: Option<u32>,
    journal: Journal,
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new(LoadBehavior::CompleteAfter(Duration::from_millis(10)))
    }
}

impl ScriptedEngine {
    pub fn new(load: LoadBehavior) -> Self {
        Self {
            load,
            surface_error: None,
            extract_error: None,
            render_size: None,
            document_height: None,
            journal: Journal::default(),
        }
    }

    /// Fail surface allocation with `msg`.
    pub fn failing_surface(mut self, msg: impl Into<String>) -> Self {
        self.surface_error = Some(msg.into());
        self
    }

    /// Fail bitmap extraction with `msg`.
    pub fn failing_extraction(mut self, msg: impl Into<String>) -> Self {
        self.extract_error = Some(msg.into());
        self
    }

    /// Render at a fixed pixel size regardless of the requested surface,
    /// like an engine that adds scrollbars or window chrome.
    pub fn with_render_size(mut self, width: u32, height: u32) -> Self {
        self.render_size = Some((width, height));
        self
    }

    /// Height of the simulated document in CSS pixels (full-page captures).
    pub fn with_document_height(mut self, height: u32) -> Self {
        self.document_height = Some(height);
        self
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }
}

impl Engine for ScriptedEngine {
    type Surface = ScriptedSurface;

    fn name(&self) -> &str {
        "scripted"
    }

    fn create_surface(&mut self, options: &SurfaceOptions) -> Result<ScriptedSurface> {
        if let Some(msg) = &self.surface_error {
            return Err(Error::CaptureFailure(msg.clone()));
        }

        let scale = options.device_scale_factor;
        let px = |v: u32| ((v as f64 * scale).round() as u32).max(1);
        let (width, height) = self
            .render_size
            .unwrap_or((px(options.viewport.width), px(options.viewport.height)));
        // Like a real page, a short document still fills the viewport
        let document_height = self.document_height.map(px).unwrap_or(height).max(height);

        self.journal.push(EngineEvent::SurfaceCreated { width, height });

        Ok(ScriptedSurface {
            width,
            height,
            document_height,
            load: self.load.clone(),
            extract_error: self.extract_error.clone(),
            address: None,
            pending: None,
            journal: self.journal.clone(),
        })
    }
}

pub struct ScriptedSurface {
    width: u32,
    height: u32,
    document_height: u32,
    load: LoadBehavior,
    extract_error: Option<String>,
    address: Option<String>,
    // Held so that `LoadBehavior::Never` keeps the signal pending
    #[allow(dead_code)]
    pending: Option<LoadNotifier>,
    journal: Journal,
}

impl Surface for ScriptedSurface {
    fn set_user_agent(&mut self, user_agent: &str) -> Result<()> {
        self.journal.push(EngineEvent::UserAgentSet(user_agent.to_string()));
        Ok(())
    }

    fn load(&mut self, address: &str) -> Result<LoadSignal> {
        self.journal.push(EngineEvent::LoadIssued(address.to_string()));

        let (notifier, signal) = LoadSignal::channel();
        match &self.load {
            LoadBehavior::CompleteAfter(after) => {
                let after = *after;
                let journal = self.journal.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(after);
                    journal.push(EngineEvent::LoadCompleted);
                    notifier.complete();
                });
            }
            LoadBehavior::Fail(msg) => {
                self.journal.push(EngineEvent::LoadFailed(msg.clone()));
                notifier.fail(Error::LoadFailure(msg.clone()));
            }
            LoadBehavior::Reject(msg) => {
                self.journal.push(EngineEvent::LoadFailed(msg.clone()));
                return Err(Error::LoadFailure(msg.clone()));
            }
            LoadBehavior::Never => self.pending = Some(notifier),
        }

        self.address = Some(address.to_string());
        Ok(signal)
    }

    fn extract_bitmap(&mut self, full_page: bool) -> Result<Bitmap> {
        if let Some(msg) = &self.extract_error {
            return Err(Error::CaptureFailure(msg.clone()));
        }
        let address = self
            .address
            .as_deref()
            .ok_or_else(|| Error::CaptureFailure("No document loaded".into()))?;

        let height = if full_page { self.document_height } else { self.height };
        let bitmap = render(address, self.width, height);
        self.journal.push(EngineEvent::BitmapExtracted {
            width: bitmap.width(),
            height: bitmap.height(),
        });
        Ok(bitmap)
    }

    fn release(self) -> Result<()> {
        self.journal.push(EngineEvent::Released);
        Ok(())
    }
}

/// Horizontal bands coloured from the address digest, with a darker gutter
/// every 64 columns.
fn render(address: &str, width: u32, height: u32) -> Bitmap {
    let digest = Sha256::digest(address.as_bytes());
    Bitmap::from_fn(width, height, |x, y| {
        let band = ((y / 16) % 10) as usize * 3;
        let shade = if x % 64 == 0 { 2 } else { 1 };
        Rgba([
            digest[band] / shade,
            digest[band + 1] / shade,
            digest[band + 2] / shade,
            255,
        ])
    })
}
