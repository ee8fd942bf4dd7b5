//! uri2png
//!
//! Capture a rendered web page to a PNG file through a headless browser.
//!
//! The crate drives an [`Engine`] through a fixed sequence: create a surface,
//! load the address, wait for the engine's load-completion signal, wait a
//! post-load delay, extract the bitmap, encode it and write it out. Each
//! [`CaptureRequest`] is processed exactly once.
//!
//! # Features
//!
//! - **CDP Backend** (default): headless Chrome via the Chrome DevTools Protocol
//! - **Scripted Engine**: deterministic in-process engine for tests
//!
//! # Example
//!
//! ```no_run
//! use uri2png::{CaptureRequest, Viewport};
//! use uri2png::cdp::{CdpEngine, LaunchConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let request = CaptureRequest {
//!     viewport: Viewport { width: 800, height: 600 },
//!     post_load_delay_ms: 500,
//!     ..CaptureRequest::new("https://example.com", "example.png")
//! };
//!
//! let report = uri2png::capture(CdpEngine::new(LaunchConfig::default()), &request)?;
//! println!("wrote {}x{} to {}", report.width, report.height, report.output_path);
//! # Ok(())
//! # }
//! ```

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::oneshot;

pub mod error;
pub use error::{Error, Result};

#[cfg(feature = "cdp")]
pub mod cdp;

// Deterministic engine used by tests and dry runs
pub mod scripted;

pub mod event_loop;
pub mod output;
pub mod sequencer;

pub use event_loop::EventLoop;
pub use sequencer::{capture, capture_async, CaptureSequencer, State};

/// Rendered pixels handed from a surface to the encoder
pub type Bitmap = image::RgbaImage;

/// Viewport dimensions in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self::square(1280)
    }
}

impl Viewport {
    /// A viewport with equal width and height.
    pub fn square(size: u32) -> Self {
        Self {
            width: size,
            height: size,
        }
    }

    /// Keep the width and derive the height from a `W:H` ratio such as `16:9`.
    ///
    /// ```
    /// let v = uri2png::Viewport::square(1280).with_aspect_ratio("16:9").unwrap();
    /// assert_eq!(v.height, 720);
    /// ```
    pub fn with_aspect_ratio(self, ratio: &str) -> Result<Self> {
        let invalid = || {
            Error::InvalidInput(format!(
                "invalid aspect ratio '{}', use a format like 16:9 or 4:3",
                ratio
            ))
        };

        let (w, h) = ratio.trim().split_once(':').ok_or_else(invalid)?;
        let w: u32 = w.parse().map_err(|_| invalid())?;
        let h: u32 = h.parse().map_err(|_| invalid())?;
        if w == 0 || h == 0 {
            return Err(invalid());
        }

        let height = (self.width as f64 * h as f64 / w as f64).round() as u32;
        Ok(Self {
            width: self.width,
            height,
        })
    }
}

/// Largest surface edge, in device pixels, that Chrome will paint.
pub const MAX_SURFACE_DIMENSION: u32 = 16384;

/// A single capture job
///
/// Built once from user input and consumed by one [`capture`] call. The
/// `address` is handed to the engine untouched; the output file is replaced
/// if it already exists.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    /// Resource locator to render
    pub address: String,
    /// Where the PNG is written
    pub output_path: PathBuf,
    /// Surface size in CSS pixels
    pub viewport: Viewport,
    /// Time to wait after load completion before capturing
    pub post_load_delay_ms: u64,
    /// Identification string override
    pub user_agent: Option<String>,
    /// Upper bound on the load-completion wait; `None` waits indefinitely
    pub load_timeout_ms: Option<u64>,
    /// Capture the whole scrollable document instead of the viewport
    pub full_page: bool,
    /// Device pixels per CSS pixel
    pub device_scale_factor: f64,
}

impl CaptureRequest {
    pub fn new(address: impl Into<String>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            address: address.into(),
            output_path: output_path.into(),
            viewport: Viewport::default(),
            post_load_delay_ms: 1000,
            user_agent: None,
            load_timeout_ms: None,
            full_page: false,
            device_scale_factor: 1.0,
        }
    }

    /// Reject requests that cannot be captured, before any engine is touched.
    pub fn validate(&self) -> Result<()> {
        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(Error::InvalidInput(format!(
                "viewport must be positive, got {}x{}",
                self.viewport.width, self.viewport.height
            )));
        }
        if !self.device_scale_factor.is_finite() || self.device_scale_factor <= 0.0 {
            return Err(Error::InvalidInput(format!(
                "device scale factor must be positive, got {}",
                self.device_scale_factor
            )));
        }
        let too_large = |v: u32| v as f64 * self.device_scale_factor > MAX_SURFACE_DIMENSION as f64;
        if too_large(self.viewport.width) || too_large(self.viewport.height) {
            return Err(Error::InvalidInput(format!(
                "surface {}x{} at scale {} exceeds {} device pixels per side",
                self.viewport.width, self.viewport.height, self.device_scale_factor, MAX_SURFACE_DIMENSION
            )));
        }
        if self.output_path.as_os_str().is_empty() {
            return Err(Error::InvalidInput("output path is empty".into()));
        }
        Ok(())
    }

    /// Pixel dimensions of the surface (viewport scaled by the device scale factor).
    pub fn surface_size(&self) -> (u32, u32) {
        let scale = |v: u32| ((v as f64 * self.device_scale_factor).round() as u32).max(1);
        (scale(self.viewport.width), scale(self.viewport.height))
    }

    pub fn load_timeout(&self) -> Option<Duration> {
        self.load_timeout_ms.map(Duration::from_millis)
    }

    pub fn surface_options(&self) -> SurfaceOptions {
        SurfaceOptions {
            viewport: self.viewport,
            device_scale_factor: self.device_scale_factor,
            load_timeout: self.load_timeout(),
        }
    }
}

/// Parameters an engine needs to allocate a surface
#[derive(Debug, Clone)]
pub struct SurfaceOptions {
    pub viewport: Viewport,
    pub device_scale_factor: f64,
    /// Hint for engines whose drivers carry their own wait deadline
    pub load_timeout: Option<Duration>,
}

/// Outcome of a successful capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureReport {
    /// Name of the engine that rendered the page
    pub engine: String,
    pub address: String,
    pub output_path: String,
    /// Pixel dimensions of the written PNG
    pub width: u32,
    pub height: u32,
    /// Size of the written file
    pub bytes: usize,
    /// Hex SHA-256 of the PNG bytes
    pub sha256: String,
    pub duration_ms: u64,
}

/// Sending half of a load-completion notification.
///
/// Engines resolve it exactly once, from any thread.
pub struct LoadNotifier {
    tx: oneshot::Sender<Result<()>>,
}

impl LoadNotifier {
    /// Report that the document and its resources finished loading.
    pub fn complete(self) {
        let _ = self.tx.send(Ok(()));
    }

    /// Report a load error.
    pub fn fail(self, err: Error) {
        let _ = self.tx.send(Err(err));
    }
}

/// The single suspension point of a capture: resolves when the engine
/// delivers its load-completion notification.
pub struct LoadSignal {
    rx: oneshot::Receiver<Result<()>>,
}

impl LoadSignal {
    pub fn channel() -> (LoadNotifier, LoadSignal) {
        let (tx, rx) = oneshot::channel();
        (LoadNotifier { tx }, LoadSignal { rx })
    }

    /// A signal that is already resolved, for engines that load synchronously.
    pub fn ready(result: Result<()>) -> Self {
        let (notifier, signal) = Self::channel();
        let _ = notifier.tx.send(result);
        signal
    }

    pub async fn wait(self) -> Result<()> {
        match self.rx.await {
            Ok(res) => res,
            Err(_) => Err(Error::LoadFailure(
                "engine dropped the load-completion notification".into(),
            )),
        }
    }
}

/// A browser engine able to allocate offscreen rendering surfaces
pub trait Engine {
    type Surface: Surface;

    /// Short engine identifier used in reports and logs
    fn name(&self) -> &str;

    /// Allocate a surface sized `viewport * device_scale_factor`.
    fn create_surface(&mut self, options: &SurfaceOptions) -> Result<Self::Surface>;
}

/// An offscreen renderable area owned by an engine
pub trait Surface {
    /// Override the identification string sent with requests
    fn set_user_agent(&mut self, user_agent: &str) -> Result<()>;

    /// Issue the load request. Errors reported synchronously (malformed
    /// address, refused navigation) are returned directly; completion is
    /// delivered through the returned signal.
    fn load(&mut self, address: &str) -> Result<LoadSignal>;

    /// Extract the rendered bitmap
    fn extract_bitmap(&mut self, full_page: bool) -> Result<Bitmap>;

    /// Release all engine resources held by this surface
    fn release(self) -> Result<()>;
}
