//! Chrome DevTools Protocol engine (uses the `headless_chrome` crate)

use base64::Engine as _;
use crate::{output, Bitmap, Engine, Error, LoadSignal, Result, Surface, SurfaceOptions, Viewport};
use headless_chrome::browser::tab::Tab;
use headless_chrome::protocol::cdp::Page;
use headless_chrome::{Browser, LaunchOptions};
use log::debug;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Stand-in for "no deadline" where the driver insists on one.
const UNBOUNDED_WAIT: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Extra time given to the driver's own navigation wait so that an opt-in
/// load timeout is always reported by the sequencer first.
const DRIVER_WAIT_GRACE: Duration = Duration::from_secs(1);

/// How Chrome is launched
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Chrome/Chromium binary; auto-detected when `None`
    pub chrome_path: Option<PathBuf>,
    /// Whether to keep Chrome's sandbox enabled
    pub sandbox: bool,
    /// Additional command-line flags passed to Chrome
    pub extra_args: Vec<String>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            sandbox: true,
            extra_args: Vec::new(),
        }
    }
}

/// Headless Chrome engine.
///
/// Chrome is started per surface, so constructing the engine is free and a
/// request that fails validation never launches a browser.
pub struct CdpEngine {
    config: LaunchConfig,
}

impl CdpEngine {
    pub fn new(config: LaunchConfig) -> Self {
        Self { config }
    }

    fn launch_args(&self, options: &SurfaceOptions) -> Vec<OsString> {
        let mut args = vec![OsString::from("--hide-scrollbars")];
        if (options.device_scale_factor - 1.0).abs() > f64::EPSILON {
            args.push(format!("--force-device-scale-factor={}", options.device_scale_factor).into());
        }
        args.extend(self.config.extra_args.iter().map(OsString::from));
        args
    }
}

impl Engine for CdpEngine {
    type Surface = CdpSurface;

    fn name(&self) -> &str {
        "chrome-devtools"
    }

    fn create_surface(&mut self, options: &SurfaceOptions) -> Result<CdpSurface> {
        let args = self.launch_args(options);
        let arg_refs: Vec<&OsStr> = args.iter().map(|a| a.as_os_str()).collect();

        let launch_options = LaunchOptions::default_builder()
            .headless(true)
            .sandbox(self.config.sandbox)
            .path(self.config.chrome_path.clone())
            .window_size(Some((options.viewport.width, options.viewport.height)))
            .idle_browser_timeout(UNBOUNDED_WAIT)
            .args(arg_refs)
            .build()
            .map_err(|e| Error::CaptureFailure(format!("Failed to build launch options: {}", e)))?;

        let browser = Browser::new(launch_options)
            .map_err(|e| Error::CaptureFailure(format!("Failed to launch browser: {}", e)))?;

        let tab = browser
            .new_tab()
            .map_err(|e| Error::CaptureFailure(format!("Failed to create tab: {}", e)))?;

        let wait = options
            .load_timeout
            .map(|t| t + DRIVER_WAIT_GRACE)
            .unwrap_or(UNBOUNDED_WAIT);
        tab.set_default_timeout(wait);

        debug!(
            "chrome surface ready ({}x{} @{}x)",
            options.viewport.width, options.viewport.height, options.device_scale_factor
        );

        Ok(CdpSurface {
            browser,
            tab,
            viewport: options.viewport,
        })
    }
}

/// Screenshot command covering `clip`, including the area below the viewport.
fn full_page_screenshot(clip: Page::Viewport) -> Page::CaptureScreenshot {
    Page::CaptureScreenshot {
        format: Some(Page::CaptureScreenshotFormatOption::Png),
        quality: None,
        clip: Some(clip),
        from_surface: Some(true),
        capture_beyond_viewport: Some(true),
        optimize_for_speed: None,
    }
}

/// A single Chrome tab sized to the requested viewport
pub struct CdpSurface {
    browser: Browser,
    tab: Arc<Tab>,
    viewport: Viewport,
}

impl CdpSurface {
    /// Clip covering the whole scrollable document, in CSS pixels.
    fn document_clip(&self) -> Result<Page::Viewport> {
        let eval = self
            .tab
            .evaluate(
                "JSON.stringify([document.documentElement.scrollWidth, document.documentElement.scrollHeight])",
                false,
            )
            .map_err(|e| Error::CaptureFailure(format!("Failed to measure document: {}", e)))?;

        let raw = eval
            .value
            .as_ref()
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::CaptureFailure("No value returned from document measurement".into()))?;
        let [_, height]: [f64; 2] = serde_json::from_str(raw)
            .map_err(|e| Error::CaptureFailure(format!("Unexpected document size '{}': {}", raw, e)))?;

        Ok(Page::Viewport {
            x: 0.0,
            y: 0.0,
            width: self.viewport.width as f64,
            height: height.max(self.viewport.height as f64),
            scale: 1.0,
        })
    }
}

impl Surface for CdpSurface {
    fn set_user_agent(&mut self, user_agent: &str) -> Result<()> {
        self.tab
            .set_user_agent(user_agent, None, None)
            .map_err(|e| Error::CaptureFailure(format!("Failed to set user agent: {}", e)))
    }

    fn load(&mut self, address: &str) -> Result<LoadSignal> {
        self.tab
            .navigate_to(address)
            .map_err(|e| Error::LoadFailure(format!("Navigation to {} failed: {}", address, e)))?;

        // The driver only offers a blocking wait; park it on a helper thread
        // and hand completion back through the signal.
        let (notifier, signal) = LoadSignal::channel();
        let tab = Arc::clone(&self.tab);
        std::thread::Builder::new()
            .name("uri2png-load".into())
            .spawn(move || match tab.wait_until_navigated() {
                Ok(_) => notifier.complete(),
                Err(e) => notifier.fail(Error::LoadFailure(format!(
                    "Wait for navigation failed: {}",
                    e
                ))),
            })
            .map_err(|e| Error::CaptureFailure(format!("Failed to spawn load watcher: {}", e)))?;

        Ok(signal)
    }

    fn extract_bitmap(&mut self, full_page: bool) -> Result<Bitmap> {
        let png = if full_page {
            // The tab helper never asks Chrome to paint beyond the viewport
            let clip = self.document_clip()?;
            let shot = self
                .tab
                .call_method(full_page_screenshot(clip))
                .map_err(|e| Error::CaptureFailure(format!("Screenshot failed: {}", e)))?;
            base64::engine::general_purpose::STANDARD
                .decode(shot.data)
                .map_err(|e| Error::CaptureFailure(format!("Invalid screenshot payload: {}", e)))?
        } else {
            self.tab
                .capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, None, true)
                .map_err(|e| Error::CaptureFailure(format!("Screenshot failed: {}", e)))?
        };

        output::decode_png(&png)
    }

    fn release(self) -> Result<()> {
        let closed = self.tab.close(false);
        // Dropping the browser terminates the Chrome process
        drop(self.tab);
        drop(self.browser);
        closed
            .map(|_| ())
            .map_err(|e| Error::CaptureFailure(format!("Failed to close tab: {}", e)))
    }
}
