use clap::Parser;
use std::path::PathBuf;
use uri2png::cdp::{CdpEngine, LaunchConfig};
use uri2png::{CaptureReport, CaptureRequest, Viewport};

#[derive(Debug, Parser)]
#[command(name = "uri2png", about = "uri2png | webpage screenshot", version)]
struct Cli {
    /// Target uri to screenshot
    uri: String,

    /// Filename or filepath of the PNG to write
    filepath: PathBuf,

    /// Viewport width and height of the browser in pixels
    #[arg(short = 'v', long, default_value_t = 1280)]
    viewport: u32,

    /// Milliseconds to wait after the page load event
    #[arg(short = 'd', long, default_value_t = 1000)]
    delay: u64,

    /// Set the browser user-agent
    #[arg(short = 'u', long)]
    user_agent: Option<String>,

    /// Viewport width, overriding --viewport
    #[arg(long)]
    width: Option<u32>,

    /// Viewport height, overriding --viewport
    #[arg(long)]
    height: Option<u32>,

    /// Derive the height from the width, e.g. 16:9 or 4:3
    #[arg(short = 'a', long)]
    aspect_ratio: Option<String>,

    /// Capture the whole scrollable page
    #[arg(short = 'f', long)]
    full_page: bool,

    /// Device scale factor
    #[arg(short = 's', long, default_value_t = 1.0)]
    scale: f64,

    /// Give up waiting for the page load after this many milliseconds
    #[arg(short = 't', long)]
    timeout: Option<u64>,

    /// Path to the Chrome/Chromium binary
    #[arg(long)]
    chrome_path: Option<PathBuf>,

    /// Disable the Chrome sandbox (needed in some containers)
    #[arg(long)]
    no_sandbox: bool,

    /// Print the capture report as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn request(&self) -> uri2png::Result<CaptureRequest> {
        let mut viewport = Viewport::square(self.viewport);
        if let Some(width) = self.width {
            viewport.width = width;
        }
        if let Some(height) = self.height {
            viewport.height = height;
        }
        if let Some(ratio) = &self.aspect_ratio {
            viewport = viewport.with_aspect_ratio(ratio)?;
        }

        let request = CaptureRequest {
            viewport,
            post_load_delay_ms: self.delay,
            user_agent: self.user_agent.clone(),
            load_timeout_ms: self.timeout,
            full_page: self.full_page,
            device_scale_factor: self.scale,
            ..CaptureRequest::new(self.uri.clone(), self.filepath.clone())
        };
        request.validate()?;
        Ok(request)
    }

    fn launch_config(&self) -> LaunchConfig {
        LaunchConfig {
            chrome_path: self.chrome_path.clone(),
            sandbox: !self.no_sandbox,
            ..Default::default()
        }
    }
}

fn run(cli: &Cli) -> uri2png::Result<CaptureReport> {
    let request = cli.request()?;
    uri2png::capture(CdpEngine::new(cli.launch_config()), &request)
}

fn print_report(report: &CaptureReport, json: bool) {
    if json {
        match serde_json::to_string_pretty(report) {
            Ok(s) => println!("{}", s),
            Err(e) => log::warn!("Failed to serialize report: {}", e),
        }
        return;
    }
    println!(
        "{} -> {} ({}x{}, {} bytes, {}ms)",
        report.address, report.output_path, report.width, report.height, report.bytes, report.duration_ms
    );
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(report) => print_report(&report, cli.json),
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("uri2png").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn default_viewport_and_delay() {
        let req = parse(&["https://example.com", "out.png"]).request().unwrap();
        assert_eq!(req.viewport, Viewport::square(1280));
        assert_eq!(req.post_load_delay_ms, 1000);
        assert!(req.user_agent.is_none());
        assert!(req.load_timeout_ms.is_none());
        assert!(!req.full_page);
    }

    #[test]
    fn short_flags() {
        let req = parse(&["https://example.com", "out.png", "-v", "800", "-d", "500", "-u", "Bot/2"])
            .request()
            .unwrap();
        assert_eq!(req.viewport, Viewport::square(800));
        assert_eq!(req.post_load_delay_ms, 500);
        assert_eq!(req.user_agent.as_deref(), Some("Bot/2"));
    }

    #[test]
    fn width_and_height_override_viewport() {
        let req = parse(&["https://example.com", "out.png", "--width", "800", "--height", "600"])
            .request()
            .unwrap();
        assert_eq!(req.viewport, Viewport { width: 800, height: 600 });
    }

    #[test]
    fn aspect_ratio_derives_height() {
        let req = parse(&["https://example.com", "out.png", "-a", "16:9"]).request().unwrap();
        assert_eq!(req.viewport, Viewport { width: 1280, height: 720 });
    }

    #[test]
    fn zero_viewport_is_invalid_input() {
        let err = parse(&["https://example.com", "out.png", "-v", "0"]).request().unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn missing_positionals_rejected() {
        assert!(Cli::try_parse_from(["uri2png", "https://example.com"]).is_err());
    }

    #[test]
    fn sandbox_toggle() {
        assert!(parse(&["a", "b"]).launch_config().sandbox);
        assert!(!parse(&["a", "b", "--no-sandbox"]).launch_config().sandbox);
    }
}
