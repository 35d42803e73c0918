//! Chromium-backed render engine
//!
//! Drives a headless Chromium process over CDP: one process per pooled
//! instance, each with an isolated profile directory, rendering documents
//! via `Page.printToPDF`. Liveness is probed with the `Browser.getVersion`
//! round trip, the cheapest CDP call that exercises the websocket.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::fetcher::{BrowserFetcher, BrowserFetcherOptions};
use chromiumoxide_cdp::cdp::browser_protocol::page::PrintToPdfParams;
use futures::StreamExt;
use std::borrow::Cow;
use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, trace, warn};

use super::profile::{EngineProfile, remove_profile_dir};
use super::{EngineError, EngineLauncher, RenderEngine, RenderOptions, RenderOutput};

/// How long a liveness probe may take before the instance counts as dead
const LIVENESS_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-CDP-request timeout for the underlying websocket
const CDP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Find a Chrome/Chromium executable on this system
///
/// The `CHROMIUM_PATH` environment variable overrides discovery; otherwise
/// common installation paths are probed, then `which` on unix systems.
pub fn find_browser_executable() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CHROMIUM_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            info!(path = %path.display(), "using browser from CHROMIUM_PATH");
            return Ok(path);
        }
        warn!(
            path = %path.display(),
            "CHROMIUM_PATH points to a non-existent file"
        );
    }

    let paths: Vec<PathBuf> = if cfg!(target_os = "macos") {
        vec![
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome".into(),
            "/Applications/Chromium.app/Contents/MacOS/Chromium".into(),
            "/opt/homebrew/bin/chromium".into(),
        ]
    } else if cfg!(target_os = "windows") {
        vec![
            r"C:\Program Files\Google\Chrome\Application\chrome.exe".into(),
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe".into(),
            r"C:\Program Files\Chromium\Application\chrome.exe".into(),
        ]
    } else {
        vec![
            "/usr/bin/google-chrome".into(),
            "/usr/bin/google-chrome-stable".into(),
            "/usr/bin/chromium".into(),
            "/usr/bin/chromium-browser".into(),
            "/snap/bin/chromium".into(),
            "/opt/google/chrome/chrome".into(),
        ]
    };

    for path in paths {
        if path.exists() {
            debug!(path = %path.display(), "found browser executable");
            return Ok(path);
        }
    }

    if !cfg!(target_os = "windows") {
        for cmd in &["chromium", "chromium-browser", "google-chrome", "chrome"] {
            if let Ok(output) = Command::new("which").arg(cmd).output()
                && output.status.success()
            {
                let found = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !found.is_empty() {
                    debug!(path = %found, "found browser via which");
                    return Ok(PathBuf::from(found));
                }
            }
        }
    }

    Err(anyhow::anyhow!("no Chrome/Chromium executable found"))
}

/// Download a managed Chromium build into the local cache
async fn download_managed_browser() -> Result<PathBuf> {
    let cache_dir = dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("platen")
        .join("chromium");
    std::fs::create_dir_all(&cache_dir).context("failed to create browser cache directory")?;

    info!(cache = %cache_dir.display(), "downloading managed Chromium build");
    let fetcher = BrowserFetcher::new(
        BrowserFetcherOptions::builder()
            .with_path(&cache_dir)
            .build()
            .context("failed to build fetcher options")?,
    );
    let revision = fetcher.fetch().await.context("failed to fetch browser")?;
    info!(path = %revision.folder_path.display(), "downloaded managed Chromium");
    Ok(revision.executable_path)
}

/// Launcher for Chromium engine instances
#[derive(Debug, Clone, Default)]
pub struct ChromiumLauncher {
    headless: bool,
    executable: Option<PathBuf>,
}

impl ChromiumLauncher {
    #[must_use]
    pub fn new(headless: bool, executable: Option<PathBuf>) -> Self {
        Self {
            headless,
            executable,
        }
    }

    async fn launch_inner(&self) -> Result<ChromiumEngine> {
        let chrome_path = match &self.executable {
            Some(path) => path.clone(),
            None => match find_browser_executable() {
                Ok(path) => path,
                Err(_) => download_managed_browser().await?,
            },
        };

        let profile = EngineProfile::create("platen_chromium")?;
        let user_data_dir = profile.into_path();

        let mut config_builder = BrowserConfigBuilder::default()
            .request_timeout(CDP_REQUEST_TIMEOUT)
            .window_size(1280, 1024)
            .user_data_dir(user_data_dir.clone())
            .chrome_executable(chrome_path);

        if self.headless {
            config_builder = config_builder.headless_mode(HeadlessMode::default());
        } else {
            config_builder = config_builder.with_head();
        }

        // Print-service profile: no first-run chrome, no background chatter,
        // no GPU requirements inside containers.
        config_builder = config_builder
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--no-sandbox")
            .arg("--disable-setuid-sandbox")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .arg("--disable-background-timer-throttling")
            .arg("--disable-breakpad")
            .arg("--disable-hang-monitor")
            .arg("--disable-notifications")
            .arg("--disable-print-preview")
            .arg("--disable-software-rasterizer")
            .arg("--hide-scrollbars")
            .arg("--mute-audio")
            .arg("--metrics-recording-only")
            .arg("--password-store=basic")
            .arg("--use-mock-keychain");

        let browser_config = config_builder
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .context("failed to launch browser")?;

        // The CDP event stream must be drained for the connection to make
        // progress; the task is aborted when the engine is dropped.
        let handler_task = task::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    let message = e.to_string();
                    // Chrome emits CDP events chromiumoxide does not model;
                    // those deserialization misses are not connection faults.
                    let benign = message
                        .contains("data did not match any variant of untagged enum Message")
                        || message.contains("Failed to deserialize WS response");
                    if benign {
                        trace!(error = %message, "suppressed benign CDP event error");
                    } else {
                        warn!(error = %message, "browser handler error");
                    }
                }
            }
            debug!("browser handler task completed");
        });

        Ok(ChromiumEngine {
            browser,
            handler: handler_task,
            user_data_dir: Some(user_data_dir),
        })
    }
}

#[async_trait]
impl EngineLauncher for ChromiumLauncher {
    async fn launch(&self) -> Result<Box<dyn RenderEngine>, EngineError> {
        let engine = self
            .launch_inner()
            .await
            .map_err(|e| EngineError::Launch(format!("{e:#}")))?;
        Ok(Box::new(engine))
    }
}

/// One running Chromium process
#[derive(Debug)]
pub struct ChromiumEngine {
    browser: Browser,
    handler: JoinHandle<()>,
    user_data_dir: Option<PathBuf>,
}

impl ChromiumEngine {
    fn pdf_params(options: &RenderOptions) -> PrintToPdfParams {
        let (width_in, height_in) = options.format.dimensions();
        PrintToPdfParams {
            landscape: Some(options.landscape),
            print_background: Some(options.print_background),
            scale: Some(options.scale),
            paper_width: Some(width_in),
            paper_height: Some(height_in),
            margin_top: Some(options.margin_in),
            margin_bottom: Some(options.margin_in),
            margin_left: Some(options.margin_in),
            margin_right: Some(options.margin_in),
            page_ranges: options.page_ranges.clone(),
            prefer_css_page_size: Some(options.prefer_css_page_size),
            ..Default::default()
        }
    }

    /// Classify a failed render: a dead process is a crash, anything else
    /// leaves the instance usable.
    async fn classify_failure(&self, message: String) -> EngineError {
        if self.is_alive().await {
            EngineError::Render(message)
        } else {
            EngineError::Crashed(message)
        }
    }
}

/// Splice a `<base href>` into the document so relative references resolve
fn apply_base_url<'a>(document: &'a str, base_url: Option<&str>) -> Cow<'a, str> {
    let Some(base) = base_url else {
        return Cow::Borrowed(document);
    };
    let tag = format!("<base href=\"{base}\">");
    if let Some(pos) = document.find("<head>") {
        let insert_at = pos + "<head>".len();
        let mut patched = String::with_capacity(document.len() + tag.len());
        patched.push_str(&document[..insert_at]);
        patched.push_str(&tag);
        patched.push_str(&document[insert_at..]);
        Cow::Owned(patched)
    } else {
        Cow::Owned(format!("{tag}{document}"))
    }
}

#[async_trait]
impl RenderEngine for ChromiumEngine {
    async fn render(
        &self,
        document: &str,
        options: &RenderOptions,
    ) -> Result<RenderOutput, EngineError> {
        let started = Instant::now();
        let html = apply_base_url(document, options.base_url.as_deref());

        let page = match self.browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => return Err(self.classify_failure(format!("new page: {e}")).await),
        };

        let result = async {
            page.set_content(html.as_ref())
                .await
                .map_err(|e| format!("set content: {e}"))?;
            page.wait_for_navigation()
                .await
                .map_err(|e| format!("wait for load: {e}"))?;
            page.pdf(Self::pdf_params(options))
                .await
                .map_err(|e| format!("print to pdf: {e}"))
        }
        .await;

        // Close the page on every exit path; a dead process makes this a no-op.
        if let Err(e) = page.close().await {
            debug!(error = %e, "failed to close render page");
        }

        match result {
            Ok(data) => Ok(RenderOutput {
                data,
                timing_ms: started.elapsed().as_millis() as u64,
            }),
            Err(message) => Err(self.classify_failure(message).await),
        }
    }

    async fn is_alive(&self) -> bool {
        matches!(
            tokio::time::timeout(LIVENESS_PROBE_TIMEOUT, self.browser.version()).await,
            Ok(Ok(_))
        )
    }

    async fn close(&mut self) {
        if let Err(e) = self.browser.close().await {
            debug!(error = %e, "browser close failed, process may already be gone");
        }
        if let Err(e) = self.browser.wait().await {
            debug!(error = %e, "waiting for browser exit failed");
        }
        self.handler.abort();
        if let Some(dir) = self.user_data_dir.take() {
            remove_profile_dir(&dir);
        }
    }
}

impl Drop for ChromiumEngine {
    fn drop(&mut self) {
        // Browser::drop kills the process; the handler task and profile dir
        // still need explicit teardown when close() was never reached.
        self.handler.abort();
        if let Some(dir) = self.user_data_dir.take() {
            remove_profile_dir(&dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_spliced_into_head() {
        let html = "<html><head><title>t</title></head><body></body></html>";
        let patched = apply_base_url(html, Some("https://example.com/assets/"));
        assert!(
            patched
                .find("<head><base href=\"https://example.com/assets/\">")
                .is_some()
        );
    }

    #[test]
    fn base_url_prepended_without_head() {
        let html = "<p>bare fragment</p>";
        let patched = apply_base_url(html, Some("https://example.com/"));
        assert!(patched.starts_with("<base href=\"https://example.com/\">"));
    }

    #[test]
    fn no_base_url_borrows_unchanged() {
        let html = "<p>doc</p>";
        assert!(matches!(apply_base_url(html, None), Cow::Borrowed(_)));
    }
}
