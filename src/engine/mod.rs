//! Rendering engine abstraction
//!
//! The pool treats the engine as an opaque capability: render a document,
//! report liveness, terminate. The production implementation drives headless
//! Chromium over CDP ([`chromium`]); tests substitute a scripted mock behind
//! the same traits.

pub mod chromium;
pub mod profile;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use chromium::{ChromiumEngine, ChromiumLauncher};
pub use profile::EngineProfile;

/// MIME type of rendered output
pub const OUTPUT_MIME: &str = "application/pdf";

/// Paper size for paginated output
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageFormat {
    A3,
    A4,
    A5,
    Letter,
    Legal,
    Tabloid,
    /// Explicit dimensions in inches
    Custom { width_in: f64, height_in: f64 },
}

impl PageFormat {
    /// Paper dimensions in inches, (width, height)
    pub fn dimensions(&self) -> (f64, f64) {
        match self {
            PageFormat::A3 => (11.69, 16.54),
            PageFormat::A4 => (8.27, 11.69),
            PageFormat::A5 => (5.83, 8.27),
            PageFormat::Letter => (8.5, 11.0),
            PageFormat::Legal => (8.5, 14.0),
            PageFormat::Tabloid => (11.0, 17.0),
            PageFormat::Custom {
                width_in,
                height_in,
            } => (*width_in, *height_in),
        }
    }
}

impl Default for PageFormat {
    fn default() -> Self {
        PageFormat::A4
    }
}

/// Options for a single render call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    /// Paper size
    pub format: PageFormat,
    /// Rotate output to landscape orientation
    pub landscape: bool,
    /// Uniform page margin in inches
    pub margin_in: f64,
    /// Print scale factor (valid range 0.1..=2.0)
    pub scale: f64,
    /// Paint CSS backgrounds into the output
    pub print_background: bool,
    /// Page selection, e.g. "1-3,5"; empty renders all pages
    pub page_ranges: Option<String>,
    /// Honor any CSS `@page` size over `format`
    pub prefer_css_page_size: bool,
    /// Base URL resolved against relative references in the document
    pub base_url: Option<String>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            format: PageFormat::default(),
            landscape: false,
            margin_in: 0.4,
            scale: 1.0,
            print_background: true,
            page_ranges: None,
            prefer_css_page_size: false,
            base_url: None,
        }
    }
}

/// Output of a completed render
#[derive(Debug, Clone)]
pub struct RenderOutput {
    /// Rendered document bytes (PDF)
    pub data: Vec<u8>,
    /// Wall-clock render duration in milliseconds
    pub timing_ms: u64,
}

/// Errors produced by an engine or its launcher
#[derive(Debug, Error)]
pub enum EngineError {
    /// The render itself failed; the engine process is still usable
    #[error("render failed: {0}")]
    Render(String),

    /// The engine process died or stopped responding
    #[error("engine crashed: {0}")]
    Crashed(String),

    /// The engine process could not be started
    #[error("engine launch failed: {0}")]
    Launch(String),
}

impl EngineError {
    /// Whether the instance backing this error must be evicted
    #[must_use]
    pub fn is_crash(&self) -> bool {
        matches!(self, EngineError::Crashed(_))
    }
}

/// One running rendering-engine process
///
/// Instances are loaned out by the pool one caller at a time; the trait
/// therefore never needs interior locking.
#[async_trait]
pub trait RenderEngine: Send + Sync {
    /// Render a document to paginated output
    async fn render(
        &self,
        document: &str,
        options: &RenderOptions,
    ) -> Result<RenderOutput, EngineError>;

    /// Probe whether the engine process is still responsive
    async fn is_alive(&self) -> bool;

    /// Terminate the engine process and release its resources
    async fn close(&mut self);
}

/// Factory for engine instances
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    /// Start a fresh engine process, ready to serve renders
    async fn launch(&self) -> Result<Box<dyn RenderEngine>, EngineError>;
}
