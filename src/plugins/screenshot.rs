use crate::config::{create_browser_config, ScreenshotSettings, Viewport};
use crate::error::AnalysisError;
use crate::model::{ImageBlob, ImageFormat, PageData};
use crate::plugins::image_analysis::encode_png;
use crate::plugins::Screenshotter;
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use futures::StreamExt;
use image::{DynamicImage, Rgb, RgbImage};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

enum SessionState {
    NotStarted,
    Running {
        browser: Arc<Browser>,
        handler: JoinHandle<()>,
    },
    /// Launch failed once; every later call renders a placeholder.
    Unavailable,
}

/// Renders pages in one shared headless Chrome.
///
/// The browser is launched on first use and relaunched if its DevTools
/// handler dies. When no browser can be launched at all, screenshots fall
/// back to placeholder rendering so the analysis still produces an image.
pub struct ChromeScreenshotter {
    settings: ScreenshotSettings,
    session: Mutex<SessionState>,
    fallback: PlaceholderScreenshotter,
}

impl ChromeScreenshotter {
    pub fn new(settings: ScreenshotSettings) -> Self {
        let fallback = PlaceholderScreenshotter::new(settings.viewport.clone());
        Self {
            settings,
            session: Mutex::new(SessionState::NotStarted),
            fallback,
        }
    }

    async fn browser(&self) -> Option<Arc<Browser>> {
        let mut session = self.session.lock().await;

        if let SessionState::Running { browser, handler } = &*session {
            if !handler.is_finished() {
                return Some(Arc::clone(browser));
            }
            warn!("Browser handler exited, relaunching");
            *session = SessionState::NotStarted;
        }

        if matches!(*session, SessionState::Unavailable) {
            return None;
        }

        match self.launch().await {
            Ok((browser, handler)) => {
                let browser = Arc::new(browser);
                *session = SessionState::Running {
                    browser: Arc::clone(&browser),
                    handler,
                };
                Some(browser)
            }
            Err(e) => {
                warn!("Cannot launch browser, using placeholder screenshots: {}", e);
                *session = SessionState::Unavailable;
                None
            }
        }
    }

    async fn launch(&self) -> Result<(Browser, JoinHandle<()>), String> {
        let config = create_browser_config(&self.settings)?;
        let (browser, mut handler) = Browser::launch(config).await.map_err(|e| e.to_string())?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler error: {}", e);
                }
            }
            info!("Browser handler stream ended");
        });

        info!(
            "Launched headless browser ({}x{})",
            self.settings.viewport.width, self.settings.viewport.height
        );
        Ok((browser, handler_task))
    }

    async fn capture(&self, browser: &Browser, url: &str, limit: Duration) -> Result<ImageBlob, AnalysisError> {
        let started = Instant::now();
        let page = timeout(limit, browser.new_page(url))
            .await
            .map_err(|_| AnalysisError::timeout(limit))?
            .map_err(|e| AnalysisError::failed(format!("cannot open page: {e}")))?;

        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .build();
        let shot = timeout(limit.saturating_sub(started.elapsed()), page.screenshot(params)).await;
        let _ = page.close().await;

        let data = shot
            .map_err(|_| AnalysisError::timeout(limit))?
            .map_err(|e| AnalysisError::failed(format!("capture failed: {e}")))?;

        let (width, height) = image::io::Reader::new(Cursor::new(&data))
            .with_guessed_format()
            .map_err(AnalysisError::failed)?
            .into_dimensions()
            .map_err(AnalysisError::failed)?;

        Ok(ImageBlob {
            format: ImageFormat::Png,
            width,
            height,
            data,
        })
    }
}

#[async_trait]
impl Screenshotter for ChromeScreenshotter {
    async fn screenshot(&self, page: &PageData, limit: Duration) -> Result<ImageBlob, AnalysisError> {
        match self.browser().await {
            Some(browser) => self.capture(&browser, &page.final_url, limit).await,
            None => self.fallback.screenshot(page, limit).await,
        }
    }
}

impl Drop for ChromeScreenshotter {
    fn drop(&mut self) {
        if let SessionState::Running { handler, .. } = self.session.get_mut() {
            handler.abort();
        }
    }
}

/// Draws a deterministic stand-in image from the page's URL and structure.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderScreenshotter {
    viewport: Viewport,
}

impl PlaceholderScreenshotter {
    pub fn new(viewport: Viewport) -> Self {
        Self { viewport }
    }

    pub fn render(viewport: &Viewport, page: &PageData) -> Result<ImageBlob, AnalysisError> {
        let width = viewport.width.max(1);
        let height = viewport.height.max(1);
        let mut canvas = RgbImage::from_pixel(width, height, Rgb([32, 33, 36]));

        let accent = accent_color(&page.final_url);
        let header = (height / 12).max(1);
        for y in 0..header {
            for x in 0..width {
                canvas.put_pixel(x, y, Rgb(accent));
            }
        }

        // One light bar per block element, as a rough sketch of page length.
        let html = page.html().to_ascii_lowercase();
        let blocks = ["<p", "<h1", "<h2", "<h3", "<li", "<img"]
            .iter()
            .map(|tag| html.matches(tag).count())
            .sum::<usize>();
        let row = (height / 40).max(2);
        let margin = width / 16;
        let mut y = header + row;
        for i in 0..blocks {
            if y + row > height {
                break;
            }
            let bar_width = (width - 2 * margin) * (60 + (i as u32 * 37) % 40) / 100;
            for dy in 0..row / 2 {
                for x in margin..margin + bar_width {
                    canvas.put_pixel(x, y + dy, Rgb([189, 193, 198]));
                }
            }
            y += row;
        }

        encode_png(&DynamicImage::ImageRgb8(canvas))
    }
}

#[async_trait]
impl Screenshotter for PlaceholderScreenshotter {
    async fn screenshot(&self, page: &PageData, limit: Duration) -> Result<ImageBlob, AnalysisError> {
        let viewport = self.viewport.clone();
        let page = page.clone();
        timeout(
            limit,
            tokio::task::spawn_blocking(move || Self::render(&viewport, &page)),
        )
        .await
        .map_err(|_| AnalysisError::timeout(limit))?
        .map_err(AnalysisError::failed)?
    }
}

fn accent_color(url: &str) -> [u8; 3] {
    let mut hasher = DefaultHasher::new();
    url.hash(&mut hasher);
    let [r, g, b, ..] = hasher.finish().to_be_bytes();
    // Keep the bar bright enough to stand out from the background
    [r | 0x40, g | 0x40, b | 0x40]
}
