//! # Browser Page Driver Interface
//!
//! The dialer never talks to a browser directly. Whatever automation stack
//! controls the telephony page (CDP, WebDriver, an embedded webview) is
//! adapted to this trait and handed to the call runner.
//!
//! ## Capabilities consumed:
//! - **Dialing**: start an outbound call for a number
//! - **DOM queries**: visibility of a selector or of visible text
//! - **Input**: clicks by selector, by text, or at a point; keyboard presses
//! - **Scripts**: inject the capture script, evaluate teardown snippets
//! - **Diagnostics**: screenshots and page reloads

use crate::error::AppResult;
use async_trait::async_trait;

/// A single controlled telephony page.
///
/// Implementations must be cheap to share (`Arc<dyn PageDriver>`) and safe to
/// call from the monitor's polling task and the hang-up path concurrently.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Start dialing `phone_number` in the telephony UI.
    async fn dial(&self, phone_number: &str) -> AppResult<()>;

    /// Whether an element matching `selector` is present and visible.
    async fn is_visible(&self, selector: &str) -> AppResult<bool>;

    /// Whether an element with the given visible text is present.
    async fn is_text_visible(&self, text: &str) -> AppResult<bool>;

    /// Click the first visible element matching `selector`.
    /// Returns `false` when nothing matched.
    async fn click(&self, selector: &str) -> AppResult<bool>;

    /// Click the first visible element whose text matches `text`.
    async fn click_text(&self, text: &str) -> AppResult<bool>;

    async fn press_key(&self, key: &str) -> AppResult<()>;

    async fn click_at(&self, x: i32, y: i32) -> AppResult<()>;

    async fn reload(&self) -> AppResult<()>;

    /// Inject a script that keeps running in the page (the capture relay).
    async fn inject_script(&self, source: &str) -> AppResult<()>;

    /// Evaluate a one-off expression and return its JSON result.
    async fn evaluate(&self, script: &str) -> AppResult<serde_json::Value>;

    /// PNG screenshot of the current page.
    async fn screenshot(&self) -> AppResult<Vec<u8>>;
}
