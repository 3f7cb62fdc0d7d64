use std::future::Future;
use std::pin::Pin;

use anyhow::Result;

pub mod tinyllama;

pub use tinyllama::TinyLlamaService;

/// Seam between the HTTP handler and the model backend. `TinyLlamaService`
/// is the only production implementation; tests drive the router with fakes
/// so failure paths can be exercised without weights on disk.
pub trait Generate: Send + Sync {
    fn generate<'a>(
        &'a self,
        prompt: &'a str,
        params: &'a GenerationParams,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;
}

/// Decoding knobs for a single generation call. Defaults mirror the serving
/// configuration: sampling with temperature 0.8 / top-p 0.95, light
/// repetition penalty, 200 new tokens cap.
#[derive(Clone, Copy, Debug)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub repeat_penalty: f32,
    /// Trailing window the repetition penalty is applied over.
    pub repeat_last_n: usize,
    /// Fixed sampling seed; `None` seeds from the wall clock.
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 200,
            temperature: 0.8,
            top_p: 0.95,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            seed: None,
        }
    }
}
