//! Scripted inference engine

use annoforge_core::inference::{InferenceEngine, InferenceError};
use annoforge_core::models::PromptType;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Returns canned outputs per image file name
///
/// Unscripted images get `"caption for <file name>"`. Tracks call counts and
/// the highest number of concurrent calls.
#[derive(Default)]
pub struct ScriptedEngine {
    script: Mutex<HashMap<String, Result<String, InferenceError>>>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    seen: Mutex<Vec<(String, String)>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn respond(self, file_name: &str, text: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert(file_name.to_string(), Ok(text.to_string()));
        self
    }

    pub fn fail(self, file_name: &str, error: InferenceError) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert(file_name.to_string(), Err(error));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// `(file name, prompt template)` per call, in call order
    pub fn seen(&self) -> Vec<(String, String)> {
        self.seen.lock().unwrap().clone()
    }
}

impl InferenceEngine for ScriptedEngine {
    fn infer(&self, image_path: &Path, prompt_type: &PromptType) -> Result<String, InferenceError> {
        let name = image_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((name.clone(), prompt_type.template.clone()));

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let result = self
            .script
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .unwrap_or_else(|| Ok(format!("caption for {}", name)));

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
