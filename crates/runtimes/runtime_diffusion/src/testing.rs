//! In-process stand-in for the diffusion engine, for tests.
//!
//! The mock records every lifecycle call and every generation (parameters
//! plus start/end instants) in a shared [`MockEngineState`].

use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use zimage_runtime_api::{
    AttentionBackend, DeviceProfile, DiffusionEngine, EngineImage, EngineLoader, EngineParams,
};

#[derive(Default)]
struct Inner {
    loads: usize,
    ops: Vec<&'static str>,
    calls: Vec<EngineParams>,
    spans: Vec<(Instant, Instant)>,
    started: usize,
    failure: Option<String>,
    truncate: bool,
}

#[derive(Clone, Default)]
pub struct MockEngineState {
    inner: Arc<Mutex<Inner>>,
    delay: Duration,
}

impl MockEngineState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each generation sleeps for `delay`
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn fail_with(&self, message: &str) {
        self.inner.lock().unwrap().failure = Some(message.to_string());
    }

    /// Return one pixel short of a full image
    pub fn truncate_output(&self) {
        self.inner.lock().unwrap().truncate = true;
    }

    pub fn loads(&self) -> usize {
        self.inner.lock().unwrap().loads
    }

    pub fn ops(&self) -> Vec<&'static str> {
        self.inner.lock().unwrap().ops.clone()
    }

    pub fn calls(&self) -> Vec<EngineParams> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// (start, end) of every finished generation, in completion order
    pub fn spans(&self) -> Vec<(Instant, Instant)> {
        self.inner.lock().unwrap().spans.clone()
    }

    /// Wait until `count` generations have entered the engine
    pub async fn wait_started(&self, count: usize) {
        while self.inner.lock().unwrap().started < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

pub struct MockEngine {
    state: MockEngineState,
    sdpa: bool,
}

impl DiffusionEngine for MockEngine {
    fn upcast_decoder(&mut self) -> Result<()> {
        self.state.inner.lock().unwrap().ops.push("upcast_decoder");
        Ok(())
    }

    fn set_attention_backend(&mut self, backend: AttentionBackend) -> Result<()> {
        self.state
            .inner
            .lock()
            .unwrap()
            .ops
            .push("set_attention_backend");
        if backend == AttentionBackend::Sdpa && !self.sdpa {
            anyhow::bail!("sdpa not available");
        }
        Ok(())
    }

    fn to_device(&mut self, _profile: &DeviceProfile) -> Result<()> {
        self.state.inner.lock().unwrap().ops.push("to_device");
        Ok(())
    }

    fn generate(&self, params: &EngineParams) -> Result<EngineImage> {
        let start = Instant::now();
        let (failure, truncate) = {
            let mut inner = self.state.inner.lock().unwrap();
            inner.started += 1;
            inner.calls.push(params.clone());
            (inner.failure.clone(), inner.truncate)
        };

        std::thread::sleep(self.state.delay);

        let end = Instant::now();
        self.state.inner.lock().unwrap().spans.push((start, end));

        if let Some(message) = failure {
            anyhow::bail!(message);
        }

        let mut len = (params.width * params.height * 3) as usize;
        if truncate {
            len -= 3;
        }
        Ok(EngineImage {
            pixels: vec![(params.seed % 256) as u8; len],
            width: params.width,
            height: params.height,
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}

pub struct MockLoader {
    state: MockEngineState,
    fail: bool,
    sdpa: bool,
    delay: Duration,
}

impl MockLoader {
    pub fn new(state: MockEngineState) -> Self {
        Self {
            state,
            fail: false,
            sdpa: true,
            delay: Duration::ZERO,
        }
    }

    /// Loader whose `load` always errors
    pub fn failing(state: MockEngineState) -> Self {
        Self {
            fail: true,
            ..Self::new(state)
        }
    }

    /// `load` sleeps for `delay` before returning
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Engine rejects the SDPA attention backend
    pub fn without_sdpa(mut self) -> Self {
        self.sdpa = false;
        self
    }
}

impl EngineLoader for MockLoader {
    fn load(&self, model_id: &str, _profile: &DeviceProfile) -> Result<Box<dyn DiffusionEngine>> {
        self.state.inner.lock().unwrap().loads += 1;
        std::thread::sleep(self.delay);
        if self.fail {
            anyhow::bail!("weights for {} not found", model_id);
        }
        Ok(Box::new(MockEngine {
            state: self.state.clone(),
            sdpa: self.sdpa,
        }))
    }
}
