//! zimage_runtime_diffusion - Diffusion model serving runtime
//!
//! [`DiffusionRuntime`] owns the single loaded model. It loads it once,
//! applies the precision fix-ups, and then runs generations strictly one at a
//! time, in arrival order, with a bounded number of waiting requests.

pub mod device;
mod hub;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod zimage;

use image::RgbImage;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Instant;
use tokio::sync::Semaphore;
use zimage_core::{resolve_seed, Error, GenerationRequest, GenerationResult, Result};
use zimage_runtime_api::{
    AttentionBackend, DeviceProfile, DiffusionEngine, EngineLoader, EngineParams, RuntimeStatus,
};

pub use device::select_device;
pub use hub::resolve_model_path;
pub use zimage::{ZImageLoader, ZImagePipeline};

/// Z-Image-Turbo is guidance-distilled; anything above zero degrades output.
pub const GUIDANCE_SCALE: f32 = 0.0;

pub struct DiffusionRuntime {
    model_id: String,
    profile: DeviceProfile,
    status: Mutex<RuntimeStatus>,
    engine: OnceLock<Arc<dyn DiffusionEngine>>,
    /// Critical section around the engine. Tokio's mutex is FIFO-fair.
    gate: Arc<tokio::sync::Mutex<()>>,
    /// Admission bound: running + waiting requests
    pending: Arc<Semaphore>,
    max_pending: usize,
}

impl DiffusionRuntime {
    pub fn new(model_id: impl Into<String>, profile: DeviceProfile, max_pending: usize) -> Self {
        let max_pending = max_pending.max(1);
        Self {
            model_id: model_id.into(),
            profile,
            status: Mutex::new(RuntimeStatus::Unloaded),
            engine: OnceLock::new(),
            gate: Arc::new(tokio::sync::Mutex::new(())),
            pending: Arc::new(Semaphore::new(max_pending)),
            max_pending,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn profile(&self) -> DeviceProfile {
        self.profile
    }

    pub fn status(&self) -> RuntimeStatus {
        *self.lock_status()
    }

    pub fn is_ready(&self) -> bool {
        self.status() == RuntimeStatus::Ready
    }

    /// Name reported by the engine, once loaded
    pub fn engine_name(&self) -> Option<&str> {
        self.engine.get().map(|engine| engine.name())
    }

    /// Load the model. Only the first call does anything; afterwards the
    /// runtime is either `Ready` or permanently `Failed`.
    pub async fn load(self: &Arc<Self>, loader: Arc<dyn EngineLoader>) -> Result<()> {
        let runtime = Arc::clone(self);
        tokio::task::spawn_blocking(move || runtime.load_blocking(loader.as_ref()))
            .await
            .map_err(|e| Error::ModelLoad(format!("load task failed: {}", e)))?
    }

    /// Synchronous variant of [`DiffusionRuntime::load`]
    pub fn load_blocking(&self, loader: &dyn EngineLoader) -> Result<()> {
        {
            let mut status = self.lock_status();
            if *status != RuntimeStatus::Unloaded {
                return Err(Error::ModelLoad(format!(
                    "model {} cannot be loaded from state {}",
                    self.model_id, *status
                )));
            }
            *status = RuntimeStatus::Loading;
        }

        tracing::info!("Loading model {} on {}", self.model_id, self.profile);
        let start = Instant::now();

        match self.load_engine(loader) {
            Ok(engine) => {
                let _ = self.engine.set(Arc::from(engine));
                *self.lock_status() = RuntimeStatus::Ready;
                tracing::info!(
                    "Model {} loaded in {:.1}s",
                    self.model_id,
                    start.elapsed().as_secs_f64()
                );
                Ok(())
            }
            Err(e) => {
                *self.lock_status() = RuntimeStatus::Failed;
                tracing::error!("Failed to load model {}: {:#}", self.model_id, e);
                Err(Error::ModelLoad(format!("{:#}", e)))
            }
        }
    }

    fn load_engine(&self, loader: &dyn EngineLoader) -> anyhow::Result<Box<dyn DiffusionEngine>> {
        let mut engine = loader.load(&self.model_id, &self.profile)?;

        // bf16 in the VAE decoder produces NaNs; keep that stage in f32
        if self.profile.is_reduced_precision() {
            engine.upcast_decoder()?;
            tracing::info!("VAE decoder upcast to f32");
        }

        let tuned = apply_attention_backend(engine.as_mut(), AttentionBackend::Sdpa);
        tracing::info!("SDPA attention backend applied: {}", tuned);

        engine.to_device(&self.profile)?;
        Ok(engine)
    }

    /// Generate one image.
    ///
    /// Only one generation touches the engine at a time. Once a request is
    /// inside the critical section it runs to completion even if the caller
    /// stops waiting for it.
    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult> {
        request.validate()?;

        let engine = match (self.status(), self.engine.get()) {
            (RuntimeStatus::Ready, Some(engine)) => Arc::clone(engine),
            _ => return Err(Error::ModelNotReady),
        };

        let permit = Arc::clone(&self.pending)
            .try_acquire_owned()
            .map_err(|_| Error::QueueFull(self.max_pending))?;

        let seed = resolve_seed(request.seed)?;
        let params = EngineParams {
            negative_prompt: request.negative_prompt().map(str::to_string),
            prompt: request.prompt,
            width: request.width,
            height: request.height,
            steps: request.steps,
            guidance_scale: GUIDANCE_SCALE,
            seed,
            generator_host: self.profile.generator_host(),
        };

        let guard = Arc::clone(&self.gate).lock_owned().await;
        tracing::info!(
            "Generating {}x{} in {} steps (seed {})",
            params.width,
            params.height,
            params.steps,
            seed
        );

        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let _guard = guard;
            let start = Instant::now();
            let output = engine.generate(&params);
            (output, start.elapsed().as_secs_f64(), params)
        });

        let (output, elapsed_seconds, params) = task
            .await
            .map_err(|e| Error::Inference(format!("generation task failed: {}", e)))?;

        let output = output.map_err(|e| {
            tracing::error!("Inference failed: {:#}", e);
            Error::Inference(format!("{:#}", e))
        })?;

        if (output.width, output.height) != (params.width, params.height) {
            return Err(Error::Inference(format!(
                "engine returned {}x{}, expected {}x{}",
                output.width, output.height, params.width, params.height
            )));
        }
        let image = RgbImage::from_raw(output.width, output.height, output.pixels)
            .ok_or_else(|| Error::Inference("engine returned a truncated pixel buffer".into()))?;

        tracing::info!("Generated in {:.1}s", elapsed_seconds);

        Ok(GenerationResult {
            image,
            seed_used: seed,
            elapsed_seconds,
        })
    }

    fn lock_status(&self) -> MutexGuard<'_, RuntimeStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Best-effort kernel selection: reports whether it took, never fails.
fn apply_attention_backend(engine: &mut dyn DiffusionEngine, backend: AttentionBackend) -> bool {
    match engine.set_attention_backend(backend) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!("Attention backend {:?} unavailable: {:#}", backend, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockEngineState, MockLoader};
    use std::time::Duration;
    use zimage_core::config::GenerationConfig;
    use zimage_core::ArtifactWriter;
    use zimage_runtime_api::{Backend, GeneratorHost, Precision};

    const CPU: DeviceProfile = DeviceProfile {
        backend: Backend::Cpu,
        precision: Precision::F32,
    };
    const METAL: DeviceProfile = DeviceProfile {
        backend: Backend::Metal,
        precision: Precision::Bf16,
    };

    fn request(seed: Option<u64>) -> GenerationRequest {
        GenerationRequest {
            seed,
            ..GenerationRequest::new("sunset over mountains", &GenerationConfig::default())
        }
    }

    async fn ready_runtime(
        profile: DeviceProfile,
        max_pending: usize,
        loader: MockLoader,
    ) -> Arc<DiffusionRuntime> {
        let runtime = Arc::new(DiffusionRuntime::new("test/model", profile, max_pending));
        runtime.load(Arc::new(loader)).await.unwrap();
        runtime
    }

    #[tokio::test]
    async fn explicit_seed_is_used_verbatim() {
        let state = MockEngineState::new();
        let runtime = ready_runtime(CPU, 4, MockLoader::new(state.clone())).await;

        let first = runtime.generate(request(Some(42))).await.unwrap();
        let second = runtime.generate(request(Some(42))).await.unwrap();

        assert_eq!(first.seed_used, 42);
        assert_eq!(second.seed_used, 42);
        assert_eq!(state.calls().len(), 2);
        assert!(state.calls().iter().all(|p| p.seed == 42));
    }

    #[tokio::test]
    async fn missing_seed_is_random_each_time() {
        let state = MockEngineState::new();
        let runtime = ready_runtime(CPU, 4, MockLoader::new(state.clone())).await;

        let first = runtime.generate(request(None)).await.unwrap();
        let second = runtime.generate(request(None)).await.unwrap();

        assert_ne!(first.seed_used, second.seed_used);
        assert!(first.seed_used <= zimage_core::MAX_SEED);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_generations_never_overlap() {
        let state = MockEngineState::with_delay(Duration::from_millis(30));
        let runtime = ready_runtime(CPU, 8, MockLoader::new(state.clone())).await;

        let tasks: Vec<_> = (0..6)
            .map(|i| {
                let runtime = Arc::clone(&runtime);
                tokio::spawn(async move { runtime.generate(request(Some(i))).await })
            })
            .collect();
        for result in futures_util::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }

        let mut spans = state.spans();
        assert_eq!(spans.len(), 6);
        spans.sort_by_key(|(start, _)| *start);
        for pair in spans.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "generations overlapped");
        }
    }

    #[tokio::test]
    async fn invalid_request_never_reaches_engine() {
        let state = MockEngineState::new();
        let runtime = ready_runtime(CPU, 4, MockLoader::new(state.clone())).await;

        let mut bad = request(Some(1));
        bad.width = 0;
        let err = runtime.generate(bad).await.unwrap_err();

        assert!(matches!(err, Error::InvalidRequest(_)));
        assert!(state.calls().is_empty());
    }

    #[tokio::test]
    async fn unloaded_runtime_is_not_ready() {
        let runtime = DiffusionRuntime::new("test/model", CPU, 4);
        assert_eq!(runtime.status(), RuntimeStatus::Unloaded);

        let err = runtime.generate(request(Some(1))).await.unwrap_err();
        assert!(matches!(err, Error::ModelNotReady));
    }

    #[tokio::test]
    async fn requests_during_load_are_not_ready() {
        let state = MockEngineState::new();
        let runtime = Arc::new(DiffusionRuntime::new("test/model", CPU, 4));
        let loader = MockLoader::new(state.clone()).with_delay(Duration::from_millis(300));

        let loading = {
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move { runtime.load(Arc::new(loader)).await })
        };
        while runtime.status() != RuntimeStatus::Loading {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let err = runtime.generate(request(Some(1))).await.unwrap_err();
        assert!(matches!(err, Error::ModelNotReady));
        assert!(state.calls().is_empty());

        loading.await.unwrap().unwrap();
        assert_eq!(runtime.status(), RuntimeStatus::Ready);
        runtime.generate(request(Some(1))).await.unwrap();
        assert_eq!(state.calls().len(), 1);
    }

    #[tokio::test]
    async fn failed_load_is_terminal() {
        let state = MockEngineState::new();
        let runtime = Arc::new(DiffusionRuntime::new("test/model", CPU, 4));

        let err = runtime
            .load(Arc::new(MockLoader::failing(state.clone())))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelLoad(_)));
        assert_eq!(runtime.status(), RuntimeStatus::Failed);

        let err = runtime.generate(request(Some(1))).await.unwrap_err();
        assert!(matches!(err, Error::ModelNotReady));

        // No second attempt
        let err = runtime
            .load(Arc::new(MockLoader::new(state.clone())))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelLoad(_)));
        assert_eq!(runtime.status(), RuntimeStatus::Failed);
        assert!(state.calls().is_empty());
    }

    #[tokio::test]
    async fn model_loads_only_once() {
        let state = MockEngineState::new();
        let runtime = ready_runtime(CPU, 4, MockLoader::new(state.clone())).await;

        let err = runtime
            .load(Arc::new(MockLoader::new(state.clone())))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelLoad(_)));
        assert!(runtime.is_ready());
        assert_eq!(state.loads(), 1);
    }

    #[tokio::test]
    async fn reduced_precision_upcasts_decoder_before_moving_to_device() {
        let state = MockEngineState::new();
        let _runtime = ready_runtime(METAL, 4, MockLoader::new(state.clone())).await;

        assert_eq!(
            state.ops(),
            vec!["upcast_decoder", "set_attention_backend", "to_device"]
        );
    }

    #[tokio::test]
    async fn full_precision_skips_upcast() {
        let state = MockEngineState::new();
        let _runtime = ready_runtime(CPU, 4, MockLoader::new(state.clone())).await;

        assert_eq!(state.ops(), vec!["set_attention_backend", "to_device"]);
    }

    #[tokio::test]
    async fn attention_tuning_failure_is_not_fatal() {
        let state = MockEngineState::new();
        let runtime = ready_runtime(CPU, 4, MockLoader::new(state.clone()).without_sdpa()).await;

        assert!(runtime.is_ready());
        assert_eq!(runtime.engine_name(), Some("mock"));
    }

    #[tokio::test]
    async fn guidance_is_always_zero() {
        let state = MockEngineState::new();
        let runtime = ready_runtime(CPU, 4, MockLoader::new(state.clone())).await;

        runtime.generate(request(Some(3))).await.unwrap();
        assert_eq!(state.calls()[0].guidance_scale, 0.0);
    }

    #[tokio::test]
    async fn metal_generates_noise_on_host() {
        let state = MockEngineState::new();
        let runtime = ready_runtime(METAL, 4, MockLoader::new(state.clone())).await;

        runtime.generate(request(Some(3))).await.unwrap();
        assert_eq!(state.calls()[0].generator_host, GeneratorHost::Host);
    }

    #[tokio::test]
    async fn cpu_generates_noise_on_device() {
        let state = MockEngineState::new();
        let runtime = ready_runtime(CPU, 4, MockLoader::new(state.clone())).await;

        runtime.generate(request(Some(3))).await.unwrap();
        assert_eq!(state.calls()[0].generator_host, GeneratorHost::Device);
    }

    #[tokio::test]
    async fn empty_negative_prompt_is_not_forwarded() {
        let state = MockEngineState::new();
        let runtime = ready_runtime(CPU, 4, MockLoader::new(state.clone())).await;

        let mut req = request(Some(3));
        req.negative_prompt = Some(String::new());
        runtime.generate(req).await.unwrap();
        assert_eq!(state.calls()[0].negative_prompt, None);
    }

    #[tokio::test]
    async fn engine_failure_is_an_inference_error() {
        let state = MockEngineState::new();
        state.fail_with("out of memory");
        let runtime = ready_runtime(CPU, 4, MockLoader::new(state.clone())).await;

        let err = runtime.generate(request(Some(3))).await.unwrap_err();
        match err {
            Error::Inference(message) => assert!(message.contains("out of memory")),
            other => panic!("unexpected error: {other}"),
        }
        // Not retried
        assert_eq!(state.calls().len(), 1);
    }

    #[tokio::test]
    async fn wrong_sized_output_is_an_inference_error() {
        let state = MockEngineState::new();
        state.truncate_output();
        let runtime = ready_runtime(CPU, 4, MockLoader::new(state.clone())).await;

        let err = runtime.generate(request(Some(3))).await.unwrap_err();
        assert!(matches!(err, Error::Inference(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn queue_bound_rejects_excess_requests() {
        let state = MockEngineState::with_delay(Duration::from_millis(200));
        let runtime = ready_runtime(CPU, 1, MockLoader::new(state.clone())).await;

        let running = {
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move { runtime.generate(request(Some(1))).await })
        };
        state.wait_started(1).await;

        let err = runtime.generate(request(Some(2))).await.unwrap_err();
        assert!(matches!(err, Error::QueueFull(1)));

        running.await.unwrap().unwrap();
        // Capacity is back once the first one finished
        runtime.generate(request(Some(3))).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn abandoned_request_keeps_the_lock_until_engine_returns() {
        let state = MockEngineState::with_delay(Duration::from_millis(150));
        let runtime = ready_runtime(CPU, 4, MockLoader::new(state.clone())).await;

        let abandoned = {
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move { runtime.generate(request(Some(1))).await })
        };
        state.wait_started(1).await;
        abandoned.abort();

        runtime.generate(request(Some(2))).await.unwrap();

        let spans = state.spans();
        assert_eq!(spans.len(), 2);
        assert!(spans[0].1 <= spans[1].0, "second generation started early");
    }

    #[tokio::test]
    async fn blog_banner_scenario() {
        let state = MockEngineState::new();
        let runtime = ready_runtime(CPU, 4, MockLoader::new(state.clone())).await;
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path(), "img");

        let req = GenerationRequest {
            prompt: "sunset over mountains".to_string(),
            negative_prompt: None,
            width: 896,
            height: 512,
            steps: 5,
            seed: Some(42),
        };
        let result = runtime.generate(req.clone()).await.unwrap();
        assert_eq!(result.seed_used, 42);
        assert_eq!(result.image.dimensions(), (896, 512));
        assert!(result.elapsed_seconds >= 0.0);

        let record = writer.write(&result.image, result.seed_used, &req).unwrap();
        assert!(record.path.is_absolute());
        assert!(record.path.to_str().unwrap().ends_with("_42.png"));
        assert_eq!(record.meta.seed, 42);
        assert_eq!(state.calls()[0].steps, 5);
    }
}
