use std::sync::Arc;
use std::time::Instant;

use image::DynamicImage;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    CanonicalResult, CapabilityKind, DenoiseRange, GenerationError, GenerationOptions,
    InvokeParams, MediaKind, Normalizer, OutputForm, PipelineHandle, PipelineRegistry, Prompt,
    RawOutput, Reclaimer, RemoteDelegate, RequestScope, StageInput, TransportForm,
};

/// Share of the diffusion schedule the base stage runs before handing over.
pub const BASE_STAGE_SHARE: f64 = 0.8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Image,
    Video,
    RemoveBackground,
    /// Base stage to a latent, then a refiner on the remaining schedule.
    Refined,
    /// Generation on the remote worker.
    Remote,
}

#[derive(Debug)]
pub enum JobInput {
    Prompt(Prompt),
    Image(DynamicImage),
}

#[derive(Debug)]
pub struct Job {
    pub mode: Mode,
    pub input: JobInput,
    pub options: GenerationOptions,
    pub transport: TransportForm,
}

impl Job {
    pub fn prompt(mode: Mode, prompt: Prompt) -> Self {
        Self {
            mode,
            input: JobInput::Prompt(prompt),
            options: GenerationOptions::default(),
            transport: TransportForm::File,
        }
    }

    pub fn remove_background(image: DynamicImage) -> Self {
        Self {
            mode: Mode::RemoveBackground,
            input: JobInput::Image(image),
            options: GenerationOptions::default(),
            transport: TransportForm::File,
        }
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_transport(mut self, transport: TransportForm) -> Self {
        self.transport = transport;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageState {
    Idle,
    StageOneRunning,
    StageTwoRunning,
    Normalizing,
    Done,
    Failed,
}

impl StageState {
    pub fn can_advance_to(self, next: StageState) -> bool {
        use StageState::*;
        match (self, next) {
            (Done | Failed, _) => false,
            (_, Failed) => true,
            (Idle, StageOneRunning) => true,
            (StageOneRunning, StageTwoRunning | Normalizing) => true,
            (StageTwoRunning, Normalizing) => true,
            (Normalizing, Done) => true,
            _ => false,
        }
    }
}

/// Per-request state machine; terminal states are per request.
#[derive(Debug)]
struct RequestRun {
    state: StageState,
}

impl RequestRun {
    fn new() -> Self {
        Self {
            state: StageState::Idle,
        }
    }

    fn advance(&mut self, next: StageState) {
        if !self.state.can_advance_to(next) {
            warn!(from = ?self.state, to = ?next, "unexpected stage transition");
        }
        debug!(from = ?self.state, to = ?next, "stage transition");
        self.state = next;
    }
}

/// Drives one request through its stages and always reclaims what it acquired.
pub struct Orchestrator {
    registry: Arc<PipelineRegistry>,
    remote: Option<RemoteDelegate>,
    normalizer: Normalizer,
    reclaimer: Reclaimer,
}

impl Orchestrator {
    pub fn new(registry: Arc<PipelineRegistry>, normalizer: Normalizer) -> Self {
        let reclaimer = Reclaimer::new(registry.session().device().clone());
        Self {
            registry,
            remote: None,
            normalizer,
            reclaimer,
        }
    }

    pub fn with_remote(mut self, remote: RemoteDelegate) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn registry(&self) -> &Arc<PipelineRegistry> {
        &self.registry
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub async fn run(&self, job: Job) -> Result<CanonicalResult, GenerationError> {
        let request_id = Uuid::new_v4();
        let span = info_span!("generation", %request_id, mode = ?job.mode);
        async move {
            let started = Instant::now();
            let mut run = RequestRun::new();
            let mut scope = RequestScope::new();

            let outcome = self.drive(job, &mut run, &mut scope).await;
            let report = self.reclaimer.reclaim(scope);

            match &outcome {
                Ok(result) => {
                    run.advance(StageState::Done);
                    info!(
                        media = ?result.media(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        released = report.released,
                        "generation finished"
                    );
                }
                Err(err) => {
                    run.advance(StageState::Failed);
                    if err.is_client_error() {
                        info!(error = %err, "generation rejected");
                    } else {
                        error!(error = %err, ?report, "generation failed");
                    }
                }
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        job: Job,
        run: &mut RequestRun,
        scope: &mut RequestScope,
    ) -> Result<CanonicalResult, GenerationError> {
        let Job {
            mode,
            input,
            options,
            transport,
        } = job;
        options.validate()?;

        let raw = match (mode, input) {
            (Mode::Image, JobInput::Prompt(prompt)) => {
                self.single_stage(
                    CapabilityKind::ImageBase,
                    StageInput::Prompt(prompt),
                    options,
                    run,
                )
                .await?
            }
            (Mode::Video, JobInput::Prompt(prompt)) => {
                self.single_stage(
                    CapabilityKind::Video,
                    StageInput::Prompt(prompt),
                    options,
                    run,
                )
                .await?
            }
            (Mode::RemoveBackground, JobInput::Image(image)) => {
                self.single_stage(
                    CapabilityKind::BackgroundRemover,
                    StageInput::Image(image),
                    options,
                    run,
                )
                .await?
            }
            (Mode::Refined, JobInput::Prompt(prompt)) => {
                self.two_stage(prompt, options, run, scope).await?
            }
            (Mode::Remote, JobInput::Prompt(prompt)) => self.delegate(prompt, run).await?,
            (mode, input) => {
                let given = match input {
                    JobInput::Prompt(_) => "a prompt",
                    JobInput::Image(_) => "an image",
                };
                return Err(GenerationError::InputValidation(format!(
                    "{mode:?} generation does not take {given}"
                )));
            }
        };

        run.advance(StageState::Normalizing);
        let normalizer = self.normalizer.clone();
        on_blocking_thread(move || normalizer.normalize(raw, transport)).await
    }

    async fn single_stage(
        &self,
        kind: CapabilityKind,
        input: StageInput,
        options: GenerationOptions,
        run: &mut RequestRun,
    ) -> Result<RawOutput, GenerationError> {
        run.advance(StageState::StageOneRunning);
        let handle = self.registry.resident(kind).await?;
        invoke(handle, InvokeParams::pixels(options), input).await
    }

    async fn two_stage(
        &self,
        prompt: Prompt,
        options: GenerationOptions,
        run: &mut RequestRun,
        scope: &mut RequestScope,
    ) -> Result<RawOutput, GenerationError> {
        run.advance(StageState::StageOneRunning);
        // A resident single-stage base would sit next to both stages.
        match self.registry.evict(CapabilityKind::ImageBase).await {
            Ok(true) => info!("evicted resident base for two-stage run"),
            Ok(false) => {}
            Err(err) => warn!(error = %err, "resident base release reported an error"),
        }
        let base = scope.adopt(self.registry.load_scoped(CapabilityKind::ImageBase).await?);
        let params = InvokeParams {
            options: options.clone(),
            output_form: OutputForm::Latent,
            range: DenoiseRange::new(0.0, BASE_STAGE_SHARE),
        };
        let output = invoke(base.clone(), params, StageInput::Prompt(prompt.clone())).await;
        // Both stages are too large to share the device: the base goes before
        // the refiner is loaded, whatever the base produced.
        release_stage(&base);
        let latent = match output? {
            RawOutput::Latent(latent) => latent,
            other => {
                return Err(GenerationError::ComputationFailed(format!(
                    "base stage returned {} instead of a latent",
                    other.form()
                )))
            }
        };
        scope.stash(latent);

        run.advance(StageState::StageTwoRunning);
        let refiner = scope.adopt(self.registry.load_scoped(CapabilityKind::ImageRefiner).await?);
        let latent = scope.take_artifact().ok_or_else(|| {
            GenerationError::ComputationFailed("base latent went missing before refinement".into())
        })?;
        let params = InvokeParams {
            options,
            output_form: OutputForm::Pixels,
            range: DenoiseRange::new(BASE_STAGE_SHARE, 1.0),
        };
        let output = invoke(refiner.clone(), params, StageInput::Refine { prompt, latent }).await;
        release_stage(&refiner);
        output
    }

    async fn delegate(
        &self,
        prompt: Prompt,
        run: &mut RequestRun,
    ) -> Result<RawOutput, GenerationError> {
        run.advance(StageState::StageOneRunning);
        let remote = self.remote.as_ref().ok_or_else(|| {
            GenerationError::ComputationFailed(
                "remote delegation requested without a worker endpoint".into(),
            )
        })?;
        Ok(remote.delegate(&prompt, MediaKind::Image).await?)
    }
}

/// Runs one stage on the blocking pool; invokes are compute-bound and
/// cannot be interrupted once started.
async fn invoke(
    handle: PipelineHandle,
    params: InvokeParams,
    input: StageInput,
) -> Result<RawOutput, GenerationError> {
    let kind = handle.kind();
    let started = Instant::now();
    let output = on_blocking_thread(move || Ok(handle.invoke(&params, input)?)).await?;
    debug!(
        %kind,
        form = output.form(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "stage finished"
    );
    Ok(output)
}

fn release_stage(handle: &PipelineHandle) {
    if let Err(err) = handle.release() {
        warn!(kind = %handle.kind(), error = %err, "stage release reported an error");
    }
}

async fn on_blocking_thread<T, F>(f: F) -> Result<T, GenerationError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, GenerationError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|err| {
        GenerationError::ComputationFailed(format!("stage task did not complete: {err}"))
    })?
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::testing::{Event, Journal, SpyLoader, SPY_VIDEO};
    use crate::SessionConfig;

    struct Harness {
        orchestrator: Orchestrator,
        journal: Journal,
        dir: tempfile::TempDir,
    }

    fn harness(loader: SpyLoader) -> Harness {
        let journal = loader.journal();
        let registry = Arc::new(PipelineRegistry::new(SessionConfig::cpu(), Arc::new(loader)));
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(registry, Normalizer::new(dir.path()).unwrap());
        Harness {
            orchestrator,
            journal,
            dir,
        }
    }

    fn prompt(text: &str) -> Prompt {
        Prompt::new(text).unwrap()
    }

    fn outputs(dir: &tempfile::TempDir) -> usize {
        fs::read_dir(dir.path()).unwrap().count()
    }

    fn loads_and_releases(journal: &Journal) -> (usize, usize) {
        (
            journal.count(|e| matches!(e, Event::Load(_))),
            journal.count(|e| matches!(e, Event::Release(_))),
        )
    }

    #[tokio::test]
    async fn single_stage_image_writes_one_png() {
        let h = harness(SpyLoader::new());
        let result = h
            .orchestrator
            .run(Job::prompt(Mode::Image, prompt("a red balloon")))
            .await
            .unwrap();

        assert_eq!(
            h.journal.events(),
            vec![
                Event::Load(CapabilityKind::ImageBase),
                Event::Invoke {
                    kind: CapabilityKind::ImageBase,
                    output_form: OutputForm::Pixels,
                    range: DenoiseRange::FULL,
                },
            ]
        );
        let name = result.file_name().unwrap();
        assert_eq!(MediaKind::parse_generated_name(name), Some(MediaKind::Image));
        assert_eq!(outputs(&h.dir), 1);

        let written = image::open(h.dir.path().join(name)).unwrap();
        assert_eq!((written.width(), written.height()), (1024, 1024));
        assert_eq!(written.color(), image::ColorType::Rgb8);
    }

    #[tokio::test]
    async fn single_stage_handles_stay_warm_across_requests() {
        let h = harness(SpyLoader::new());
        for text in ["a red balloon", "a blue kite"] {
            h.orchestrator
                .run(Job::prompt(Mode::Image, prompt(text)))
                .await
                .unwrap();
        }
        assert_eq!(loads_and_releases(&h.journal), (1, 0));
        assert!(h.orchestrator.registry().is_resident(CapabilityKind::ImageBase).await);
    }

    #[tokio::test]
    async fn two_stage_releases_base_before_loading_refiner() {
        let h = harness(SpyLoader::new());
        let result = h
            .orchestrator
            .run(Job::prompt(Mode::Refined, prompt("a cat walking")))
            .await
            .unwrap();

        assert_eq!(
            h.journal.events(),
            vec![
                Event::Load(CapabilityKind::ImageBase),
                Event::Invoke {
                    kind: CapabilityKind::ImageBase,
                    output_form: OutputForm::Latent,
                    range: DenoiseRange::new(0.0, 0.8),
                },
                Event::Release(CapabilityKind::ImageBase),
                Event::Load(CapabilityKind::ImageRefiner),
                Event::Invoke {
                    kind: CapabilityKind::ImageRefiner,
                    output_form: OutputForm::Pixels,
                    range: DenoiseRange::new(0.8, 1.0),
                },
                Event::Release(CapabilityKind::ImageRefiner),
            ]
        );
        assert_eq!(result.media(), MediaKind::Image);
        assert_eq!(outputs(&h.dir), 1);
    }

    #[tokio::test]
    async fn refiner_failure_still_releases_everything() {
        let h = harness(SpyLoader::new().failing_invoke(CapabilityKind::ImageRefiner));
        let err = h
            .orchestrator
            .run(Job::prompt(Mode::Refined, prompt("a cat walking")))
            .await
            .unwrap_err();

        assert!(matches!(err, GenerationError::ComputationFailed(_)));
        assert!(!err.public_message().contains("0xdeadbeef"));
        assert_eq!(loads_and_releases(&h.journal), (2, 2));
        assert_eq!(outputs(&h.dir), 0);
    }

    #[tokio::test]
    async fn refiner_load_failure_releases_base_and_drops_latent() {
        let h = harness(SpyLoader::new().failing_load(CapabilityKind::ImageRefiner));
        let err = h
            .orchestrator
            .run(Job::prompt(Mode::Refined, prompt("a cat walking")))
            .await
            .unwrap_err();

        assert!(matches!(err, GenerationError::ResourceExhausted(_)));
        assert_eq!(loads_and_releases(&h.journal), (1, 1));
    }

    #[tokio::test]
    async fn base_failure_never_loads_refiner() {
        let h = harness(SpyLoader::new().exhausted_invoke(CapabilityKind::ImageBase));
        let err = h
            .orchestrator
            .run(Job::prompt(Mode::Refined, prompt("a cat walking")))
            .await
            .unwrap_err();

        assert!(matches!(err, GenerationError::ResourceExhausted(_)));
        assert_eq!(
            h.journal.count(|e| *e == Event::Load(CapabilityKind::ImageRefiner)),
            0
        );
        assert_eq!(loads_and_releases(&h.journal), (1, 1));
    }

    #[tokio::test]
    async fn release_error_does_not_mask_stage_error() {
        let h = harness(
            SpyLoader::new()
                .failing_invoke(CapabilityKind::ImageBase)
                .failing_unload(CapabilityKind::ImageBase),
        );
        let err = h
            .orchestrator
            .run(Job::prompt(Mode::Refined, prompt("a cat walking")))
            .await
            .unwrap_err();
        match err {
            GenerationError::ComputationFailed(detail) => {
                assert!(detail.contains("internal error"))
            }
            other => panic!("expected the invoke failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn blank_output_is_degenerate() {
        let h = harness(SpyLoader::new().blank_output());
        let err = h
            .orchestrator
            .run(Job::prompt(Mode::Refined, prompt("a cat walking")))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::DegenerateOutput(_)));
        assert_eq!(loads_and_releases(&h.journal), (2, 2));
        assert_eq!(outputs(&h.dir), 0);
    }

    #[tokio::test]
    async fn background_removal_yields_canonical_png() {
        let h = harness(SpyLoader::new());
        let upload = DynamicImage::ImageRgb8(image::RgbImage::from_fn(300, 200, |x, _| {
            image::Rgb([x as u8, 40, 90])
        }));
        let result = h
            .orchestrator
            .run(Job::remove_background(upload))
            .await
            .unwrap();
        let CanonicalResult::File { path, .. } = result else {
            panic!("expected a file");
        };
        let written = image::open(path).unwrap().to_rgb8();
        assert_eq!(written.dimensions(), (1024, 1024));
        // Right half was cut away and flattened onto white.
        assert_eq!(written.get_pixel(1000, 500), &image::Rgb([255, 255, 255]));
    }

    #[tokio::test]
    async fn video_is_written_as_mp4() {
        let h = harness(SpyLoader::new());
        let result = h
            .orchestrator
            .run(Job::prompt(Mode::Video, prompt("a cat walking")))
            .await
            .unwrap();
        let CanonicalResult::File { path, file_name, .. } = result else {
            panic!("expected a file");
        };
        assert!(file_name.ends_with(".mp4"));
        assert_eq!(fs::read(path).unwrap(), SPY_VIDEO);
    }

    #[tokio::test]
    async fn inline_transport_writes_nothing() {
        let h = harness(SpyLoader::new());
        let result = h
            .orchestrator
            .run(
                Job::prompt(Mode::Image, prompt("a red balloon"))
                    .with_transport(TransportForm::Inline),
            )
            .await
            .unwrap();
        assert!(matches!(result, CanonicalResult::Inline { .. }));
        assert_eq!(outputs(&h.dir), 0);
    }

    #[tokio::test]
    async fn mismatched_input_is_rejected_before_loading() {
        let h = harness(SpyLoader::new());
        let err = h
            .orchestrator
            .run(Job {
                mode: Mode::RemoveBackground,
                input: JobInput::Prompt(prompt("a red balloon")),
                options: GenerationOptions::default(),
                transport: TransportForm::File,
            })
            .await
            .unwrap_err();
        assert!(err.is_client_error());
        assert!(h.journal.is_empty());
    }

    #[tokio::test]
    async fn oversized_options_are_rejected_before_loading() {
        let h = harness(SpyLoader::new());
        let err = h
            .orchestrator
            .run(
                Job::prompt(Mode::Refined, prompt("a cat walking")).with_options(
                    GenerationOptions {
                        steps: Some(100_000),
                        ..Default::default()
                    },
                ),
            )
            .await
            .unwrap_err();
        assert!(err.is_client_error());
        assert!(h.journal.is_empty());
        assert_eq!(outputs(&h.dir), 0);
    }

    #[tokio::test]
    async fn remote_mode_without_worker_fails_cleanly() {
        let h = harness(SpyLoader::new());
        let err = h
            .orchestrator
            .run(Job::prompt(Mode::Remote, prompt("a red balloon")))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::ComputationFailed(_)));
        assert!(h.journal.is_empty());
    }

    #[tokio::test]
    async fn unreachable_worker_is_upstream_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let h = harness(SpyLoader::new());
        let orchestrator = h
            .orchestrator
            .with_remote(RemoteDelegate::new(&format!("http://{addr}")).unwrap());
        let err = orchestrator
            .run(Job::prompt(Mode::Remote, prompt("a red balloon")))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::UpstreamUnavailable { status: None, .. }));
        assert!(h.journal.is_empty());
    }

    async fn worker(router: axum::Router) -> RemoteDelegate {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        RemoteDelegate::new(&format!("http://{addr}/")).unwrap()
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([x as u8, y as u8, 120])
        });
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[tokio::test]
    async fn remote_image_is_normalized_like_a_local_one() {
        use axum::{http::header, routing::post};

        let remote = worker(axum::Router::new().route(
            "/generate_image",
            post(|| async { ([(header::CONTENT_TYPE, "image/png")], png_bytes(640, 360)) }),
        ))
        .await;
        let h = harness(SpyLoader::new());
        let orchestrator = h.orchestrator.with_remote(remote);
        let result = orchestrator
            .run(Job::prompt(Mode::Remote, prompt("a red balloon")))
            .await
            .unwrap();

        let CanonicalResult::File { path, .. } = result else {
            panic!("expected a file");
        };
        let written = image::open(path).unwrap();
        assert_eq!((written.width(), written.height()), (1024, 1024));
        assert_eq!(written.color(), image::ColorType::Rgb8);
        assert_eq!(outputs(&h.dir), 1);
        assert!(h.journal.is_empty());
    }

    #[tokio::test]
    async fn remote_html_answer_is_upstream_unavailable() {
        use axum::{http::header, routing::post};

        let remote = worker(axum::Router::new().route(
            "/generate_image",
            post(|| async { ([(header::CONTENT_TYPE, "text/html")], "<html>oops</html>") }),
        ))
        .await;
        let h = harness(SpyLoader::new());
        let orchestrator = h.orchestrator.with_remote(remote);
        let err = orchestrator
            .run(Job::prompt(Mode::Remote, prompt("a red balloon")))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            GenerationError::UpstreamUnavailable {
                status: Some(200),
                ..
            }
        ));
        assert!(!err.public_message().contains("oops"));
        assert_eq!(outputs(&h.dir), 0);
    }

    #[tokio::test]
    async fn refined_run_evicts_a_warm_base_first() {
        let h = harness(SpyLoader::new());
        let registry = h.orchestrator.registry().clone();
        registry.warm_up(&[CapabilityKind::ImageBase]).await.unwrap();

        h.orchestrator
            .run(Job::prompt(Mode::Refined, prompt("a cat walking")))
            .await
            .unwrap();

        let mut loaded_bases = 0usize;
        for event in h.journal.events() {
            match event {
                Event::Load(CapabilityKind::ImageBase) => loaded_bases += 1,
                Event::Release(CapabilityKind::ImageBase) => loaded_bases -= 1,
                Event::Load(CapabilityKind::ImageRefiner) => assert_eq!(loaded_bases, 0),
                _ => {}
            }
            assert!(loaded_bases <= 1, "two bases on the device at once");
        }
        assert_eq!(loaded_bases, 0);
        assert!(!registry.is_resident(CapabilityKind::ImageBase).await);
    }

    #[test]
    fn failed_and_done_are_terminal() {
        use StageState::*;
        assert!(Idle.can_advance_to(StageOneRunning));
        assert!(StageOneRunning.can_advance_to(StageTwoRunning));
        assert!(StageTwoRunning.can_advance_to(Failed));
        assert!(Normalizing.can_advance_to(Done));
        assert!(!Idle.can_advance_to(Normalizing));
        assert!(!Done.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(StageOneRunning));
    }
}
