use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Form, Json, Multipart, Path, State},
    http::{
        header::{ACCEPT, CONTENT_DISPOSITION, CONTENT_TYPE},
        HeaderMap, StatusCode,
    },
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Router,
};
use image::DynamicImage;
use kiln_core::{
    CanonicalResult, GenerationError, GenerationRequest, Job, MediaKind, Mode, Orchestrator,
    Prompt, TransportForm,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

/// Largest accepted image upload.
const MAX_UPLOAD_BYTES: usize = 4 * 1024 * 1024;
/// Request body cap; leaves room for multipart framing around the upload.
const BODY_LIMIT: usize = 2 * MAX_UPLOAD_BYTES;

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>kiln</title></head>
<body>
<h1>kiln</h1>
<form method="post" action="/generate">
  <input name="prompt" placeholder="Describe an image" size="60">
  <button formaction="/generate">Refined</button>
  <button formaction="/generate_image">Image</button>
  <button formaction="/generate_video">Video</button>
</form>
<form method="post" action="/process" enctype="multipart/form-data">
  <input type="file" name="image" accept="image/*">
  <button>Remove background</button>
</form>
</body>
</html>
"#;

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<Orchestrator>,
    // One generation at a time; later requests queue here.
    gate: Arc<Mutex<()>>,
    generate_mode: Mode,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        let generate_mode = if orchestrator.has_remote() {
            Mode::Remote
        } else {
            Mode::Refined
        };
        Self {
            orchestrator: Arc::new(orchestrator),
            gate: Arc::new(Mutex::new(())),
            generate_mode,
        }
    }

    /// Runs `job` once its turn comes. The run is detached from the caller, so
    /// a client that disconnects cannot cut reclaim short or free the turn early.
    async fn run(&self, job: Job) -> Result<CanonicalResult, GenerationError> {
        let turn = self.gate.clone().lock_owned().await;
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            let _turn = turn;
            orchestrator.run(job).await
        })
        .await
        .map_err(|err| {
            GenerationError::ComputationFailed(format!("generation task did not complete: {err}"))
        })?
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/generate", post(generate))
        .route("/generate_image", post(generate_image))
        .route("/generate_video", post(generate_video))
        .route("/process", post(process))
        .route("/v1/images/generations", post(generations))
        .route("/outputs/{id}", get(output))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .with_state(state)
}

/// A failed request as the caller sees it. Only validation errors carry their
/// own text; everything else is reduced to the fixed public message, the
/// detail having been logged by the orchestrator.
struct ApiError(GenerationError);

impl From<GenerationError> for ApiError {
    fn from(err: GenerationError) -> Self {
        Self(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self.0 {
            GenerationError::InputValidation(detail) => (StatusCode::BAD_REQUEST, detail),
            other => (
                StatusCode::INTERNAL_SERVER_ERROR,
                other.public_message().to_string(),
            ),
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

#[derive(Deserialize)]
struct PromptForm {
    #[serde(default)]
    prompt: String,
}

#[derive(Serialize)]
struct MediaResponse {
    media_type: MediaKind,
    file: String,
    url: String,
    prompt: String,
}

impl MediaResponse {
    /// Browsers asking for HTML get a page showing the result; everyone else
    /// gets JSON.
    fn negotiate(self, headers: &HeaderMap) -> Response {
        if wants_html(headers) {
            Html(self.to_html()).into_response()
        } else {
            Json(self).into_response()
        }
    }

    fn to_html(&self) -> String {
        let url = escape_html(&self.url);
        let prompt = escape_html(&self.prompt);
        let media = match self.media_type {
            MediaKind::Image => format!(r#"<img src="{url}" alt="{prompt}">"#),
            MediaKind::Video => format!(r#"<video src="{url}" controls autoplay loop></video>"#),
        };
        format!(
            r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>kiln</title></head>
<body>
<figure>
  {media}
  <figcaption>{prompt}</figcaption>
</figure>
<p><a href="{url}" download>Download</a> | <a href="/">Back</a></p>
</body>
</html>
"#
        )
    }
}

fn wants_html(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("text/html"))
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[derive(Serialize)]
struct GenerationResponse {
    image: String,
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<PromptForm>,
) -> Result<Response, ApiError> {
    let mode = state.generate_mode;
    Ok(generate_file(&state, mode, &form.prompt)
        .await?
        .negotiate(&headers))
}

async fn generate_image(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<PromptForm>,
) -> Result<Response, ApiError> {
    Ok(generate_file(&state, Mode::Image, &form.prompt)
        .await?
        .negotiate(&headers))
}

async fn generate_video(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<PromptForm>,
) -> Result<Response, ApiError> {
    Ok(generate_file(&state, Mode::Video, &form.prompt)
        .await?
        .negotiate(&headers))
}

async fn generate_file(
    state: &AppState,
    mode: Mode,
    raw_prompt: &str,
) -> Result<MediaResponse, ApiError> {
    let prompt = Prompt::new(raw_prompt)?;
    let text = prompt.as_str().to_string();
    info!(?mode, prompt = %text, "generation requested");

    match state.run(Job::prompt(mode, prompt)).await? {
        CanonicalResult::File {
            media, file_name, ..
        } => Ok(MediaResponse {
            media_type: media,
            url: format!("/outputs/{file_name}"),
            file: file_name,
            prompt: text,
        }),
        CanonicalResult::Inline { .. } => Err(misrouted_result().into()),
    }
}

async fn generations(
    State(state): State<AppState>,
    Json(request): Json<GenerationRequest>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let prompt = Prompt::new(&request.prompt)?;
    let job = Job::prompt(Mode::Image, prompt)
        .with_options(request.options)
        .with_transport(TransportForm::Inline);

    match state.run(job).await? {
        CanonicalResult::Inline { data, .. } => Ok(Json(GenerationResponse { image: data })),
        CanonicalResult::File { .. } => Err(misrouted_result().into()),
    }
}

async fn process(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let image = read_upload(&mut multipart).await?;
    info!(width = image.width(), height = image.height(), "background removal requested");

    let CanonicalResult::File { path, .. } = state.run(Job::remove_background(image)).await? else {
        return Err(misrouted_result().into());
    };
    let bytes = tokio::fs::read(&path).await.map_err(GenerationError::from)?;
    Ok((
        [
            (CONTENT_TYPE, MediaKind::Image.mime()),
            (CONTENT_DISPOSITION, "attachment; filename=\"no-bg.png\""),
        ],
        bytes,
    )
        .into_response())
}

async fn read_upload(multipart: &mut Multipart) -> Result<DynamicImage, GenerationError> {
    let invalid = GenerationError::InputValidation;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| invalid(format!("malformed upload: {err}")))?
    {
        if field.name() != Some("image") {
            continue;
        }
        if field.file_name().map_or(true, str::is_empty) {
            return Err(invalid("no file selected".into()));
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|err| invalid(format!("upload could not be read: {err}")))?;
        if bytes.is_empty() {
            return Err(invalid("uploaded file is empty".into()));
        }
        if bytes.len() > MAX_UPLOAD_BYTES {
            return Err(invalid(format!(
                "uploaded file exceeds {} MiB",
                MAX_UPLOAD_BYTES / (1024 * 1024)
            )));
        }
        return image::load_from_memory(&bytes)
            .map_err(|err| invalid(format!("uploaded file is not a readable image: {err}")));
    }
    Err(invalid("no image uploaded".into()))
}

async fn output(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(media) = MediaKind::parse_generated_name(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let path = state.orchestrator.normalizer().output_dir().join(&id);
    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(CONTENT_TYPE, media.mime())], bytes).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

fn misrouted_result() -> GenerationError {
    GenerationError::ComputationFailed("result arrived in the wrong transport form".into())
}
