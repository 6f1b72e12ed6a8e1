use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use drape_contracts::assets::ImageAsset;
use drape_contracts::description::DescriptionDocument;
use drape_contracts::events::{payload, EventWriter};
use drape_contracts::outcome::{write_outcome, CorrectionRound, PipelineResult, RunOutcome};
use drape_contracts::report::{DifferenceReport, Discrepancy};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

pub const DEFAULT_ANALYSIS_MODEL: &str = "gemini-3-flash-preview";

/// Backend model identifiers tried in order by the generation adapter.
pub const DEFAULT_GENERATION_BACKENDS: [&str; 2] = [
    "gemini-2.5-flash-image",
    "gemini-2.0-flash-preview-image-generation",
];

pub const MAX_ATTEMPTS_PER_BACKEND: usize = 3;
pub const DEFAULT_RETRY_BACKOFF_S: f64 = 10.0;
const DEFAULT_REQUEST_TIMEOUT_S: f64 = 90.0;
const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

// ---------------------------------------------------------------------------
// Instruction templates. Opaque to the control flow; builders skip weak
// fields when assembling blocks.
// ---------------------------------------------------------------------------

const ANALYSIS_INSTRUCTION: &str = r#"You are an elite visual analyst for fashion, textiles, and jewelry.
Your output is fed directly to an image-generation model that must recreate
this exact outfit and jewelry on a different person.

Rules:
1. Every color gets a precise name AND a hex code.
2. Count elements one by one; give exact numbers or "approximately N (estimated)".
3. Describe every visible detail, however small. No hallucination: uncertain
   observations are prefixed "appears to be".
4. State where each element sits on the garment or body.

Return a single JSON object with these fields (null when not applicable):
dress_type, dress_identity, style_era, primary_color, primary_color_hex,
secondary_colors, accent_colors, fabric, fabric_weight, fabric_sheen,
texture, transparency, neckline, sleeves, bodice, waistline, skirt_lower,
length, hemline, silhouette, fit, pattern, pattern_details, pattern_colors,
border_design, buttons, closures, pockets, structural_details,
seams_and_stitching, embroidery, beadwork, embellishments,
special_design_features, micro_details, design_dna,
dress_reproduction_checklist, jewelry_pieces, jewelry_reproduction_checklist,
accessories, layering, draping_and_folds, lighting, pose, background,
overall_style, reproduction_notes.

`jewelry_pieces` is an array with one entry per visible piece: type,
material, material_color_hex, stones, chain_details, design_elements,
dangling_elements, dimensions, position_on_body, description.
`dress_reproduction_checklist` lists the top 10 features someone must get
right to reproduce this dress; `jewelry_reproduction_checklist` the top 5
for the jewelry.

Return ONLY the JSON object. No markdown fences, no text before or after."#;

const REFINEMENT_INSTRUCTION_TEMPLATE: &str = r#"You are reviewing your own analysis of an outfit image. Your first pass is
shown below, but it has gaps and missing details.

## YOUR FIRST PASS RESULT:
{first_pass_json}

Look at the image again and focus on what you missed: dress construction
(neckline, sleeves, bodice, waistline, skirt), decoration (embroidery,
beadwork, embellishments, border_design, special_design_features,
micro_details, design_dna), structure (pattern, pattern_details,
structural_details, buttons, closures), jewelry (one jewelry_pieces entry
per piece, with stones, chains, and dangling elements), and the
reproduction checklists. Re-verify all hex codes and counts.

Return a JSON object with ONLY the fields you are updating or adding; skip
fields that are already correct and complete. Return ONLY the JSON, with no
markdown fences and no text before or after."#;

const COMPARISON_INSTRUCTION: &str = r#"You are grading how faithfully IMAGE 2 (the candidate) reproduces the
outfit and jewelry shown in IMAGE 1 (the reference).

Compare ONLY these attributes: garment type and silhouette, colors (by hex
where possible), fabric and texture, pattern and print, neckline, sleeves,
bodice, waistline, skirt and hemline, embroidery, beadwork, embellishments,
borders and trims, closures and buttons, and every jewelry piece (metal,
stones, placement). Do NOT judge the person's identity, face, body, pose,
background, or lighting; those are out of scope.

Return a single JSON object:
{
  "score": <integer 0-100, overall outfit fidelity>,
  "summary": "<one sentence>",
  "discrepancies": [
    {"feature": "<attribute>", "severity": "CRITICAL" or "MINOR",
     "expected": "<what IMAGE 1 shows>", "observed": "<what IMAGE 2 shows>",
     "fix": "<one imperative edit instruction>"}
  ]
}

CRITICAL means the mismatch is obvious at a glance; MINOR means a close
look is needed. Return ONLY the JSON object, no markdown fences."#;

const GENERATION_SYSTEM_INSTRUCTION: &str = r#"You are an expert virtual try-on AI. You receive a photo of a PERSON (the
target), a photo showing a CLOTHING OUTFIT (the reference), and a detailed
text description of the outfit. Edit the person's photo so they wear the
outfit from the reference photo.

Output exactly one person: the person from the target photo. Never overlay,
blend, or stack the two images, and never show the reference person. Keep
the target's face, skin, hair, body shape, pose, background, and lighting
100% unchanged; change only the clothing and jewelry, copying every detail
from the reference. The result must be photorealistic, with natural fit,
draping, and shadows."#;

/// Description fields highlighted in the generation instruction, in the
/// order they are rendered.
const GENERATION_DETAIL_FIELDS: [&str; 20] = [
    "neckline",
    "sleeves",
    "bodice",
    "waistline",
    "skirt_lower",
    "length",
    "hemline",
    "silhouette",
    "fit",
    "fabric",
    "fabric_sheen",
    "pattern",
    "pattern_details",
    "border_design",
    "embroidery",
    "beadwork",
    "embellishments",
    "special_design_features",
    "design_dna",
    "dress_reproduction_checklist",
];

/// Full generation instruction: focused dress and jewelry blocks, the
/// complete description as supporting reference, and the user's override
/// instructions at highest priority.
pub fn build_generation_instruction(
    description: &DescriptionDocument,
    user_instructions: Option<&str>,
) -> String {
    let dress = description.field_or("dress_type", "clothing");
    let primary = description.field_or("primary_color", "as described");
    let identity = description.field_str("dress_identity").unwrap_or_default();

    let mut dress_lines = Vec::new();
    for field in GENERATION_DETAIL_FIELDS {
        if description.is_field_weak(field) {
            continue;
        }
        if let Some(value) = description.get(field) {
            dress_lines.push(format!("- {}: {}", field_label(field), render_value(value)));
        }
    }
    let dress_block = if dress_lines.is_empty() {
        "See the full JSON below.".to_string()
    } else {
        dress_lines.join("\n")
    };

    let jewelry_block = build_jewelry_block(description);
    let full_json = description.to_string_pretty();
    let user_block = user_instructions
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(|text| {
            format!(
                "\n=== USER'S CUSTOM INSTRUCTIONS (HIGHEST PRIORITY, FOLLOW EXACTLY) ===\n\
                 {text}\n\
                 These override default assumptions about background, lighting, and pose.\n"
            )
        })
        .unwrap_or_default();

    format!(
        "Copy the EXACT outfit and jewelry from IMAGE 1 onto the person in IMAGE 2.\n\
         IMAGE 1 is the primary visual reference; the text below adds precision.\n\
         \n\
         === DRESS IDENTITY ===\n\
         Type: {dress}\n\
         Primary color: {primary}\n\
         {identity}\n\
         \n\
         === DRESS DETAILS, MATCH IMAGE 1 EXACTLY ===\n\
         {dress_block}\n\
         \n\
         === JEWELRY, MATCH IMAGE 1 EXACTLY ===\n\
         {jewelry_block}\n\
         \n\
         === FULL DESCRIPTION JSON (SUPPORTING REFERENCE) ===\n\
         {full_json}\n\
         \n\
         === ABSOLUTE RULES ===\n\
         Keep the person's face, skin, hair, body, and pose 100% unchanged.\n\
         Keep the background and lighting exactly the same unless the user's\n\
         instructions say otherwise. Change only the clothing and jewelry, and\n\
         do not simplify or skip any embellishment visible in IMAGE 1.\n\
         {user_block}"
    )
}

/// Reduced instruction used when the full one produced no image: core
/// identity fields only.
pub fn build_simplified_instruction(description: &DescriptionDocument) -> String {
    format!(
        "Copy the EXACT outfit and jewelry from IMAGE 1 onto the person in IMAGE 2. \
         The outfit is: {}. Primary color: {}. Keep the person's face, body, hair, \
         skin, and background exactly the same. Only change their clothes and jewelry \
         to match IMAGE 1.",
        description.field_or("dress_type", "clothing"),
        description.field_or("primary_color", "not specified"),
    )
}

/// Edit instruction for one correction round, built from the selected
/// discrepancies' fix texts.
pub fn build_correction_instruction(
    fixes: &[Discrepancy],
    user_instructions: Option<&str>,
) -> String {
    let mut lines = Vec::with_capacity(fixes.len());
    for (index, fix) in fixes.iter().enumerate() {
        let label = if fix.feature.is_empty() {
            String::new()
        } else {
            format!(" [{}]", fix.feature)
        };
        lines.push(format!("{}.{} {}", index + 1, label, fix.fix));
    }
    let user_block = user_instructions
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(|text| format!("\nUser's custom instructions still apply:\n{text}\n"))
        .unwrap_or_default();

    format!(
        "The FIRST image is the reference outfit, the SECOND is the person, and the \
         THIRD is your previous attempt. Edit the THIRD image, applying ONLY the \
         corrections below so it matches the reference outfit. Keep everything else, \
         including the person's face, body, pose, and background, exactly as it is in \
         the third image.\n\nCORRECTIONS:\n{}\n{user_block}",
        lines.join("\n"),
    )
}

fn build_jewelry_block(description: &DescriptionDocument) -> String {
    let pieces = description
        .get("jewelry_pieces")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if pieces.is_empty() {
        return "No jewelry detected. Do NOT add any jewelry.".to_string();
    }

    let mut lines = Vec::new();
    for (index, piece) in pieces.iter().enumerate() {
        let line = match piece {
            Value::Object(fields) => {
                let kind = fields
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("Jewelry piece");
                let detail = fields
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| render_value(piece));
                format!("{}. {kind}: {detail}", index + 1)
            }
            other => format!("{}. {}", index + 1, render_value(other)),
        };
        lines.push(line);
    }
    if !description.is_field_weak("jewelry_reproduction_checklist") {
        if let Some(checklist) = description.get("jewelry_reproduction_checklist") {
            lines.push(format!("REPRODUCTION CHECKLIST: {}", render_value(checklist)));
        }
    }
    lines.join("\n")
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn field_label(field: &str) -> String {
    field
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Marker attached to the anyhow chain when a service signaled temporary
/// unavailability. The generation adapter retries these with linear backoff.
#[derive(Debug)]
pub struct TransientFailure;

impl fmt::Display for TransientFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("transient service failure")
    }
}

/// Raised by the generation adapter when every backend identifier was
/// exhausted without a single non-failure response.
#[derive(Debug)]
pub struct AllBackendsExhausted {
    pub backends: usize,
    pub failures: usize,
}

impl fmt::Display for AllBackendsExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "all {} generation backends exhausted after {} failed attempts",
            self.backends, self.failures
        )
    }
}

impl std::error::Error for AllBackendsExhausted {}

/// Missing or unusable service credentials; rejected before any call.
#[derive(Debug)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// Missing or unparsable caller input; rejected before any call.
#[derive(Debug)]
pub struct InputError(pub String);

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "input error: {}", self.0)
    }
}

impl std::error::Error for InputError {}

/// True when the failure is worth retrying on the same backend: a tagged
/// transient failure or a transport-level timeout/connect error.
pub fn is_transient_failure(err: &anyhow::Error) -> bool {
    // Context layers are only downcastable from the top-level error, not
    // through chain().
    err.downcast_ref::<TransientFailure>().is_some() || is_retryable_transport_error(err)
}

fn is_retryable_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| reqwest_err.is_timeout() || reqwest_err.is_connect())
            .unwrap_or(false)
    })
}

// ---------------------------------------------------------------------------
// Gemini client
// ---------------------------------------------------------------------------

/// Shared handle to the external `generateContent` endpoint. Built once and
/// passed into every adapter; stateless, so clones may be reused across
/// independent pipeline runs.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: HttpClient,
    api_base: String,
    api_key: String,
    timeout_s: f64,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            http: HttpClient::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            timeout_s: DEFAULT_REQUEST_TIMEOUT_S,
        }
    }

    /// Reads credentials from `GEMINI_API_KEY` (or `GOOGLE_API_KEY`) and the
    /// endpoint base from `GEMINI_API_BASE`. A missing key is a
    /// `ConfigError`, raised before any call is made.
    pub fn from_env() -> Result<Self> {
        let api_key = non_empty_env("GEMINI_API_KEY")
            .or_else(|| non_empty_env("GOOGLE_API_KEY"))
            .ok_or_else(|| {
                anyhow::Error::new(ConfigError(
                    "GEMINI_API_KEY or GOOGLE_API_KEY not set".to_string(),
                ))
            })?;
        let api_base = non_empty_env("GEMINI_API_BASE")
            .map(|value| value.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Ok(Self::new(api_key, api_base))
    }

    pub fn with_timeout(mut self, timeout_s: f64) -> Self {
        self.timeout_s = timeout_s;
        self
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    /// One POST, single attempt. Retry policy belongs to callers.
    pub fn generate_content(&self, model: &str, request_payload: &Value) -> Result<Value> {
        let endpoint = self.endpoint_for_model(model);
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", self.api_key.as_str())])
            .timeout(Duration::from_secs_f64(self.timeout_s))
            .json(request_payload)
            .send();

        let response = match response {
            Ok(ok) => ok,
            Err(raw) => {
                let err =
                    anyhow::Error::new(raw).context(format!("request failed ({endpoint})"));
                return Err(if is_retryable_transport_error(&err) {
                    err.context(TransientFailure)
                } else {
                    err
                });
            }
        };
        response_json_or_failure(model, response)
    }
}

fn response_json_or_failure(model: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{model} response body read failed"))?;
    if !status.is_success() {
        let err = anyhow::anyhow!(
            "{model} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
        // 429 and upstream 5xx statuses signal temporary unavailability.
        return Err(if matches!(code, 429 | 500 | 502 | 503 | 504) {
            err.context(TransientFailure)
        } else {
            err
        });
    }
    serde_json::from_str(&body).with_context(|| format!("{model} returned invalid JSON payload"))
}

fn image_part(asset: &ImageAsset) -> Value {
    json!({
        "inlineData": {
            "mimeType": asset.mime_type(),
            "data": BASE64.encode(asset.bytes()),
        }
    })
}

fn text_part(text: &str) -> Value {
    json!({ "text": text })
}

/// Last non-empty text part across the first candidate's content.
fn response_text_part(response_payload: &Value) -> Option<String> {
    let mut found = None;
    for part in response_parts(response_payload) {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            if !text.trim().is_empty() {
                found = Some(text.to_string());
            }
        }
    }
    found
}

/// First inline image part, decoded. A malformed inline payload is a
/// permanent failure.
fn response_image_part(response_payload: &Value) -> Result<Option<ImageAsset>> {
    for part in response_parts(response_payload) {
        let Some(inline) = part
            .get("inlineData")
            .or_else(|| part.get("inline_data"))
            .and_then(Value::as_object)
        else {
            continue;
        };
        let data = inline
            .get("data")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if data.is_empty() {
            continue;
        }
        let bytes = BASE64
            .decode(data.as_bytes())
            .context("inline image base64 decode failed")?;
        let mime_type = inline
            .get("mimeType")
            .or_else(|| inline.get("mime_type"))
            .and_then(Value::as_str)
            .unwrap_or("image/png")
            .to_string();
        return Ok(Some(ImageAsset::new(bytes, mime_type)));
    }
    Ok(None)
}

fn response_parts(response_payload: &Value) -> Vec<Value> {
    response_payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Service adapters
// ---------------------------------------------------------------------------

/// One request to the multimodal analysis service: images plus instruction
/// text in, raw text out. Single attempt; callers that need a second pass
/// issue it explicitly.
pub trait AnalysisService {
    fn analyze(&self, images: &[&ImageAsset], instructions: &str) -> Result<String>;
}

pub struct GeminiAnalysis {
    client: GeminiClient,
    model: String,
}

impl GeminiAnalysis {
    pub fn new(client: GeminiClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl AnalysisService for GeminiAnalysis {
    fn analyze(&self, images: &[&ImageAsset], instructions: &str) -> Result<String> {
        let mut parts: Vec<Value> = images.iter().map(|asset| image_part(asset)).collect();
        parts.push(text_part(instructions));
        let request_payload = json!({
            "contents": [{ "role": "user", "parts": parts }],
        });
        let response_payload = self.client.generate_content(&self.model, &request_payload)?;
        response_text_part(&response_payload)
            .ok_or_else(|| anyhow::anyhow!("analysis response contained no text"))
    }
}

/// Successful generation response. An absent image is a valid outcome, not
/// a failure.
#[derive(Debug, Clone, Default)]
pub struct GenerationOutput {
    pub text: Option<String>,
    pub image: Option<ImageAsset>,
}

/// One attempt against one generation backend. Retry and fallback policy
/// lives in `GenerationAdapter`.
pub trait GenerationService {
    fn generate_once(
        &self,
        model: &str,
        images: &[&ImageAsset],
        instructions: &str,
        edit_target: Option<&ImageAsset>,
    ) -> Result<GenerationOutput>;
}

pub struct GeminiGeneration {
    client: GeminiClient,
}

impl GeminiGeneration {
    pub fn new(client: GeminiClient) -> Self {
        Self { client }
    }
}

impl GenerationService for GeminiGeneration {
    fn generate_once(
        &self,
        model: &str,
        images: &[&ImageAsset],
        instructions: &str,
        edit_target: Option<&ImageAsset>,
    ) -> Result<GenerationOutput> {
        let mut parts: Vec<Value> = images.iter().map(|asset| image_part(asset)).collect();
        if let Some(target) = edit_target {
            parts.push(image_part(target));
        }
        parts.push(text_part(instructions));
        let request_payload = json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": { "responseModalities": ["TEXT", "IMAGE"] },
            "systemInstruction": { "parts": [{ "text": GENERATION_SYSTEM_INSTRUCTION }] },
        });
        let response_payload = self.client.generate_content(model, &request_payload)?;
        Ok(GenerationOutput {
            text: response_text_part(&response_payload),
            image: response_image_part(&response_payload)?,
        })
    }
}

/// Wait before the next attempt on the same backend after transient failure
/// number `attempt` (1-based). Linear, no jitter, so the schedule stays
/// deterministic and testable.
pub fn retry_delay_seconds(backoff_s: f64, attempt: usize) -> f64 {
    backoff_s * attempt as f64
}

/// Ordered-backend generation with bounded retries.
///
/// For each backend identifier in order: up to `MAX_ATTEMPTS_PER_BACKEND`
/// attempts, sleeping `retry_backoff_s * attempt` seconds after each
/// transient failure (including the last one on an identifier). A permanent
/// failure abandons the identifier immediately with zero wait. The first
/// non-failure response wins, image or not.
pub struct GenerationAdapter {
    service: Box<dyn GenerationService>,
    backends: Vec<String>,
    retry_backoff_s: f64,
    events: EventWriter,
}

impl GenerationAdapter {
    pub fn new(
        service: Box<dyn GenerationService>,
        backends: Vec<String>,
        events: EventWriter,
    ) -> Self {
        Self {
            service,
            backends,
            retry_backoff_s: DEFAULT_RETRY_BACKOFF_S,
            events,
        }
    }

    pub fn with_retry_backoff(mut self, retry_backoff_s: f64) -> Self {
        self.retry_backoff_s = retry_backoff_s;
        self
    }

    pub fn backends(&self) -> &[String] {
        &self.backends
    }

    pub fn generate(
        &self,
        images: &[&ImageAsset],
        instructions: &str,
        edit_target: Option<&ImageAsset>,
    ) -> Result<GenerationOutput> {
        let mut failures = 0usize;
        for backend in &self.backends {
            for attempt in 1..=MAX_ATTEMPTS_PER_BACKEND {
                match self
                    .service
                    .generate_once(backend, images, instructions, edit_target)
                {
                    Ok(output) => {
                        self.events.emit(
                            "generation_succeeded",
                            payload(json!({
                                "backend": backend,
                                "attempt": attempt,
                                "has_image": output.image.is_some(),
                                "edit": edit_target.is_some(),
                            })),
                        )?;
                        return Ok(output);
                    }
                    Err(err) if is_transient_failure(&err) => {
                        failures += 1;
                        self.events.emit(
                            "generation_retry",
                            payload(json!({
                                "backend": backend,
                                "attempt": attempt,
                                "error": error_chain_text(&err, 512),
                            })),
                        )?;
                        thread::sleep(Duration::from_secs_f64(retry_delay_seconds(
                            self.retry_backoff_s,
                            attempt,
                        )));
                    }
                    Err(err) => {
                        failures += 1;
                        self.events.emit(
                            "generation_backend_failed",
                            payload(json!({
                                "backend": backend,
                                "attempt": attempt,
                                "error": error_chain_text(&err, 512),
                            })),
                        )?;
                        break;
                    }
                }
            }
        }
        Err(anyhow::Error::new(AllBackendsExhausted {
            backends: self.backends.len(),
            failures,
        }))
    }
}

// ---------------------------------------------------------------------------
// Structured extractor
// ---------------------------------------------------------------------------

/// Two-pass extract-and-merge against the analysis service: a full-protocol
/// pass, then, if any critical field came back weak, a refinement pass whose
/// result is merged additively. A pass-2 failure of any kind degrades to the
/// pass-1 result; a pass-1 failure is fatal.
pub struct StructuredExtractor<'a> {
    analysis: &'a dyn AnalysisService,
    events: EventWriter,
}

impl<'a> StructuredExtractor<'a> {
    pub fn new(analysis: &'a dyn AnalysisService, events: EventWriter) -> Self {
        Self { analysis, events }
    }

    pub fn extract(&self, source: &ImageAsset) -> Result<DescriptionDocument> {
        let raw = self
            .analysis
            .analyze(&[source], ANALYSIS_INSTRUCTION)
            .context("analysis pass 1 failed")?;
        let mut description =
            DescriptionDocument::parse(&raw).context("analysis pass 1 returned an unparsable document")?;

        let weak_fields = description.weak_critical_fields();
        self.events.emit(
            "extract_pass1_completed",
            payload(json!({
                "fields": description.len(),
                "weak_fields": &weak_fields,
            })),
        )?;
        if weak_fields.is_empty() {
            self.events
                .emit("extract_pass2_skipped", payload(json!({})))?;
            return Ok(description);
        }

        let refinement_instruction = REFINEMENT_INSTRUCTION_TEMPLATE
            .replace("{first_pass_json}", &description.to_string_pretty());
        match self
            .analysis
            .analyze(&[source], &refinement_instruction)
            .and_then(|raw| DescriptionDocument::parse(&raw))
        {
            Ok(second_pass) => {
                let adopted = description.merge_from(&second_pass);
                self.events.emit(
                    "extract_merge_applied",
                    payload(json!({
                        "pass2_fields": second_pass.len(),
                        "adopted": adopted,
                        "weak_remaining": description.weak_critical_fields().len(),
                    })),
                )?;
            }
            Err(err) => {
                self.events.emit(
                    "extract_pass2_failed",
                    payload(json!({ "error": error_chain_text(&err, 512) })),
                )?;
            }
        }
        Ok(description)
    }
}

// ---------------------------------------------------------------------------
// Comparator
// ---------------------------------------------------------------------------

/// Scores a candidate against the reference with one analysis call. Any
/// call or parse failure degrades to the sentinel report; this never raises.
pub struct Comparator<'a> {
    analysis: &'a dyn AnalysisService,
    events: EventWriter,
}

impl<'a> Comparator<'a> {
    pub fn new(analysis: &'a dyn AnalysisService, events: EventWriter) -> Self {
        Self { analysis, events }
    }

    pub fn compare(&self, reference: &ImageAsset, candidate: &ImageAsset) -> DifferenceReport {
        match self
            .analysis
            .analyze(&[reference, candidate], COMPARISON_INSTRUCTION)
        {
            Ok(raw) => {
                let report = DifferenceReport::parse(&raw);
                if report.evaluation_failed() {
                    let _ = self.events.emit(
                        "comparison_unparsable",
                        payload(json!({ "body": truncate_text(&raw, 256) })),
                    );
                }
                report
            }
            Err(err) => {
                let _ = self.events.emit(
                    "comparison_failed",
                    payload(json!({ "error": error_chain_text(&err, 512) })),
                );
                DifferenceReport::failed()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Refinement controller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RefinementConfig {
    /// Maximum number of edit-generation rounds after the initial image.
    pub max_rounds: u32,
    /// Score at which the best candidate is accepted and the loop stops.
    pub accept_threshold: i64,
    /// Maximum number of discrepancies applied per correction round.
    pub top_k_fixes: usize,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            max_rounds: 2,
            accept_threshold: 80,
            top_k_fixes: 8,
        }
    }
}

/// An in-flight generation result; lives only inside one controller run.
struct Candidate {
    image: ImageAsset,
    round: u32,
}

/// Drives the bounded generate -> verify -> refine loop, tracking the
/// best-scoring candidate across rounds.
pub struct RefinementController<'a> {
    generation: &'a GenerationAdapter,
    comparator: &'a Comparator<'a>,
    events: EventWriter,
    config: RefinementConfig,
}

impl<'a> RefinementController<'a> {
    pub fn new(
        generation: &'a GenerationAdapter,
        comparator: &'a Comparator<'a>,
        events: EventWriter,
        config: RefinementConfig,
    ) -> Self {
        Self {
            generation,
            comparator,
            events,
            config,
        }
    }

    pub fn run(
        &self,
        reference: &ImageAsset,
        target: &ImageAsset,
        description: &DescriptionDocument,
        user_instructions: Option<&str>,
    ) -> Result<PipelineResult> {
        let mut last_text: Option<String> = None;

        let full_instruction = build_generation_instruction(description, user_instructions);
        let mut initial = self.guarded_generate(
            "initial",
            &[reference, target],
            &full_instruction,
            None,
            &mut last_text,
        )?;
        if initial.is_none() {
            self.events
                .emit("generation_simplified_retry", payload(json!({})))?;
            let simplified = build_simplified_instruction(description);
            initial = self.guarded_generate(
                "initial_simplified",
                &[reference, target],
                &simplified,
                None,
                &mut last_text,
            )?;
        }
        let Some(first_image) = initial else {
            return Ok(PipelineResult {
                best_image: None,
                best_score: -1,
                text: last_text,
                outcome: RunOutcome::FailedTerminal,
                correction_rounds: Vec::new(),
            });
        };

        let mut candidate = Candidate {
            image: first_image,
            round: 0,
        };
        let mut best_score: i64 = -1;
        let mut best_image: Option<ImageAsset> = None;
        let mut correction_rounds: Vec<CorrectionRound> = Vec::new();
        let mut round: u32 = 0;
        // Set by every pass through the top of the loop before any break.
        let mut candidate_verified;

        let outcome = loop {
            let report = self.comparator.compare(reference, &candidate.image);
            candidate_verified = true;
            self.events.emit(
                "candidate_scored",
                payload(json!({
                    "round": round,
                    "candidate_round": candidate.round,
                    "score": report.score,
                    "discrepancies": report.discrepancies.len(),
                })),
            )?;
            if report.evaluation_failed() {
                break RunOutcome::Stalled;
            }
            if report.score > best_score {
                best_score = report.score;
                best_image = Some(candidate.image.clone());
            }
            if best_score >= self.config.accept_threshold {
                break RunOutcome::Accepted;
            }
            if round >= self.config.max_rounds {
                break RunOutcome::RoundsExhausted;
            }
            let fixes = report.select_fixes(self.config.top_k_fixes);
            if fixes.is_empty() {
                break RunOutcome::Stalled;
            }

            round += 1;
            correction_rounds.push(CorrectionRound {
                round,
                score_before: report.score,
                fixes_applied: fixes.iter().map(|fix| fix.fix.clone()).collect(),
            });
            self.events.emit(
                "correction_round",
                payload(json!({
                    "round": round,
                    "score_before": report.score,
                    "fixes": fixes.len(),
                })),
            )?;

            let instruction = build_correction_instruction(&fixes, user_instructions);
            match self.guarded_generate(
                "edit",
                &[reference, target],
                &instruction,
                Some(&candidate.image),
                &mut last_text,
            )? {
                Some(next_image) => {
                    candidate = Candidate {
                        image: next_image,
                        round,
                    };
                    candidate_verified = false;
                }
                None => break RunOutcome::Stalled,
            }
        };

        // An edit-generated candidate that never went back through VERIFY
        // still gets one scoring pass before finalizing.
        if !candidate_verified
            && matches!(outcome, RunOutcome::Stalled | RunOutcome::RoundsExhausted)
        {
            let report = self.comparator.compare(reference, &candidate.image);
            self.events.emit(
                "final_candidate_scored",
                payload(json!({
                    "candidate_round": candidate.round,
                    "score": report.score,
                })),
            )?;
            if !report.evaluation_failed() && report.score > best_score {
                best_score = report.score;
                best_image = Some(candidate.image.clone());
            }
        }

        Ok(PipelineResult {
            best_image,
            best_score,
            text: last_text,
            outcome,
            correction_rounds,
        })
    }

    /// A generation call whose exhaustion is a pipeline decision, not an
    /// error: every backend failing maps to "no image returned".
    fn guarded_generate(
        &self,
        phase: &str,
        images: &[&ImageAsset],
        instructions: &str,
        edit_target: Option<&ImageAsset>,
        last_text: &mut Option<String>,
    ) -> Result<Option<ImageAsset>> {
        self.events.emit(
            "generation_requested",
            payload(json!({
                "phase": phase,
                "instruction_preview": truncate_text(instructions, 240),
            })),
        )?;
        match self.generation.generate(images, instructions, edit_target) {
            Ok(output) => {
                if let Some(text) = output.text {
                    if !text.trim().is_empty() {
                        *last_text = Some(text);
                    }
                }
                Ok(output.image)
            }
            Err(err) => {
                self.events.emit(
                    "generation_backends_exhausted",
                    payload(json!({
                        "phase": phase,
                        "exhausted": err.downcast_ref::<AllBackendsExhausted>().is_some(),
                        "error": error_chain_text(&err, 512),
                    })),
                )?;
                Ok(None)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline engine
// ---------------------------------------------------------------------------

/// Facade owning one run directory: the event log, the shared client, and
/// both adapters. Each `extract`/`transfer` call is one pipeline run;
/// nothing is shared across runs except the stateless client.
pub struct PipelineEngine {
    run_dir: PathBuf,
    run_id: String,
    events: EventWriter,
    analysis: GeminiAnalysis,
    generation: GenerationAdapter,
}

impl PipelineEngine {
    pub fn new(
        run_dir: impl Into<PathBuf>,
        events_path: Option<PathBuf>,
        analysis_model: Option<String>,
        generation_backends: Option<Vec<String>>,
    ) -> Result<Self> {
        let run_dir = run_dir.into();
        fs::create_dir_all(&run_dir)?;
        let run_id = run_dir
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("run-{}", uuid::Uuid::new_v4()));
        let events = EventWriter::new(
            events_path.unwrap_or_else(|| run_dir.join("events.jsonl")),
            run_id.clone(),
        );

        let client = GeminiClient::from_env()?;
        let analysis = GeminiAnalysis::new(
            client.clone(),
            analysis_model.unwrap_or_else(|| DEFAULT_ANALYSIS_MODEL.to_string()),
        );
        let backends = generation_backends.unwrap_or_else(|| {
            DEFAULT_GENERATION_BACKENDS
                .iter()
                .map(|name| name.to_string())
                .collect()
        });
        let generation = GenerationAdapter::new(
            Box::new(GeminiGeneration::new(client)),
            backends,
            events.clone(),
        );

        events.emit(
            "run_started",
            payload(json!({
                "out_dir": run_dir.to_string_lossy().to_string(),
            })),
        )?;

        Ok(Self {
            run_dir,
            run_id,
            events,
            analysis,
            generation,
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn events(&self) -> EventWriter {
        self.events.clone()
    }

    /// Extracts the structured description of a reference image and writes
    /// `description.json` into the run directory.
    pub fn extract(&self, source: &ImageAsset) -> Result<DescriptionDocument> {
        let extractor = StructuredExtractor::new(&self.analysis, self.events.clone());
        let description = extractor.extract(source)?;
        let path = self.run_dir.join("description.json");
        fs::write(&path, description.to_string_pretty())
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(description)
    }

    /// Runs the refinement loop and persists the best candidate plus
    /// `outcome.json` into the run directory.
    pub fn transfer(
        &self,
        reference: &ImageAsset,
        target: &ImageAsset,
        description: &DescriptionDocument,
        user_instructions: Option<&str>,
        config: RefinementConfig,
    ) -> Result<PipelineResult> {
        let comparator = Comparator::new(&self.analysis, self.events.clone());
        let controller =
            RefinementController::new(&self.generation, &comparator, self.events.clone(), config);
        let result = controller.run(reference, target, description, user_instructions)?;

        let image_path = match &result.best_image {
            Some(asset) => Some(self.write_artifact(asset)?),
            None => None,
        };
        let mut extra = Map::new();
        extra.insert(
            "run_id".to_string(),
            Value::String(self.run_id.clone()),
        );
        write_outcome(
            &self.run_dir.join("outcome.json"),
            &result,
            image_path.as_deref(),
            Some(&extra),
        )?;
        self.events.emit(
            "run_finished",
            payload(json!({
                "best_score": result.best_score,
                "outcome": result.outcome.as_str(),
                "correction_rounds": result.correction_rounds.len(),
            })),
        )?;
        Ok(result)
    }

    fn write_artifact(&self, asset: &ImageAsset) -> Result<PathBuf> {
        let path = self.run_dir.join(format!(
            "artifact-{}-{}.{}",
            timestamp_millis(),
            short_hash(asset.bytes()),
            asset.extension(),
        ));
        fs::write(&path, asset.bytes())
            .with_context(|| format!("failed to write {}", path.display()))?;
        let dims = image::load_from_memory(asset.bytes())
            .ok()
            .map(|decoded| (decoded.width(), decoded.height()));
        self.events.emit(
            "artifact_written",
            payload(json!({
                "path": path.to_string_lossy().to_string(),
                "bytes": asset.len(),
                "width": dims.map(|(w, _)| w),
                "height": dims.map(|(_, h)| h),
            })),
        )?;
        Ok(path)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn short_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use drape_contracts::assets::ImageAsset;
    use drape_contracts::description::{DescriptionDocument, CRITICAL_FIELDS};
    use drape_contracts::events::EventWriter;
    use drape_contracts::outcome::RunOutcome;
    use serde_json::{json, Value};

    use super::{
        build_correction_instruction, build_generation_instruction,
        build_simplified_instruction, is_transient_failure, retry_delay_seconds,
        AllBackendsExhausted, AnalysisService, Comparator, GenerationAdapter, GenerationOutput,
        GenerationService, RefinementConfig, RefinementController, StructuredExtractor,
        TransientFailure,
    };

    fn test_events() -> (tempfile::TempDir, EventWriter) {
        let temp = tempfile::tempdir().expect("tempdir");
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "run-test");
        (temp, writer)
    }

    fn asset(tag: &[u8]) -> ImageAsset {
        ImageAsset::new(tag.to_vec(), "image/png")
    }

    // -- fakes --------------------------------------------------------------

    struct ScriptedAnalysis {
        responses: Mutex<VecDeque<Result<String, String>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedAnalysis {
        fn new(responses: Vec<Result<String, String>>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().collect()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().expect("calls lock")
        }
    }

    impl AnalysisService for ScriptedAnalysis {
        fn analyze(&self, _images: &[&ImageAsset], _instructions: &str) -> anyhow::Result<String> {
            *self.calls.lock().expect("calls lock") += 1;
            match self.responses.lock().expect("responses lock").pop_front() {
                Some(Ok(response)) => Ok(response),
                Some(Err(message)) => Err(anyhow::anyhow!(message)),
                None => Err(anyhow::anyhow!("unexpected analysis call")),
            }
        }
    }

    enum GenStep {
        Image(&'static [u8]),
        ImageWithText(&'static [u8], &'static str),
        Empty,
        Transient,
        Permanent,
    }

    #[derive(Debug, PartialEq)]
    struct GenCall {
        backend: String,
        edit: bool,
    }

    struct ScriptedGeneration {
        steps: Mutex<VecDeque<GenStep>>,
        calls: Mutex<Vec<GenCall>>,
    }

    impl ScriptedGeneration {
        fn new(steps: Vec<GenStep>) -> Self {
            Self {
                steps: Mutex::new(steps.into_iter().collect()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl GenerationService for Arc<ScriptedGeneration> {
        fn generate_once(
            &self,
            model: &str,
            _images: &[&ImageAsset],
            _instructions: &str,
            edit_target: Option<&ImageAsset>,
        ) -> anyhow::Result<GenerationOutput> {
            self.calls.lock().expect("calls lock").push(GenCall {
                backend: model.to_string(),
                edit: edit_target.is_some(),
            });
            match self.steps.lock().expect("steps lock").pop_front() {
                Some(GenStep::Image(bytes)) => Ok(GenerationOutput {
                    text: None,
                    image: Some(asset(bytes)),
                }),
                Some(GenStep::ImageWithText(bytes, text)) => Ok(GenerationOutput {
                    text: Some(text.to_string()),
                    image: Some(asset(bytes)),
                }),
                Some(GenStep::Empty) => Ok(GenerationOutput::default()),
                Some(GenStep::Transient) => {
                    Err(anyhow::anyhow!("service overloaded").context(TransientFailure))
                }
                Some(GenStep::Permanent) => Err(anyhow::anyhow!("request rejected")),
                None => Err(anyhow::anyhow!("unexpected generation call")),
            }
        }
    }

    fn adapter(
        steps: Vec<GenStep>,
        backends: &[&str],
        events: EventWriter,
    ) -> (GenerationAdapter, Arc<ScriptedGeneration>) {
        let service = Arc::new(ScriptedGeneration::new(steps));
        let adapter = GenerationAdapter::new(
            Box::new(Arc::clone(&service)),
            backends.iter().map(|name| name.to_string()).collect(),
            events,
        )
        .with_retry_backoff(0.0);
        (adapter, service)
    }

    fn recorded_calls(service: &Arc<ScriptedGeneration>) -> Vec<GenCall> {
        service.calls.lock().expect("calls lock").drain(..).collect()
    }

    fn report_json(score: i64, fixes: &[(&str, &str)]) -> String {
        let discrepancies: Vec<Value> = fixes
            .iter()
            .map(|(severity, fix)| {
                json!({
                    "feature": *fix,
                    "severity": *severity,
                    "expected": "per reference",
                    "observed": "differs",
                    "fix": *fix,
                })
            })
            .collect();
        json!({
            "score": score,
            "summary": "scripted",
            "discrepancies": discrepancies,
        })
        .to_string()
    }

    // -- backoff and fallback -----------------------------------------------

    #[test]
    fn retry_delay_schedule_is_linear() {
        assert_eq!(retry_delay_seconds(10.0, 1), 10.0);
        assert_eq!(retry_delay_seconds(10.0, 2), 20.0);
        assert_eq!(retry_delay_seconds(10.0, 3), 30.0);
    }

    #[test]
    fn transient_failures_retry_same_backend_then_fall_through() {
        let (_temp, events) = test_events();
        let (adapter, service) = adapter(
            vec![
                GenStep::Transient,
                GenStep::Transient,
                GenStep::Transient,
                GenStep::Image(b"ok"),
            ],
            &["primary", "fallback"],
            events,
        );
        let output = adapter
            .generate(&[&asset(b"ref")], "instruction", None)
            .expect("generate");
        assert_eq!(output.image.expect("image").bytes(), b"ok");
        let backends: Vec<String> = recorded_calls(&service)
            .into_iter()
            .map(|call| call.backend)
            .collect();
        assert_eq!(backends, vec!["primary", "primary", "primary", "fallback"]);
    }

    #[test]
    fn permanent_failure_abandons_backend_immediately() {
        let (_temp, events) = test_events();
        let (adapter, service) = adapter(
            vec![GenStep::Permanent, GenStep::Image(b"ok")],
            &["primary", "fallback"],
            events,
        );
        adapter
            .generate(&[&asset(b"ref")], "instruction", None)
            .expect("generate");
        let backends: Vec<String> = recorded_calls(&service)
            .into_iter()
            .map(|call| call.backend)
            .collect();
        assert_eq!(backends, vec!["primary", "fallback"]);
    }

    #[test]
    fn empty_output_is_a_success_not_a_failure() {
        let (_temp, events) = test_events();
        let (adapter, service) = adapter(vec![GenStep::Empty], &["primary", "fallback"], events);
        let output = adapter
            .generate(&[&asset(b"ref")], "instruction", None)
            .expect("generate");
        assert!(output.image.is_none());
        assert_eq!(recorded_calls(&service).len(), 1);
    }

    #[test]
    fn exhausting_every_backend_raises_typed_error() {
        let (_temp, events) = test_events();
        let (adapter, service) = adapter(
            vec![GenStep::Permanent, GenStep::Permanent],
            &["primary", "fallback"],
            events,
        );
        let err = adapter
            .generate(&[&asset(b"ref")], "instruction", None)
            .expect_err("should exhaust");
        let exhausted = err
            .downcast_ref::<AllBackendsExhausted>()
            .expect("typed error");
        assert_eq!(exhausted.backends, 2);
        assert_eq!(exhausted.failures, 2);
        assert_eq!(recorded_calls(&service).len(), 2);
    }

    #[test]
    fn transient_marker_is_detected_through_context() {
        let err = anyhow::anyhow!("overloaded")
            .context(TransientFailure)
            .context("outer");
        assert!(is_transient_failure(&err));
        assert!(!is_transient_failure(&anyhow::anyhow!("plain failure")));
    }

    // -- extractor ----------------------------------------------------------

    fn pass1_json(populated: usize) -> String {
        let mut document = DescriptionDocument::new();
        for field in &CRITICAL_FIELDS[..populated] {
            document.insert(*field, json!(format!("pass one value for {field}")));
        }
        document.to_string_pretty()
    }

    #[test]
    fn extract_skips_pass2_when_nothing_is_weak() {
        let (_temp, events) = test_events();
        let analysis = ScriptedAnalysis::new(vec![Ok(pass1_json(CRITICAL_FIELDS.len()))]);
        let extractor = StructuredExtractor::new(&analysis, events);
        let description = extractor.extract(&asset(b"src")).expect("extract");
        assert!(description.weak_critical_fields().is_empty());
        assert_eq!(analysis.calls(), 1);
    }

    #[test]
    fn extract_backfills_weak_fields_via_pass2() {
        let (_temp, events) = test_events();
        let mut second_pass = DescriptionDocument::new();
        for field in &CRITICAL_FIELDS[3..13] {
            second_pass.insert(*field, json!(format!("pass two value for {field}")));
        }
        let analysis = ScriptedAnalysis::new(vec![
            Ok(pass1_json(3)),
            Ok(second_pass.to_string_pretty()),
        ]);
        let extractor = StructuredExtractor::new(&analysis, events);
        let description = extractor.extract(&asset(b"src")).expect("extract");
        assert_eq!(analysis.calls(), 2);
        assert_eq!(description.weak_critical_fields().len(), 7);
        assert_eq!(
            description.field_str(CRITICAL_FIELDS[4]),
            Some(format!("pass two value for {}", CRITICAL_FIELDS[4]).as_str())
        );
    }

    #[test]
    fn extract_tolerates_code_fences() {
        let (_temp, events) = test_events();
        let fenced = format!("```json\n{}\n```", pass1_json(CRITICAL_FIELDS.len()));
        let analysis = ScriptedAnalysis::new(vec![Ok(fenced)]);
        let extractor = StructuredExtractor::new(&analysis, events);
        assert!(extractor.extract(&asset(b"src")).is_ok());
    }

    #[test]
    fn extract_pass2_parse_failure_degrades_to_pass1() {
        let (_temp, events) = test_events();
        let analysis = ScriptedAnalysis::new(vec![
            Ok(pass1_json(3)),
            Ok("definitely not json".to_string()),
        ]);
        let extractor = StructuredExtractor::new(&analysis, events);
        let description = extractor.extract(&asset(b"src")).expect("extract");
        assert_eq!(analysis.calls(), 2);
        assert_eq!(
            description.weak_critical_fields().len(),
            CRITICAL_FIELDS.len() - 3
        );
    }

    #[test]
    fn extract_pass2_call_failure_degrades_to_pass1() {
        let (_temp, events) = test_events();
        let analysis = ScriptedAnalysis::new(vec![
            Ok(pass1_json(3)),
            Err("service unavailable".to_string()),
        ]);
        let extractor = StructuredExtractor::new(&analysis, events);
        let description = extractor.extract(&asset(b"src")).expect("extract");
        assert_eq!(
            description.weak_critical_fields().len(),
            CRITICAL_FIELDS.len() - 3
        );
    }

    #[test]
    fn extract_pass1_parse_failure_is_fatal() {
        let (_temp, events) = test_events();
        let analysis = ScriptedAnalysis::new(vec![Ok("not a document".to_string())]);
        let extractor = StructuredExtractor::new(&analysis, events);
        assert!(extractor.extract(&asset(b"src")).is_err());
    }

    // -- comparator ---------------------------------------------------------

    #[test]
    fn comparator_degrades_to_sentinel_on_failure() {
        let (_temp, events) = test_events();
        let analysis = ScriptedAnalysis::new(vec![
            Err("boom".to_string()),
            Ok("{broken".to_string()),
            Ok(report_json(88, &[])),
        ]);
        let comparator = Comparator::new(&analysis, events);

        assert!(comparator
            .compare(&asset(b"ref"), &asset(b"cand"))
            .evaluation_failed());
        assert!(comparator
            .compare(&asset(b"ref"), &asset(b"cand"))
            .evaluation_failed());
        assert_eq!(comparator.compare(&asset(b"ref"), &asset(b"cand")).score, 88);
    }

    // -- controller ---------------------------------------------------------

    fn run_controller(
        gen_steps: Vec<GenStep>,
        analysis_responses: Vec<Result<String, String>>,
        config: RefinementConfig,
    ) -> (
        drape_contracts::outcome::PipelineResult,
        Vec<GenCall>,
        usize,
    ) {
        let (_temp, events) = test_events();
        let (adapter, service) = adapter(gen_steps, &["primary"], events.clone());
        let analysis = ScriptedAnalysis::new(analysis_responses);
        let comparator = Comparator::new(&analysis, events.clone());
        let controller = RefinementController::new(&adapter, &comparator, events, config);
        let description = DescriptionDocument::parse(
            r#"{"dress_type": "anarkali kurta", "primary_color": "deep emerald (#0B6E4F)"}"#,
        )
        .expect("description");
        let result = controller
            .run(&asset(b"ref"), &asset(b"target"), &description, None)
            .expect("run");
        let calls = recorded_calls(&service);
        (result, calls, analysis.calls())
    }

    #[test]
    fn best_score_ratchet_keeps_highest_scoring_candidate() {
        let fixes = [("CRITICAL", "match the embroidery"), ("MINOR", "align hem")];
        let (result, calls, _) = run_controller(
            vec![
                GenStep::Image(b"c0"),
                GenStep::Image(b"c1"),
                GenStep::Image(b"c2"),
            ],
            vec![
                Ok(report_json(60, &fixes)),
                Ok(report_json(75, &fixes)),
                Ok(report_json(50, &fixes)),
            ],
            RefinementConfig::default(),
        );
        assert_eq!(result.best_score, 75);
        assert_eq!(result.best_image.expect("image").bytes(), b"c1");
        assert_eq!(result.outcome, RunOutcome::RoundsExhausted);
        assert_eq!(result.correction_rounds.len(), 2);
        assert_eq!(result.correction_rounds[0].round, 1);
        assert_eq!(result.correction_rounds[0].score_before, 60);
        assert_eq!(result.correction_rounds[1].score_before, 75);
        // initial generation, then two edits against the prior candidate
        assert_eq!(calls.len(), 3);
        assert!(!calls[0].edit);
        assert!(calls[1].edit);
        assert!(calls[2].edit);
    }

    #[test]
    fn early_acceptance_skips_correction_entirely() {
        let (result, calls, analysis_calls) = run_controller(
            vec![GenStep::Image(b"c0")],
            vec![Ok(report_json(95, &[("MINOR", "nothing much")]))],
            RefinementConfig::default(),
        );
        assert_eq!(result.best_score, 95);
        assert_eq!(result.outcome, RunOutcome::Accepted);
        assert!(result.correction_rounds.is_empty());
        assert_eq!(calls.len(), 1);
        assert_eq!(analysis_calls, 1);
    }

    #[test]
    fn round_budget_bounds_edit_generation_calls() {
        let fixes = [("CRITICAL", "fix the neckline")];
        let (result, calls, _) = run_controller(
            vec![
                GenStep::Image(b"c0"),
                GenStep::Image(b"c1"),
                GenStep::Image(b"c2"),
            ],
            vec![
                Ok(report_json(10, &fixes)),
                Ok(report_json(20, &fixes)),
                Ok(report_json(30, &fixes)),
            ],
            RefinementConfig::default(),
        );
        assert_eq!(result.outcome, RunOutcome::RoundsExhausted);
        let edit_calls = calls.iter().filter(|call| call.edit).count();
        assert_eq!(edit_calls, 2);
        assert_eq!(result.best_score, 30);
    }

    #[test]
    fn initial_generation_miss_and_simplified_miss_fail_terminally() {
        let (result, calls, analysis_calls) = run_controller(
            vec![GenStep::Empty, GenStep::Empty],
            vec![],
            RefinementConfig::default(),
        );
        assert_eq!(result.best_score, -1);
        assert!(result.best_image.is_none());
        assert_eq!(result.outcome, RunOutcome::FailedTerminal);
        assert!(result.correction_rounds.is_empty());
        assert_eq!(calls.len(), 2);
        assert_eq!(analysis_calls, 0);
    }

    #[test]
    fn exhausted_backends_fall_back_to_simplified_instruction() {
        let (result, calls, _) = run_controller(
            vec![
                GenStep::Permanent, // full instruction: backend exhausted
                GenStep::ImageWithText(b"c0", "done, swapped the outfit"),
            ],
            vec![Ok(report_json(85, &[]))],
            RefinementConfig::default(),
        );
        assert_eq!(result.outcome, RunOutcome::Accepted);
        assert_eq!(result.best_score, 85);
        assert_eq!(result.text.as_deref(), Some("done, swapped the outfit"));
        assert_eq!(calls.len(), 2);
    }

    #[test]
    fn failed_evaluation_stalls_and_keeps_best_so_far() {
        let (result, _, _) = run_controller(
            vec![GenStep::Image(b"c0")],
            vec![Ok("{broken json".to_string())],
            RefinementConfig::default(),
        );
        assert_eq!(result.outcome, RunOutcome::Stalled);
        assert_eq!(result.best_score, -1);
        assert!(result.best_image.is_none());
    }

    #[test]
    fn empty_fix_selection_stalls_with_best_kept() {
        let (result, calls, _) = run_controller(
            vec![GenStep::Image(b"c0")],
            vec![Ok(report_json(50, &[]))],
            RefinementConfig::default(),
        );
        assert_eq!(result.outcome, RunOutcome::Stalled);
        assert_eq!(result.best_score, 50);
        assert_eq!(result.best_image.expect("image").bytes(), b"c0");
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn edit_round_without_image_stalls_keeping_best() {
        let fixes = [("CRITICAL", "fix the border")];
        let (result, calls, _) = run_controller(
            vec![GenStep::Image(b"c0"), GenStep::Empty],
            vec![Ok(report_json(40, &fixes))],
            RefinementConfig::default(),
        );
        assert_eq!(result.outcome, RunOutcome::Stalled);
        assert_eq!(result.best_score, 40);
        assert_eq!(result.correction_rounds.len(), 1);
        assert_eq!(calls.len(), 2);
    }

    #[test]
    fn fix_selection_order_flows_into_correction_history() {
        let fixes = [
            ("MINOR", "minor one"),
            ("CRITICAL", "critical one"),
            ("MINOR", "minor two"),
            ("CRITICAL", "critical two"),
        ];
        let (result, _, _) = run_controller(
            vec![GenStep::Image(b"c0"), GenStep::Empty],
            vec![Ok(report_json(40, &fixes))],
            RefinementConfig {
                top_k_fixes: 4,
                ..RefinementConfig::default()
            },
        );
        assert_eq!(
            result.correction_rounds[0].fixes_applied,
            vec!["critical one", "critical two", "minor one", "minor two"]
        );
    }

    // -- instruction builders -----------------------------------------------

    fn sample_description() -> DescriptionDocument {
        DescriptionDocument::parse(
            r#"{
                "dress_type": "anarkali kurta",
                "primary_color": "deep emerald (#0B6E4F)",
                "neckline": "sweetheart, 6cm deep",
                "embroidery": "gold zari paisley motifs",
                "buttons": "none",
                "jewelry_pieces": [
                    {"type": "kundan choker", "description": "five-strand kundan choker"}
                ],
                "jewelry_reproduction_checklist": "1. match the kundan stones"
            }"#,
        )
        .expect("description")
    }

    #[test]
    fn generation_instruction_skips_weak_fields_and_honors_user_block() {
        let instruction =
            build_generation_instruction(&sample_description(), Some("keep a plain backdrop"));
        assert!(instruction.contains("anarkali kurta"));
        assert!(instruction.contains("Neckline: sweetheart, 6cm deep"));
        assert!(instruction.contains("gold zari paisley motifs"));
        // "buttons": "none" is weak and must not appear as a detail line
        assert!(!instruction.contains("Buttons:"));
        assert!(instruction.contains("USER'S CUSTOM INSTRUCTIONS"));
        assert!(instruction.contains("keep a plain backdrop"));
        assert!(instruction.contains("five-strand kundan choker"));
    }

    #[test]
    fn generation_instruction_flags_missing_jewelry() {
        let description =
            DescriptionDocument::parse(r#"{"dress_type": "slip dress"}"#).expect("description");
        let instruction = build_generation_instruction(&description, None);
        assert!(instruction.contains("Do NOT add any jewelry"));
        assert!(!instruction.contains("USER'S CUSTOM INSTRUCTIONS"));
    }

    #[test]
    fn simplified_instruction_uses_identity_fields_only() {
        let instruction = build_simplified_instruction(&sample_description());
        assert!(instruction.contains("anarkali kurta"));
        assert!(instruction.contains("deep emerald (#0B6E4F)"));
        assert!(!instruction.contains("sweetheart"));
    }

    #[test]
    fn correction_instruction_numbers_fixes() {
        let report = drape_contracts::report::DifferenceReport::parse(&report_json(
            40,
            &[("CRITICAL", "restore the zari border")],
        ));
        let fixes = report.select_fixes(8);
        let instruction = build_correction_instruction(&fixes, None);
        assert!(instruction.contains("1. [restore the zari border] restore the zari border"));
        assert!(instruction.contains("CORRECTIONS:"));
    }
}
