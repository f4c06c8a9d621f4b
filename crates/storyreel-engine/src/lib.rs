use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use storyreel_contracts::breakdown::ScriptBreakdown;
use storyreel_contracts::cache::{
    fingerprint, AssetCache, CacheLimits, CacheStats, JsonFileBackend,
};
use storyreel_contracts::events::{now_utc_iso, EventWriter};
use uuid::Uuid;

/// Parameters identifying one asset generation. The fingerprint is taken
/// over the fields in declaration order; any change to any of them is a
/// different asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRequest {
    pub prompt: String,
    #[serde(default = "default_style")]
    pub style: String,
    #[serde(default = "default_resolution")]
    pub resolution: String,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: String,
    #[serde(default)]
    pub seed: i64,
}

impl AssetRequest {
    pub fn fingerprint(&self) -> String {
        let seed = self.seed.to_string();
        fingerprint(&[
            &self.prompt,
            &self.style,
            &self.resolution,
            &self.aspect_ratio,
            &seed,
        ])
    }
}

fn default_style() -> String {
    "cinematic".to_string()
}

fn default_resolution() -> String {
    "1280x720".to_string()
}

fn default_aspect_ratio() -> String {
    "16:9".to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedAsset {
    pub payload: String,
    pub media_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssetOutcome {
    pub fingerprint: String,
    pub payload: String,
    pub cached: bool,
}

/// External-collaborator seam for the actual (expensive) generation call.
pub trait AssetGenerator: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &AssetRequest) -> Result<GeneratedAsset>;
}

/// Offline generator producing deterministic placeholder payloads: a
/// sha256 digest of the request expanded to a size proportional to the
/// requested resolution, base64-wrapped as a data URI. Identical requests
/// yield byte-identical payloads, which is what the cache tests and the
/// dryrun workflow need.
pub struct DryrunGenerator;

impl AssetGenerator for DryrunGenerator {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &AssetRequest) -> Result<GeneratedAsset> {
        let mut hasher = Sha256::new();
        hasher.update(request.prompt.as_bytes());
        hasher.update(request.style.as_bytes());
        hasher.update(request.resolution.as_bytes());
        hasher.update(request.aspect_ratio.as_bytes());
        hasher.update(request.seed.to_be_bytes());
        let digest = hasher.finalize();

        let (width, height) = parse_dims(&request.resolution);
        let reps = ((width as usize * height as usize) / 16_384).clamp(16, 256);
        let mut bytes = Vec::with_capacity(reps * digest.len());
        for _ in 0..reps {
            bytes.extend_from_slice(&digest);
        }

        Ok(GeneratedAsset {
            payload: format!("data:image/png;base64,{}", BASE64.encode(&bytes)),
            media_type: "image/png".to_string(),
        })
    }
}

fn parse_dims(resolution: &str) -> (u32, u32) {
    let mut parts = resolution.split('x');
    let width = parts.next().and_then(|value| value.trim().parse().ok());
    let height = parts.next().and_then(|value| value.trim().parse().ok());
    match (width, height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => (1024, 1024),
    }
}

/// Per-run orchestrator: owns the event log and the bounded asset cache,
/// and drives script recovery and memoized asset generation around an
/// injected generator.
pub struct ProductionEngine {
    run_dir: PathBuf,
    run_id: String,
    events: EventWriter,
    cache: AssetCache,
    generator: Box<dyn AssetGenerator>,
    started_at: String,
}

impl ProductionEngine {
    pub fn new(
        run_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        generator: Box<dyn AssetGenerator>,
        limits: CacheLimits,
    ) -> Result<Self> {
        let run_dir = run_dir.into();
        std::fs::create_dir_all(&run_dir)
            .with_context(|| format!("failed to create {}", run_dir.display()))?;
        let run_id = run_dir
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("run-{}", Uuid::new_v4().simple()));
        let events = EventWriter::new(events_path.into(), run_id.clone());
        let cache = AssetCache::open(
            Box::new(JsonFileBackend::new(run_dir.join("assets.json"))),
            limits,
            Some(events.clone()),
        );
        let started_at = now_utc_iso();

        events.emit(
            "run_started",
            json!({
                "out_dir": run_dir.to_string_lossy().to_string(),
                "generator": generator.name(),
            }),
        )?;

        Ok(Self {
            run_dir,
            run_id,
            events,
            cache,
            generator,
            started_at,
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn started_at(&self) -> &str {
        &self.started_at
    }

    pub fn event_writer(&self) -> EventWriter {
        self.events.clone()
    }

    pub fn emit_event(&self, event: &str, fields: Value) -> Result<()> {
        self.events.emit(event, fields)
    }

    /// Recover a script breakdown from raw model output. Unrecoverable
    /// output is an error for this call only; the caller is expected to
    /// surface a retry path, not crash the run.
    pub fn breakdown_script(&self, model_text: &str) -> Result<ScriptBreakdown> {
        self.events.emit(
            "breakdown_requested",
            json!({ "chars": model_text.chars().count() }),
        )?;
        match ScriptBreakdown::from_model_text(model_text) {
            Ok(breakdown) => {
                self.events.emit(
                    "breakdown_ready",
                    json!({
                        "characters": breakdown.characters.len(),
                        "scenes": breakdown.scenes.len(),
                    }),
                )?;
                Ok(breakdown)
            }
            Err(err) => {
                self.events
                    .emit("breakdown_failed", json!({ "error": format!("{err:#}") }))?;
                Err(err)
            }
        }
    }

    /// Produce the asset for a request, consulting the cache first. A hit
    /// skips generation entirely; a miss generates, memoizes, and lets
    /// the cache sweep itself in the background. Cache trouble never
    /// fails this call; only the generator can.
    pub fn scene_asset(&self, request: &AssetRequest) -> Result<AssetOutcome> {
        let key = request.fingerprint();
        if let Some(payload) = self.cache.get(&key) {
            self.events
                .emit("asset_cache_hit", json!({ "fingerprint": key }))?;
            return Ok(AssetOutcome {
                fingerprint: key,
                payload,
                cached: true,
            });
        }

        let asset = self
            .generator
            .generate(request)
            .with_context(|| format!("asset generation failed ({})", self.generator.name()))?;
        self.cache.put(&key, &asset.payload);
        self.events.emit(
            "asset_generated",
            json!({
                "fingerprint": key,
                "generator": self.generator.name(),
                "media_type": asset.media_type,
                "approx_bytes": storyreel_contracts::cache::approx_payload_bytes(&asset.payload),
            }),
        )?;
        Ok(AssetOutcome {
            fingerprint: key,
            payload: asset.payload,
            cached: false,
        })
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Converge the cache bounds synchronously; useful before reading
    /// stats at scale, and in tests.
    pub fn sweep_cache(&self) {
        self.cache.evict();
    }

    pub fn finish(&self) -> Result<()> {
        self.cache.close();
        self.events
            .emit("run_finished", json!({ "started_at": self.started_at }))?;
        Ok(())
    }
}
