use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use anyhow::{ensure, Result};
use image::{Rgb, RgbImage};
use livecanvas_contracts::GenerationRequest;
use sha2::{Digest, Sha256};

/// Parameters for a single engine call, with the seed already derived.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub seed: u64,
    pub steps: u32,
    pub guidance_scale: f64,
    pub height: u32,
    pub width: u32,
}

impl RenderRequest {
    pub fn from_generation(request: &GenerationRequest) -> Self {
        Self {
            prompt: request.prompt.clone(),
            negative_prompt: request.negative_prompt.clone(),
            seed: render_seed(request.seed),
            steps: request.steps,
            guidance_scale: request.guidance_scale,
            height: request.height,
            width: request.width,
        }
    }
}

/// Bit-for-bit reinterpretation, so every signed seed maps to a distinct
/// engine seed.
pub fn render_seed(seed: i64) -> u64 {
    seed as u64
}

/// The slow, opaque renderer behind the control loop.
///
/// `render` is called synchronously from the control loop thread and may take
/// seconds. There is no timeout around it.
pub trait SynthesisEngine: Send {
    fn name(&self) -> &str;

    fn warmup(&mut self, _passes: usize) -> Result<()> {
        Ok(())
    }

    fn render(&mut self, request: &RenderRequest) -> Result<RgbImage>;
}

impl<E: SynthesisEngine + ?Sized> SynthesisEngine for Box<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn warmup(&mut self, passes: usize) -> Result<()> {
        (**self).warmup(passes)
    }

    fn render(&mut self, request: &RenderRequest) -> Result<RgbImage> {
        (**self).render(request)
    }
}

#[derive(Default)]
pub struct EngineRegistry {
    engines: BTreeMap<String, Box<dyn SynthesisEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<E: SynthesisEngine + 'static>(&mut self, engine: E) {
        self.engines
            .insert(engine.name().to_string(), Box::new(engine));
    }

    pub fn names(&self) -> Vec<String> {
        self.engines.keys().cloned().collect()
    }

    /// Moves the named engine out; the control loop owns it from then on.
    pub fn take(&mut self, name: &str) -> Option<Box<dyn SynthesisEngine>> {
        self.engines.remove(name)
    }
}

pub fn default_engine_registry(dryrun_latency: Duration) -> EngineRegistry {
    let mut engines = EngineRegistry::new();
    engines.register(DryrunEngine::new(dryrun_latency));
    engines
}

/// Deterministic stand-in renderer: a solid frame whose colour is a digest of
/// every parameter.
#[derive(Debug, Clone, Default)]
pub struct DryrunEngine {
    latency: Duration,
}

impl DryrunEngine {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

impl SynthesisEngine for DryrunEngine {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn warmup(&mut self, passes: usize) -> Result<()> {
        let sample = RenderRequest {
            prompt: "the moon, 4k".to_string(),
            negative_prompt: "nsfw, nude".to_string(),
            seed: 0,
            steps: 1,
            guidance_scale: 0.0,
            height: 8,
            width: 8,
        };
        for _ in 0..passes {
            let frame = render_solid_frame(&sample);
            ensure!(frame.dimensions() == (8, 8), "dryrun warmup produced a bad frame");
        }
        Ok(())
    }

    fn render(&mut self, request: &RenderRequest) -> Result<RgbImage> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        Ok(render_solid_frame(request))
    }
}

fn render_solid_frame(request: &RenderRequest) -> RgbImage {
    let (r, g, b) = color_from_request(request);
    RgbImage::from_pixel(request.width, request.height, Rgb([r, g, b]))
}

fn color_from_request(request: &RenderRequest) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(request.prompt.as_bytes());
    hasher.update([0u8]);
    hasher.update(request.negative_prompt.as_bytes());
    hasher.update(request.seed.to_be_bytes());
    hasher.update(request.steps.to_be_bytes());
    hasher.update(request.guidance_scale.to_bits().to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use livecanvas_contracts::GenerationRequest;

    use super::{default_engine_registry, render_seed, RenderRequest, SynthesisEngine};

    fn request(prompt: &str, seed: i64) -> RenderRequest {
        let generation = GenerationRequest {
            prompt: prompt.to_string(),
            seed,
            width: 32,
            height: 16,
            ..GenerationRequest::default()
        };
        RenderRequest::from_generation(&generation)
    }

    #[test]
    fn render_seed_is_injective_on_sign() {
        assert_eq!(render_seed(1), 1);
        assert_eq!(render_seed(-1), u64::MAX);
        assert_ne!(render_seed(-2), render_seed(2));
    }

    #[test]
    fn registry_hands_out_dryrun_once() {
        let mut engines = default_engine_registry(Duration::ZERO);
        assert_eq!(engines.names(), vec!["dryrun".to_string()]);
        assert!(engines.take("dryrun").is_some());
        assert!(engines.take("dryrun").is_none());
        assert!(engines.take("stable-diffusion").is_none());
    }

    #[test]
    fn dryrun_is_deterministic_per_parameter_set() -> anyhow::Result<()> {
        let mut engine = default_engine_registry(Duration::ZERO)
            .take("dryrun")
            .expect("dryrun registered");
        engine.warmup(6)?;

        let first = engine.render(&request("a red kite", 7))?;
        let again = engine.render(&request("a red kite", 7))?;
        let reseeded = engine.render(&request("a red kite", 8))?;

        assert_eq!(first.dimensions(), (32, 16));
        assert_eq!(first, again);
        assert_ne!(first, reseeded);
        Ok(())
    }
}
