use image::imageops::FilterType;
use image::RgbImage;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::Path;
use tracing::debug;

use crate::config::ObservationSpec;
use crate::error::{HarnessError, Result};

// ITU-R 709 luma, as used for the training images.
const LUMA_R: f64 = 0.2125;
const LUMA_G: f64 = 0.7154;
const LUMA_B: f64 = 0.0721;

#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// Stacked grayscale frames, row-major `[stack, height, width]`.
    Image { data: Vec<u8>, shape: [usize; 3] },
    Features(Vec<f32>),
}

impl Observation {
    pub fn zeros(spec: &ObservationSpec) -> Self {
        match *spec {
            ObservationSpec::Image {
                stack,
                width,
                height,
            } => {
                let shape = [stack, height as usize, width as usize];
                Observation::Image {
                    data: vec![0; shape.iter().product()],
                    shape,
                }
            }
            ObservationSpec::Features { len } => Observation::Features(vec![0.0; len]),
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        match self {
            Observation::Image { shape, .. } => shape.to_vec(),
            Observation::Features(v) => vec![v.len()],
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Observation::Image { data, .. } => data.iter().all(|&b| b == 0),
            Observation::Features(v) => v.iter().all(|&x| x == 0.0),
        }
    }
}

// =============================================================================
// Frame Stack
// =============================================================================

/// The `depth` most recent frames. Always yields exactly `depth` frames: while
/// fewer have arrived, the newest one fills the remaining slots.
#[derive(Debug, Clone)]
pub struct ObservationStack {
    depth: usize,
    frames: VecDeque<Vec<u8>>,
}

impl ObservationStack {
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            depth,
            frames: VecDeque::with_capacity(depth),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn push(&mut self, frame: Vec<u8>) {
        if self.frames.len() == self.depth {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// Concatenates the frames oldest first, padding with copies of the newest.
    pub fn stacked(&self) -> Vec<u8> {
        let Some(last) = self.frames.back() else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(self.depth * last.len());
        for frame in &self.frames {
            out.extend_from_slice(frame);
        }
        for _ in self.frames.len()..self.depth {
            out.extend_from_slice(last);
        }
        out
    }
}

// =============================================================================
// Decoding
// =============================================================================

pub(crate) fn to_gray(rgb: &RgbImage) -> Vec<u8> {
    rgb.pixels()
        .map(|p| {
            let [r, g, b] = p.0;
            (LUMA_R * f64::from(r) + LUMA_G * f64::from(g) + LUMA_B * f64::from(b)) as u8
        })
        .collect()
}

fn load_gray(path: &Path, width: u32, height: u32) -> Result<Vec<u8>> {
    let rgb = image::open(path)?.to_rgb8();
    let resized = if rgb.dimensions() == (width, height) {
        rgb
    } else {
        image::imageops::resize(&rgb, width, height, FilterType::Triangle)
    };
    Ok(to_gray(&resized))
}

/// Frames stay in the stack across episode resets.
pub struct ObservationPipeline {
    spec: ObservationSpec,
    stack: ObservationStack,
}

impl ObservationPipeline {
    pub fn new(spec: ObservationSpec) -> Self {
        let depth = match spec {
            ObservationSpec::Image { stack, .. } => stack,
            ObservationSpec::Features { .. } => 1,
        };
        Self {
            spec,
            stack: ObservationStack::new(depth),
        }
    }

    pub fn spec(&self) -> &ObservationSpec {
        &self.spec
    }

    pub fn zeros(&self) -> Observation {
        Observation::zeros(&self.spec)
    }

    /// Turns a raw observation payload into the caller-facing observation.
    /// Image payloads point at a single-use file that is deleted once read.
    pub fn read(&mut self, payload: &Value) -> Result<Observation> {
        match self.spec {
            ObservationSpec::Image {
                stack,
                width,
                height,
            } => {
                let path = payload
                    .get("img")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        HarnessError::protocol(format!("image observation without img path: {payload}"))
                    })?;
                let path = Path::new(path);
                let frame = load_gray(path, width, height)?;
                std::fs::remove_file(path)?;
                debug!(path = %path.display(), "consumed observation image");
                self.stack.push(frame);
                Ok(Observation::Image {
                    data: self.stack.stacked(),
                    shape: [stack, height as usize, width as usize],
                })
            }
            ObservationSpec::Features { len } => {
                let values = payload.as_array().ok_or_else(|| {
                    HarnessError::protocol(format!("feature observation is not an array: {payload}"))
                })?;
                if values.len() != len {
                    return Err(HarnessError::protocol(format!(
                        "expected {len} observation features, got {}",
                        values.len()
                    )));
                }
                let features = values
                    .iter()
                    .map(|v| {
                        v.as_f64().map(|x| x as f32).ok_or_else(|| {
                            HarnessError::protocol(format!("non-numeric observation feature {v}"))
                        })
                    })
                    .collect::<Result<Vec<f32>>>()?;
                Ok(Observation::Features(features))
            }
        }
    }
}
