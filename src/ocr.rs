// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 车牌字符识别: CTC 贪心解码 (best path)

use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::detection::DetBox;
use crate::error::{LprError, Result};
use crate::pixel::{crop_rgb, RgbResizer};
use crate::runtime::{InferenceRuntime, Tensor};

/// Axis order of the (time, class) matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharLayout {
    /// [T, C]
    TimeMajor,
    /// [C, T]
    ClassMajor,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct OcrResult {
    pub text: String,
    pub confidence: f32,
}

/// One symbol per line; the blank class is index `len`. Lines are kept
/// verbatim apart from the line ending, a space is a real symbol.
pub fn load_keys<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let text = fs::read_to_string(path.as_ref())?;
    let keys: Vec<String> = text
        .lines()
        .map(str::to_string)
        .collect();
    info!("🔤 {} OCR symbols from {}", keys.len(), path.as_ref().display());
    Ok(keys)
}

/// Drop size-1 axes; what remains must be 2-D.
fn squeeze(shape: &[usize]) -> Option<(usize, usize)> {
    let dims: Vec<usize> = shape.iter().copied().filter(|&d| d != 1).collect();
    match dims.as_slice() {
        [a, b] => Some((*a, *b)),
        // a one-step or one-class tensor would squeeze too far
        [a] if shape.len() >= 2 => Some((1, *a)),
        _ => None,
    }
}

pub struct OcrDecoder {
    keys: Vec<String>,
    blank: usize,
    layout: CharLayout,
    steps: usize,
    classes: usize,
}

impl OcrDecoder {
    /// Resolve the axis order once from the model's output shape.
    /// `blank` defaults to the alphabet size.
    pub fn new(keys: Vec<String>, blank: Option<usize>, output_shape: &[usize]) -> Result<Self> {
        let blank = blank.unwrap_or(keys.len());
        let (a, b) = squeeze(output_shape).ok_or_else(|| {
            LprError::model_load(format!("OCR output {output_shape:?} is not a (time, class) matrix"))
        })?;
        let expected = keys.len() + 1;
        let (layout, steps, classes) = if b == expected {
            (CharLayout::TimeMajor, a, b)
        } else if a == expected {
            (CharLayout::ClassMajor, b, a)
        } else {
            // alphabet does not match: larger axis is the class axis
            warn!(
                "OCR output {output_shape:?} does not match {} symbols + blank, guessing by size",
                keys.len()
            );
            if b >= a {
                (CharLayout::TimeMajor, a, b)
            } else {
                (CharLayout::ClassMajor, b, a)
            }
        };
        if blank >= classes {
            return Err(LprError::model_load(format!(
                "blank index {blank} outside {classes} classes"
            )));
        }
        Ok(Self {
            keys,
            blank,
            layout,
            steps,
            classes,
        })
    }

    pub fn layout(&self) -> CharLayout {
        self.layout
    }

    #[inline]
    fn at(&self, data: &[f32], t: usize, c: usize) -> f32 {
        match self.layout {
            CharLayout::TimeMajor => data[t * self.classes + c],
            CharLayout::ClassMajor => data[c * self.steps + t],
        }
    }

    /// Collapse repeats, drop blanks; confidence is the mean probability of
    /// the emitted symbols (0 when nothing is emitted).
    pub fn decode(&self, tensor: &Tensor) -> Result<OcrResult> {
        if tensor.data.len() != self.steps * self.classes {
            return Err(LprError::inference(format!(
                "OCR output {:?} does not match {}x{}",
                tensor.shape, self.steps, self.classes
            )));
        }
        let data = &tensor.data;
        let mut text = String::new();
        let mut probs = Vec::new();
        let mut prev = None;
        let mut row = vec![0f32; self.classes];

        for t in 0..self.steps {
            for (c, v) in row.iter_mut().enumerate() {
                *v = self.at(data, t, c);
            }
            let (best, best_p) = softmax_argmax(&row);
            if best != self.blank && prev != Some(best) {
                // classes past the alphabet (other than blank) carry no symbol
                let sym = if best > self.blank { best - 1 } else { best };
                if let Some(s) = self.keys.get(sym) {
                    text.push_str(s);
                    probs.push(best_p);
                }
            }
            prev = Some(best);
        }

        let confidence = if probs.is_empty() {
            0.0
        } else {
            probs.iter().sum::<f32>() / probs.len() as f32
        };
        Ok(OcrResult { text, confidence })
    }
}

/// (argmax, probability). Rows that already look like a distribution are
/// used as-is, anything else goes through softmax.
fn softmax_argmax(row: &[f32]) -> (usize, f32) {
    let (best, max) = row
        .iter()
        .enumerate()
        .fold((0, f32::MIN), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc });
    let sum: f32 = row.iter().sum();
    if row.iter().all(|v| (0.0..=1.0).contains(v)) && (sum - 1.0).abs() < 1e-3 {
        return (best, max);
    }
    let denom: f32 = row.iter().map(|v| (v - max).exp()).sum();
    (best, 1.0 / denom)
}

/// OCR model + decoder; input is the plate crop resized to the model input.
pub struct Recognizer {
    runtime: Box<dyn InferenceRuntime>,
    decoder: OcrDecoder,
    resizer: RgbResizer,
}

impl Recognizer {
    pub fn new(runtime: Box<dyn InferenceRuntime>, keys: Vec<String>, blank: Option<usize>) -> Result<Self> {
        let shape = runtime
            .output_shapes()
            .first()
            .cloned()
            .ok_or_else(|| LprError::model_load("OCR model has no outputs"))?;
        let decoder = OcrDecoder::new(keys, blank, &shape)?;
        info!("🔤 OCR output {:?} read as {:?}", shape, decoder.layout());
        Ok(Self {
            runtime,
            decoder,
            resizer: RgbResizer::new(),
        })
    }

    pub fn recognize(&mut self, rgb: &[u8], w: u32, h: u32, crop: &DetBox) -> Result<OcrResult> {
        let (pixels, cw, ch) = crop_rgb(rgb, w, crop.x1, crop.y1, crop.x2, crop.y2);
        if cw == 0 || ch == 0 {
            return Ok(OcrResult::default());
        }
        let (in_w, in_h) = self.runtime.input_size();
        let input = self.resizer.resize(&pixels, cw, ch, in_w, in_h)?;
        let outputs = self.runtime.run(&input)?;
        let first = outputs
            .first()
            .ok_or_else(|| LprError::inference("OCR model returned no outputs"))?;
        self.decoder.decode(first)
    }
}
