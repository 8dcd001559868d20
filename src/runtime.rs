// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 推理运行时边界 (ONNX Runtime)
//!
//! A model takes one RGB888 image at its declared input size and returns
//! a list of f32 tensors. Output shapes are read once at load time so the
//! decoders can pick a layout before the first frame arrives.

use std::path::Path;

use ndarray::{Array4, ArrayViewD, IxDyn};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::TensorRef;
use tracing::{info, warn};

use crate::error::{LprError, Result};

/// Used when a model leaves its spatial input dims dynamic.
const FALLBACK_INPUT: u32 = 640;

/// Dense f32 output tensor
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self { shape, data }
    }

    pub fn view(&self) -> Result<ArrayViewD<'_, f32>> {
        ArrayViewD::from_shape(IxDyn(&self.shape), &self.data)
            .map_err(|e| LprError::inference(format!("tensor shape {:?}: {e}", self.shape)))
    }
}

/// One loaded model.
pub trait InferenceRuntime: Send {
    /// (width, height) the image must be resized to
    fn input_size(&self) -> (u32, u32);

    fn output_shapes(&self) -> &[Vec<usize>];

    /// `rgb` is `width * height * 3` interleaved bytes.
    fn run(&mut self, rgb: &[u8]) -> Result<Vec<Tensor>>;
}

impl<T: InferenceRuntime + ?Sized> InferenceRuntime for Box<T> {
    fn input_size(&self) -> (u32, u32) {
        (**self).input_size()
    }

    fn output_shapes(&self) -> &[Vec<usize>] {
        (**self).output_shapes()
    }

    fn run(&mut self, rgb: &[u8]) -> Result<Vec<Tensor>> {
        (**self).run(rgb)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputLayout {
    Nchw,
    Nhwc,
}

/// Work out channel order and spatial size from a declared 4-D input shape.
pub fn resolve_input(dims: &[i64]) -> Result<(InputLayout, u32, u32)> {
    if dims.len() != 4 {
        return Err(LprError::model_load(format!(
            "expected a 4-D image input, got {dims:?}"
        )));
    }
    let dim = |v: i64| {
        if v > 0 {
            v as u32
        } else {
            FALLBACK_INPUT
        }
    };
    if dims[1] == 3 {
        Ok((InputLayout::Nchw, dim(dims[3]), dim(dims[2])))
    } else if dims[3] == 3 {
        Ok((InputLayout::Nhwc, dim(dims[2]), dim(dims[1])))
    } else {
        Err(LprError::model_load(format!(
            "no 3-channel axis in input shape {dims:?}"
        )))
    }
}

/// u8 RGB → f32 in [0, 1], batch of one
pub fn image_tensor(rgb: &[u8], w: u32, h: u32, layout: InputLayout) -> Result<Array4<f32>> {
    let (w, h) = (w as usize, h as usize);
    if rgb.len() != w * h * 3 {
        return Err(LprError::inference(format!(
            "input holds {} bytes, {w}x{h}x3 expected",
            rgb.len()
        )));
    }
    let t = match layout {
        InputLayout::Nhwc => Array4::from_shape_vec(
            (1, h, w, 3),
            rgb.iter().map(|&v| v as f32 / 255.0).collect(),
        )
        .map_err(|e| LprError::inference(e.to_string()))?,
        InputLayout::Nchw => {
            let mut t = Array4::<f32>::zeros((1, 3, h, w));
            for (i, px) in rgb.chunks_exact(3).enumerate() {
                let (y, x) = (i / w, i % w);
                for c in 0..3 {
                    t[[0, c, y, x]] = px[c] as f32 / 255.0;
                }
            }
            t
        }
    };
    Ok(t)
}

/// ONNX Runtime session + introspected input/output metadata
pub struct OrtRuntime {
    name: String,
    session: Session,
    layout: InputLayout,
    width: u32,
    height: u32,
    output_shapes: Vec<Vec<usize>>,
}

impl OrtRuntime {
    pub fn load<P: AsRef<Path>>(path: P, name: &str) -> Result<Self> {
        let path = path.as_ref();
        let session = Session::builder()
            .map_err(|e| LprError::model_load(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| LprError::model_load(e.to_string()))?
            .commit_from_file(path)
            .map_err(|e| LprError::model_load(format!("{} ({}): {e}", name, path.display())))?;

        let input = session
            .inputs
            .first()
            .ok_or_else(|| LprError::model_load(format!("{name}: model has no inputs")))?;
        let in_dims: Vec<i64> = input
            .input_type
            .tensor_shape()
            .map(|s| s.iter().copied().collect())
            .ok_or_else(|| LprError::model_load(format!("{name}: input is not a tensor")))?;
        let (layout, width, height) = resolve_input(&in_dims)?;

        let declared: Vec<Vec<i64>> = session
            .outputs
            .iter()
            .map(|o| {
                o.output_type
                    .tensor_shape()
                    .map(|s| s.iter().copied().collect())
                    .unwrap_or_default()
            })
            .collect();

        let mut rt = Self {
            name: name.to_string(),
            session,
            layout,
            width,
            height,
            output_shapes: Vec::new(),
        };

        if declared.iter().all(|d| !d.is_empty() && d.iter().all(|&v| v > 0)) {
            rt.output_shapes = declared
                .iter()
                .map(|d| d.iter().map(|&v| v as usize).collect())
                .collect();
        } else {
            // dynamic dims: one blank frame tells us the concrete shapes
            warn!("{name}: dynamic output dims {declared:?}, probing with a blank frame");
            let blank = vec![0u8; (width * height * 3) as usize];
            rt.output_shapes = rt.run(&blank)?.into_iter().map(|t| t.shape).collect();
        }

        info!(
            "🧠 {} loaded from {}: input {}x{} {:?}, outputs {:?}",
            rt.name,
            path.display(),
            rt.width,
            rt.height,
            rt.layout,
            rt.output_shapes
        );
        Ok(rt)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl InferenceRuntime for OrtRuntime {
    fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn output_shapes(&self) -> &[Vec<usize>] {
        &self.output_shapes
    }

    fn run(&mut self, rgb: &[u8]) -> Result<Vec<Tensor>> {
        let input = image_tensor(rgb, self.width, self.height, self.layout)?;
        let tensor_ref =
            TensorRef::from_array_view(&input).map_err(|e| LprError::inference(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| LprError::inference(format!("{}: {e}", self.name)))?;

        let mut tensors = Vec::with_capacity(outputs.len());
        for i in 0..outputs.len() {
            let value = &outputs[i];
            let arr = match value.try_extract_array::<f32>() {
                Ok(a) => a.into_owned(),
                Err(_) => value
                    .try_extract_array::<half::f16>()
                    .map_err(|e| LprError::inference(format!("{} output {i}: {e}", self.name)))?
                    .mapv(|v| v.to_f32()),
            };
            let shape = arr.shape().to_vec();
            let data = arr.iter().copied().collect();
            tensors.push(Tensor::new(shape, data));
        }
        Ok(tensors)
    }
}
