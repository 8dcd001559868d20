// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLO 输出解码
//   Rows:  [1, N, 5+C]  每行 cx cy w h obj cls...
//   Grid:  每个检测头一个张量, anchor 回归 (YOLOv5 风格)
//          center = (2·σ(t) - 0.5 + grid) · stride
//          size   = (2·σ(t))² · anchor

use ndarray::ArrayView2;
use tracing::warn;

use super::DetBox;
use crate::error::{LprError, Result};
use crate::non_max_suppression;
use crate::runtime::Tensor;

/// (w, h) anchors per head, stride 8 / 16 / 32 / 64
const ANCHORS_P3: [(f32, f32); 3] = [(10.0, 13.0), (16.0, 30.0), (33.0, 23.0)];
const ANCHORS_P4: [(f32, f32); 3] = [(30.0, 61.0), (62.0, 45.0), (59.0, 119.0)];
const ANCHORS_P5: [(f32, f32); 3] = [(116.0, 90.0), (156.0, 198.0), (373.0, 326.0)];
const ANCHORS_P6: [(f32, f32); 3] = [(436.0, 615.0), (739.0, 380.0), (925.0, 792.0)];

const NUM_ANCHORS: usize = 3;

#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Probabilities pass through, anything outside [0, 1] is a logit.
#[inline]
fn as_prob(v: f32) -> f32 {
    if (0.0..=1.0).contains(&v) {
        v
    } else {
        sigmoid(v)
    }
}

/// Where the (anchor, component) axis sits in a head tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLayout {
    /// [1, A·K, H, W]
    Nchw,
    /// [1, H, W, A·K]
    Nhwc,
    /// [1, A, H, W, K]
    AnchorMajor,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridHead {
    pub output: usize,
    pub grid_h: usize,
    pub grid_w: usize,
    pub stride: f32,
    pub layout: ChannelLayout,
    pub anchors: [(f32, f32); 3],
}

impl GridHead {
    #[inline]
    fn index(&self, a: usize, gy: usize, gx: usize, k: usize, comps: usize) -> usize {
        let (h, w) = (self.grid_h, self.grid_w);
        match self.layout {
            ChannelLayout::Nchw => ((a * comps + k) * h + gy) * w + gx,
            ChannelLayout::Nhwc => ((gy * w + gx) * NUM_ANCHORS + a) * comps + k,
            ChannelLayout::AnchorMajor => ((a * h + gy) * w + gx) * comps + k,
        }
    }
}

/// Model output layout, resolved once from the introspected shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputLayout {
    Rows {
        output: usize,
        rows: usize,
        cols: usize,
    },
    Grid {
        heads: Vec<GridHead>,
        num_classes: usize,
    },
    Unsupported(String),
}

/// Try to read one output shape as a detection head: (grid_h, grid_w, K, layout).
fn head_shape(shape: &[usize], in_w: u32, in_h: u32) -> Option<(usize, usize, usize, ChannelLayout)> {
    let divides = |gh: usize, gw: usize| {
        gh > 0 && gw > 0 && in_w as usize % gw == 0 && in_h as usize % gh == 0 && {
            let (sx, sy) = (in_w as usize / gw, in_h as usize / gh);
            sx == sy && sx >= 2
        }
    };
    match *shape {
        [1, a, gh, gw, k] if a == NUM_ANCHORS && k >= 6 && divides(gh, gw) => {
            Some((gh, gw, k, ChannelLayout::AnchorMajor))
        }
        [1, c, gh, gw] if c % NUM_ANCHORS == 0 && c / NUM_ANCHORS >= 6 && divides(gh, gw) => {
            Some((gh, gw, c / NUM_ANCHORS, ChannelLayout::Nchw))
        }
        [1, gh, gw, c] if c % NUM_ANCHORS == 0 && c / NUM_ANCHORS >= 6 && divides(gh, gw) => {
            Some((gh, gw, c / NUM_ANCHORS, ChannelLayout::Nhwc))
        }
        _ => None,
    }
}

impl OutputLayout {
    pub fn resolve(shapes: &[Vec<usize>], in_w: u32, in_h: u32) -> Self {
        if let Some((output, s)) = shapes
            .iter()
            .enumerate()
            .find(|(_, s)| s.len() == 3 && s[2] >= 6)
        {
            return OutputLayout::Rows {
                output,
                rows: s[1],
                cols: s[2],
            };
        }

        let mut found: Vec<(usize, usize, usize, usize, ChannelLayout)> = shapes
            .iter()
            .enumerate()
            .filter_map(|(i, s)| head_shape(s, in_w, in_h).map(|(gh, gw, k, l)| (i, gh, gw, k, l)))
            .collect();
        let anchor_sets: &[[(f32, f32); 3]] = match found.len() {
            3 => &[ANCHORS_P3, ANCHORS_P4, ANCHORS_P5],
            4 => &[ANCHORS_P3, ANCHORS_P4, ANCHORS_P5, ANCHORS_P6],
            n => {
                return OutputLayout::Unsupported(format!(
                    "{n} detection heads in {shapes:?} (need a [1,N,5+C] row tensor or 3/4 heads)"
                ))
            }
        };
        let comps = found[0].3;
        if found.iter().any(|f| f.3 != comps) {
            return OutputLayout::Unsupported(format!("heads disagree on class count: {shapes:?}"));
        }
        // finest grid first -> smallest stride -> smallest anchors
        found.sort_by(|a, b| (b.1 * b.2).cmp(&(a.1 * a.2)));
        let heads = found
            .into_iter()
            .zip(anchor_sets)
            .map(|((output, gh, gw, _, layout), anchors)| GridHead {
                output,
                grid_h: gh,
                grid_w: gw,
                stride: in_w as f32 / gw as f32,
                layout,
                anchors: *anchors,
            })
            .collect();
        OutputLayout::Grid {
            heads,
            num_classes: comps - 5,
        }
    }

    pub fn num_classes(&self) -> usize {
        match self {
            OutputLayout::Rows { cols, .. } => cols - 5,
            OutputLayout::Grid { num_classes, .. } => *num_classes,
            OutputLayout::Unsupported(_) => 0,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, OutputLayout::Unsupported(_))
    }
}

/// Model-input → frame scale and conf filter shared by both layouts
pub struct DecodeParams {
    pub conf_threshold: f32,
    pub nms_iou: f32,
    pub in_w: u32,
    pub in_h: u32,
    pub frame_w: u32,
    pub frame_h: u32,
}

impl DecodeParams {
    fn to_frame(&self, cx: f32, cy: f32, bw: f32, bh: f32, conf: f32, class_id: usize) -> DetBox {
        let sx = self.frame_w as f32 / self.in_w as f32;
        let sy = self.frame_h as f32 / self.in_h as f32;
        DetBox::new(
            ((cx - bw * 0.5) * sx) as i32,
            ((cy - bh * 0.5) * sy) as i32,
            ((cx + bw * 0.5) * sx) as i32,
            ((cy + bh * 0.5) * sy) as i32,
            conf,
            class_id,
        )
        .clamp(self.frame_w, self.frame_h)
    }
}

fn decode_rows(t: &Tensor, rows: usize, cols: usize, p: &DecodeParams, out: &mut Vec<DetBox>) -> Result<()> {
    let view = ArrayView2::from_shape((rows, cols), &t.data)
        .map_err(|e| LprError::inference(format!("row output {:?}: {e}", t.shape)))?;
    for r in view.outer_iter() {
        let (best_id, best) = r
            .iter()
            .skip(5)
            .enumerate()
            .fold((0usize, f32::MIN), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc });
        let conf = as_prob(r[4]) * as_prob(best);
        if conf < p.conf_threshold {
            continue;
        }
        let (mut cx, mut cy, mut bw, mut bh) = (r[0], r[1], r[2], r[3]);
        // normalised boxes
        if bw <= 2.0 && bh <= 2.0 {
            cx *= p.in_w as f32;
            cy *= p.in_h as f32;
            bw *= p.in_w as f32;
            bh *= p.in_h as f32;
        }
        out.push(p.to_frame(cx, cy, bw, bh, conf, best_id));
    }
    Ok(())
}

fn decode_head(t: &[f32], head: &GridHead, comps: usize, p: &DecodeParams, out: &mut Vec<DetBox>) {
    for gy in 0..head.grid_h {
        for gx in 0..head.grid_w {
            for (a, &(aw, ah)) in head.anchors.iter().enumerate() {
                let at = |k: usize| t[head.index(a, gy, gx, k, comps)];
                let obj = sigmoid(at(4));
                if obj < p.conf_threshold {
                    continue;
                }
                let (mut best_id, mut best) = (0, f32::MIN);
                for c in 0..comps - 5 {
                    let v = at(5 + c);
                    if v > best {
                        best = v;
                        best_id = c;
                    }
                }
                let conf = obj * sigmoid(best);
                if conf < p.conf_threshold {
                    continue;
                }
                let cx = (2.0 * sigmoid(at(0)) - 0.5 + gx as f32) * head.stride;
                let cy = (2.0 * sigmoid(at(1)) - 0.5 + gy as f32) * head.stride;
                let bw = (2.0 * sigmoid(at(2))).powi(2) * aw;
                let bh = (2.0 * sigmoid(at(3))).powi(2) * ah;
                out.push(p.to_frame(cx, cy, bw, bh, conf, best_id));
            }
        }
    }
}

/// Frame-space boxes after confidence filter, clamp and class-wise NMS.
pub fn decode(layout: &OutputLayout, outputs: &[Tensor], p: &DecodeParams) -> Result<Vec<DetBox>> {
    let mut boxes = Vec::new();
    match layout {
        OutputLayout::Rows { output, rows, cols } => {
            let t = outputs
                .get(*output)
                .ok_or_else(|| LprError::inference(format!("missing output {output}")))?;
            if t.data.len() != rows * cols {
                return Err(LprError::inference(format!(
                    "row output has {} values, expected {rows}x{cols}",
                    t.data.len()
                )));
            }
            decode_rows(t, *rows, *cols, p, &mut boxes)?;
        }
        OutputLayout::Grid { heads, num_classes } => {
            let comps = num_classes + 5;
            for head in heads {
                let t = outputs
                    .get(head.output)
                    .ok_or_else(|| LprError::inference(format!("missing output {}", head.output)))?;
                let expected = head.grid_h * head.grid_w * NUM_ANCHORS * comps;
                if t.data.len() != expected {
                    return Err(LprError::inference(format!(
                        "head {} has {} values, expected {expected}",
                        head.output,
                        t.data.len()
                    )));
                }
                decode_head(&t.data, head, comps, p, &mut boxes);
            }
        }
        OutputLayout::Unsupported(why) => {
            warn!("decode skipped: {why}");
        }
    }
    non_max_suppression(&mut boxes, p.nms_iou);
    Ok(boxes)
}
