// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 车牌识别结果 CSV (append-only prediction log)

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::detection::PlateDetection;
use crate::error::Result;
use crate::gen_time_string;

/// Column names match what the offline evaluator reads
pub const HEADER: &str = "frame_id,plate_text_pred,plate_type_pred,conf,x1,y1,x2,y2,timestamp";

/// `,` and line breaks would split the row
fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if matches!(c, ',' | '\n' | '\r') { '_' } else { c })
        .collect()
}

pub struct PredictionLog {
    path: PathBuf,
    out: BufWriter<File>,
    rows: u64,
}

impl PredictionLog {
    /// Open for append; the header goes in only when the file is empty.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let empty = file.metadata()?.len() == 0;
        let mut out = BufWriter::new(file);
        if empty {
            writeln!(out, "{HEADER}")?;
            out.flush()?;
        }
        info!("📝 prediction log: {}", path.display());
        Ok(Self { path, out, rows: 0 })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn append(&mut self, frame_id: u64, plate: &PlateDetection) -> Result<()> {
        let b = &plate.det;
        writeln!(
            self.out,
            "{},{},{},{:.4},{},{},{},{},{}",
            frame_id,
            sanitize(&plate.text),
            sanitize(plate.plate_type.as_str()),
            plate.score(),
            b.x1,
            b.y1,
            b.x2,
            b.y2,
            gen_time_string()
        )?;
        self.out.flush()?;
        self.rows += 1;
        Ok(())
    }
}
