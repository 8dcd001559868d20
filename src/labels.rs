// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 类别标签 (one label per line) and the vehicle / person class ids

use std::fs;
use std::path::Path;

use tracing::info;

use crate::error::Result;

const VEHICLE_NAMES: [&str; 3] = ["car", "truck", "bus"];

#[derive(Debug, Clone)]
pub struct ClassMap {
    pub names: Vec<String>,
    pub vehicle_ids: Vec<usize>,
    pub person_id: usize,
}

impl Default for ClassMap {
    /// COCO ids: person 0, car 2
    fn default() -> Self {
        Self {
            names: Vec::new(),
            vehicle_ids: vec![2],
            person_id: 0,
        }
    }
}

impl ClassMap {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let map = Self::from_names(read_lines(&text));
        info!(
            "🏷️  {} labels from {}, vehicle ids {:?}, person id {}",
            map.names.len(),
            path.as_ref().display(),
            map.vehicle_ids,
            map.person_id
        );
        Ok(map)
    }

    pub fn from_names(names: Vec<String>) -> Self {
        let mut map = Self::default();
        let vehicles: Vec<usize> = names
            .iter()
            .enumerate()
            .filter(|(_, n)| VEHICLE_NAMES.contains(&n.as_str()))
            .map(|(i, _)| i)
            .collect();
        if !vehicles.is_empty() {
            map.vehicle_ids = vehicles;
        }
        if let Some(i) = names.iter().position(|n| n == "person") {
            map.person_id = i;
        }
        map.names = names;
        map
    }

    pub fn is_vehicle(&self, class_id: usize) -> bool {
        self.vehicle_ids.contains(&class_id)
    }

    pub fn is_person(&self, class_id: usize) -> bool {
        self.person_id == class_id
    }

    pub fn name(&self, class_id: usize) -> Option<&str> {
        self.names.get(class_id).map(String::as_str)
    }
}

/// Trimmed non-empty lines
pub fn read_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(|l| l.trim_end_matches('\r').trim())
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}
