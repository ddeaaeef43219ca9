use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use thiserror::Error;
use tracing::{info, warn};

/// Source dataset stores resolution in mm/pixel; the index keeps um/pixel.
pub const RESOLUTION_SCALE: f64 = 1000.0;

/// Resolution reported when the index has nothing for an image.
pub const DEFAULT_RESOLUTION: f64 = 1.0;

/// Column names read from the image-paths dataset.
#[derive(Debug, Clone)]
pub struct IndexColumns {
    pub volume: String,
    pub path: String,
    pub image_number: String,
    pub resolution: String,
}

impl Default for IndexColumns {
    fn default() -> Self {
        Self {
            volume: "id".to_string(),
            path: "file_path_coris".to_string(),
            image_number: "ImageNumber".to_string(),
            resolution: "resolution".to_string(),
        }
    }
}

/// A volume: its slice paths in ascending image-number order.
#[derive(Debug, Clone)]
struct VolumeRecord {
    images: Vec<String>,
    base_dir: PathBuf,
    /// um/pixel, already scaled. Only images with a value in the dataset.
    resolutions: HashMap<String, f64>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NavigationError {
    #[error("No volumes available")]
    NoVolumes,
    #[error("Current volume not found")]
    UnknownVolume(String),
}

/// Read-only lookup from volume id to its ordered images, directory and
/// per-image resolution. Built once; rebuilding means loading a new one.
#[derive(Debug, Clone, Default)]
pub struct VolumeIndex {
    volumes: BTreeMap<String, VolumeRecord>,
}

struct PendingImage {
    number: i64,
    path: String,
    resolution: Option<f64>,
}

impl VolumeIndex {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load the dataset at `path`. An unreadable or malformed file is logged
    /// and yields an empty index so the server still starts.
    pub fn load(path: &Path, columns: &IndexColumns) -> Self {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(err) => {
                warn!(
                    "image paths file unreadable path={} err={}; starting with empty index",
                    path.display(),
                    err
                );
                return Self::empty();
            }
        };
        match Self::from_reader(file, columns) {
            Ok(index) => {
                info!(
                    "loaded volumes={} images={} path={} volume_column={} path_column={}",
                    index.len(),
                    index.image_count(),
                    path.display(),
                    columns.volume,
                    columns.path
                );
                index
            }
            Err(err) => {
                warn!(
                    "error parsing image paths path={} err={:#}; starting with empty index",
                    path.display(),
                    err
                );
                Self::empty()
            }
        }
    }

    /// Build the index from CSV data. Rows whose image number is empty or
    /// not positive, or whose volume or path cell is empty, are dropped
    /// before grouping.
    pub fn from_reader<R: Read>(reader: R, columns: &IndexColumns) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
        let headers = rdr.headers().context("reading header row")?.clone();
        let find = |name: &str| headers.iter().position(|h| h.trim() == name);
        let volume_col = find(&columns.volume)
            .ok_or_else(|| anyhow!("missing volume column {:?}", columns.volume))?;
        let path_col =
            find(&columns.path).ok_or_else(|| anyhow!("missing path column {:?}", columns.path))?;
        let number_col = find(&columns.image_number)
            .ok_or_else(|| anyhow!("missing image number column {:?}", columns.image_number))?;
        let resolution_col = find(&columns.resolution);

        let mut groups: BTreeMap<String, (PathBuf, Vec<PendingImage>)> = BTreeMap::new();
        for (row, record) in rdr.records().enumerate() {
            let record = record.with_context(|| format!("reading row {}", row + 1))?;
            let cell = |idx: usize| record.get(idx).map(str::trim).unwrap_or("");

            let number_cell = cell(number_col);
            if number_cell.is_empty() {
                continue;
            }
            let number = parse_image_number(number_cell)
                .with_context(|| format!("row {}: image number {:?}", row + 1, number_cell))?;
            if number <= 0 {
                continue;
            }

            let path = cell(path_col);
            if path.is_empty() {
                continue;
            }
            let resolution = match resolution_col.map(cell) {
                Some(value) if !value.is_empty() => {
                    let raw: f64 = value
                        .parse()
                        .with_context(|| format!("row {}: resolution {:?}", row + 1, value))?;
                    Some(raw * RESOLUTION_SCALE)
                }
                _ => None,
            };

            let volume = cell(volume_col);
            if volume.is_empty() {
                continue;
            }
            let entry = groups.entry(volume.to_string()).or_insert_with(|| {
                let dir = Path::new(path).parent().map(Path::to_path_buf).unwrap_or_default();
                (dir, Vec::new())
            });
            entry.1.push(PendingImage {
                number,
                path: path.to_string(),
                resolution,
            });
        }

        let volumes = groups
            .into_iter()
            .map(|(id, (base_dir, mut pending))| {
                pending.sort_by_key(|p| p.number);
                let resolutions = pending
                    .iter()
                    .filter_map(|p| p.resolution.map(|r| (p.path.clone(), r)))
                    .collect();
                let record = VolumeRecord {
                    images: pending.into_iter().map(|p| p.path).collect(),
                    base_dir,
                    resolutions,
                };
                (id, record)
            })
            .collect();
        Ok(Self { volumes })
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    pub fn image_count(&self) -> usize {
        self.volumes.values().map(|v| v.images.len()).sum()
    }

    /// Volume ids in ascending lexicographic order.
    pub fn volume_ids(&self) -> impl Iterator<Item = &str> {
        self.volumes.keys().map(String::as_str)
    }

    /// Ordered image paths; empty for an unknown volume.
    pub fn image_paths(&self, volume: &str) -> Vec<&str> {
        self.volumes
            .get(volume)
            .map(|v| v.images.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn base_dir(&self, volume: &str) -> Option<&Path> {
        self.volumes.get(volume).map(|v| v.base_dir.as_path())
    }

    pub fn resolution(&self, volume: &str, filepath: &str) -> f64 {
        self.volumes
            .get(volume)
            .and_then(|v| v.resolutions.get(filepath).copied())
            .unwrap_or(DEFAULT_RESOLUTION)
    }

    pub fn resolve_path(&self, volume: &str, filename: &str) -> Option<PathBuf> {
        self.base_dir(volume).map(|dir| dir.join(filename))
    }

    /// Volume after `current` in sorted order; `Ok(None)` past the end.
    pub fn next_volume(&self, current: &str) -> Result<Option<&str>, NavigationError> {
        self.check_navigable(current)?;
        Ok(self
            .volumes
            .range::<str, _>((Bound::Excluded(current), Bound::Unbounded))
            .next()
            .map(|(id, _)| id.as_str()))
    }

    /// Volume before `current` in sorted order; `Ok(None)` at the start.
    pub fn previous_volume(&self, current: &str) -> Result<Option<&str>, NavigationError> {
        self.check_navigable(current)?;
        Ok(self
            .volumes
            .range::<str, _>((Bound::Unbounded, Bound::Excluded(current)))
            .next_back()
            .map(|(id, _)| id.as_str()))
    }

    fn check_navigable(&self, current: &str) -> Result<(), NavigationError> {
        if self.volumes.is_empty() {
            return Err(NavigationError::NoVolumes);
        }
        if !self.volumes.contains_key(current) {
            return Err(NavigationError::UnknownVolume(current.to_string()));
        }
        Ok(())
    }
}

/// Accepts integral floats ("3.0") since spreadsheet exports write them.
fn parse_image_number(value: &str) -> Result<i64> {
    if let Ok(n) = value.parse::<i64>() {
        return Ok(n);
    }
    let f: f64 = value.parse()?;
    if f.is_finite() && f.fract() == 0.0 {
        Ok(f as i64)
    } else {
        Err(anyhow!("not an integer"))
    }
}
