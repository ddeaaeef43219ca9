//! Per-volume annotation CSV files.
//!
//! Files are always written in the canonical layout
//! `volume_id,index,filepath,line_index,x,color`, but older files on disk may
//! use one of two earlier layouts. Every row is decoded into an
//! [`AnnotationRow`] variant and then normalized to an [`AnnotationLine`].

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

pub const DEFAULT_COLOR: &str = "red";

/// Fallback palette for current-layout rows without a color. Lines come in
/// min/max pairs, so `line_index / 2` picks the entry.
pub const LINE_PALETTE: [&str; 8] = [
    "red", "blue", "green", "orange", "purple", "cyan", "magenta", "yellow",
];

const CANONICAL_HEADER: [&str; 6] = ["volume_id", "index", "filepath", "line_index", "x", "color"];
const UNSCOPED_FILE: &str = "lines.csv";

/// A line as submitted by the viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineInput {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub color: Option<String>,
}

/// All lines drawn on one image, in drawing order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageLines {
    pub filepath: String,
    pub index: i64,
    #[serde(default)]
    pub lines: Vec<LineInput>,
}

/// A stored line, normalized across file layouts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnnotationLine {
    pub x: f64,
    pub color: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageAnnotations {
    pub filepath: String,
    pub lines: Vec<AnnotationLine>,
}

#[derive(Serialize)]
struct CanonicalRow<'a> {
    volume_id: &'a str,
    index: i64,
    filepath: &'a str,
    line_index: usize,
    x: f64,
    color: &'a str,
}

pub fn palette_color(line_index: usize) -> &'static str {
    LINE_PALETTE[(line_index / 2) % LINE_PALETTE.len()]
}

/// Reads and replaces annotation files under one output directory.
#[derive(Debug, Clone)]
pub struct AnnotationStore {
    dir: PathBuf,
}

impl AnnotationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<volume>_lines.csv`, or `lines.csv` without a volume.
    pub fn file_path(&self, volume: Option<&str>) -> PathBuf {
        match volume.filter(|v| !v.is_empty()) {
            Some(v) => self.dir.join(format!("{}_lines.csv", v.replace(['/', '\\'], "_"))),
            None => self.dir.join(UNSCOPED_FILE),
        }
    }

    pub fn exists(&self, volume: &str) -> bool {
        self.file_path(Some(volume)).is_file()
    }

    /// Replace the volume's file with `images`, one row per line. Rows go to a
    /// uniquely named temp file in the same directory, which is then renamed
    /// over the target.
    pub fn save(&self, volume: Option<&str>, images: &[ImageLines]) -> Result<PathBuf> {
        let volume = volume.filter(|v| !v.is_empty());
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.file_path(volume);
        let mut tmp = NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("creating temp file in {}", self.dir.display()))?;

        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(tmp.as_file_mut());
        wtr.write_record(CANONICAL_HEADER)?;
        let mut rows = 0usize;
        for image in images {
            for (line_index, line) in image.lines.iter().enumerate() {
                wtr.serialize(CanonicalRow {
                    volume_id: volume.unwrap_or(""),
                    index: image.index,
                    filepath: &image.filepath,
                    line_index,
                    x: line.x,
                    color: line.color.as_deref().unwrap_or(DEFAULT_COLOR),
                })?;
                rows += 1;
            }
        }
        wtr.flush()?;
        drop(wtr);
        tmp.persist(&path)
            .with_context(|| format!("replacing {}", path.display()))?;

        info!(
            "annotations saved volume={} images={} rows={} path={}",
            volume.unwrap_or("-"),
            images.len(),
            rows,
            path.display()
        );
        Ok(path)
    }

    /// Lines grouped by filepath in first-seen order. A missing file is an
    /// empty result.
    pub fn load(&self, volume: &str) -> Result<Vec<ImageAnnotations>> {
        let path = self.file_path(Some(volume));
        if !path.is_file() {
            debug!("no annotation file volume={} path={}", volume, path.display());
            return Ok(Vec::new());
        }
        let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        parse_annotations(file).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Column positions of a file's header. Every row is decoded against it.
#[derive(Debug, Default)]
struct Columns {
    volume_id: Option<usize>,
    index: Option<usize>,
    filepath: Option<usize>,
    line_index: Option<usize>,
    line_id: Option<usize>,
    x: Option<usize>,
    color: Option<usize>,
}

impl Columns {
    fn from_header(header: &StringRecord) -> Self {
        let mut cols = Columns::default();
        for (i, name) in header.iter().enumerate() {
            let slot = match name.trim() {
                "volume_id" => &mut cols.volume_id,
                "index" => &mut cols.index,
                "filepath" => &mut cols.filepath,
                "line_index" => &mut cols.line_index,
                "line_id" => &mut cols.line_id,
                "x" => &mut cols.x,
                "color" => &mut cols.color,
                _ => continue,
            };
            slot.get_or_insert(i);
        }
        cols
    }
}

/// One decoded row, tagged by the file layout it was written in. Text cells
/// are kept exactly as written; `None` means the column is absent.
#[derive(Debug, Clone, PartialEq)]
pub enum AnnotationRow {
    /// `index,filepath,x`: a single red line per row.
    Legacy { index: String, x: f64 },
    /// Canonical layout with `volume_id`.
    Current {
        line_index: usize,
        x: f64,
        color: Option<String>,
    },
    /// Rows carrying `color` and/or `line_id` directly.
    Intermediate {
        x: f64,
        color: Option<String>,
        line_id: Option<String>,
        line_index: Option<String>,
    },
}

impl AnnotationRow {
    /// Decode one record into its filepath and tagged row.
    fn decode(cols: &Columns, record: &StringRecord) -> Result<(String, Self)> {
        let raw = |idx: Option<usize>| idx.and_then(|i| record.get(i)).map(str::to_string);
        let number = |idx: Option<usize>| {
            idx.and_then(|i| record.get(i))
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        let filepath = cols
            .filepath
            .map(|i| record.get(i).unwrap_or("").to_string())
            .ok_or_else(|| anyhow!("no filepath column"))?;
        let x_cell = number(cols.x).ok_or_else(|| anyhow!("missing x"))?;
        let x: f64 = x_cell
            .parse()
            .with_context(|| format!("x {:?}", x_cell))?;

        let row = if cols.line_index.is_none() {
            let index = cols
                .index
                .map(|i| record.get(i).unwrap_or("").to_string())
                .ok_or_else(|| anyhow!("legacy file without index column"))?;
            AnnotationRow::Legacy { index, x }
        } else if cols.volume_id.is_some() {
            let cell = number(cols.line_index).ok_or_else(|| anyhow!("missing line_index"))?;
            let line_index = cell
                .parse::<usize>()
                .with_context(|| format!("line_index {:?}", cell))?;
            AnnotationRow::Current {
                line_index,
                x,
                color: raw(cols.color),
            }
        } else {
            AnnotationRow::Intermediate {
                x,
                color: raw(cols.color),
                line_id: raw(cols.line_id),
                line_index: raw(cols.line_index),
            }
        };
        Ok((filepath, row))
    }

    /// `position` is the row's ordinal among rows of the same filepath.
    fn into_line(self, position: usize) -> AnnotationLine {
        match self {
            AnnotationRow::Legacy { index, x } => AnnotationLine {
                x,
                color: DEFAULT_COLOR.to_string(),
                id: format!("old_{}", index),
            },
            AnnotationRow::Current {
                line_index,
                x,
                color,
            } => AnnotationLine {
                x,
                color: color.unwrap_or_else(|| palette_color(line_index).to_string()),
                id: format!("line_{}", line_index),
            },
            AnnotationRow::Intermediate {
                x,
                color,
                line_id,
                line_index,
            } => AnnotationLine {
                x,
                color: color.unwrap_or_else(|| DEFAULT_COLOR.to_string()),
                id: line_id.unwrap_or_else(|| {
                    format!("line_{}", line_index.unwrap_or_else(|| position.to_string()))
                }),
            },
        }
    }
}

/// Parse an annotation CSV of any layout. Lines keep file row order within
/// each filepath; filepaths keep first-seen order.
pub fn parse_annotations<R: Read>(reader: R) -> Result<Vec<ImageAnnotations>> {
    let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let cols = Columns::from_header(rdr.headers()?);

    let mut out: Vec<ImageAnnotations> = Vec::new();
    let mut slots: HashMap<String, usize> = HashMap::new();
    for (row, record) in rdr.records().enumerate() {
        let record = record?;
        let (filepath, decoded) =
            AnnotationRow::decode(&cols, &record).with_context(|| format!("row {}", row + 1))?;
        let slot = match slots.get(&filepath) {
            Some(&slot) => slot,
            None => {
                out.push(ImageAnnotations {
                    filepath: filepath.clone(),
                    lines: Vec::new(),
                });
                slots.insert(filepath, out.len() - 1);
                out.len() - 1
            }
        };
        let position = out[slot].lines.len();
        out[slot].lines.push(decoded.into_line(position));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Vec<ImageAnnotations> {
        parse_annotations(text.as_bytes()).unwrap()
    }

    fn line(x: f64, color: &str) -> LineInput {
        LineInput {
            x,
            color: Some(color.to_string()),
        }
    }

    #[test]
    fn test_legacy_rows() {
        let got = parse("index,filepath,x\n4,/a/1.png,12.5\n7,/a/2.png,3\n");
        assert_eq!(got.len(), 2);
        assert_eq!(
            got[0].lines,
            vec![AnnotationLine {
                x: 12.5,
                color: "red".into(),
                id: "old_4".into()
            }]
        );
        assert_eq!(got[1].lines[0].id, "old_7");
    }

    #[test]
    fn test_current_rows_with_color() {
        let got = parse(
            "volume_id,index,filepath,line_index,x,color\n\
             V,0,/a/1.png,0,10,green\n\
             V,0,/a/1.png,1,20,blue\n",
        );
        assert_eq!(got.len(), 1);
        let ids: Vec<&str> = got[0].lines.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["line_0", "line_1"]);
        assert_eq!(got[0].lines[0].color, "green");
        assert_eq!(got[0].lines[1].color, "blue");
    }

    #[test]
    fn test_legacy_row_with_empty_index() {
        let got = parse("index,filepath,x\n,/a.png,3\n0,/b.png,4\n");
        assert_eq!(got[0].lines[0].id, "old_");
        assert_eq!(got[1].lines[0].id, "old_0");
        assert!(parse_annotations("filepath,x\n/a.png,3\n".as_bytes()).is_err());
    }

    #[test]
    fn test_current_rows_palette_fallback() {
        let mut text = String::from("volume_id,index,filepath,line_index,x\n");
        for li in 0..18 {
            text.push_str(&format!("V,0,/a/1.png,{},{}\n", li, li * 10));
        }
        let colors: Vec<String> = parse(&text)[0]
            .lines
            .iter()
            .map(|l| l.color.clone())
            .collect();
        assert_eq!(colors[0], "red");
        assert_eq!(colors[1], "red");
        assert_eq!(colors[2], "blue");
        assert_eq!(colors[3], "blue");
        assert_eq!(colors[8], "purple");
        assert_eq!(colors[9], "purple");
        assert_eq!(colors[14], "yellow");
        assert_eq!(colors[16], "red");
        assert_eq!(colors[17], "red");
    }

    #[test]
    fn test_color_cell_kept_as_written() {
        let got = parse(
            "volume_id,index,filepath,line_index,x,color\n\
             V,0,/a,4,1,\n\
             V,0,/a,5,2, blue \n",
        );
        assert_eq!(got[0].lines[0].color, "");
        assert_eq!(got[0].lines[1].color, " blue ");
    }

    #[test]
    fn test_intermediate_rows() {
        let got = parse(
            "index,filepath,line_index,line_id,x,color\n\
             0,/a/1.png,0,min,5,purple\n\
             0,/a/1.png,1,,6,\n",
        );
        assert_eq!(
            got[0].lines,
            vec![
                AnnotationLine {
                    x: 5.0,
                    color: "purple".into(),
                    id: "min".into()
                },
                AnnotationLine {
                    x: 6.0,
                    color: "".into(),
                    id: "".into()
                },
            ]
        );

        let got = parse("index,filepath,line_index,x\n0,/a/1.png,1,6\n");
        assert_eq!(
            got[0].lines,
            vec![AnnotationLine {
                x: 6.0,
                color: "red".into(),
                id: "line_1".into()
            }]
        );
    }

    #[test]
    fn test_row_order_kept_within_filepath() {
        let got = parse(
            "volume_id,index,filepath,line_index,x,color\n\
             V,1,/b.png,3,30,red\n\
             V,0,/a.png,0,1,red\n\
             V,1,/b.png,1,10,red\n",
        );
        assert_eq!(got[0].filepath, "/b.png");
        assert_eq!(got[1].filepath, "/a.png");
        let xs: Vec<f64> = got[0].lines.iter().map(|l| l.x).collect();
        assert_eq!(xs, vec![30.0, 10.0]);
    }

    #[test]
    fn test_bad_x_is_an_error() {
        assert!(parse_annotations("index,filepath,x\n0,/a,abc\n".as_bytes()).is_err());
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = AnnotationStore::new(dir.path().join("output"));
        let images = vec![
            ImageLines {
                filepath: "/v/2.png".into(),
                index: 1,
                lines: vec![line(40.25, "cyan"), line(12.0, "red"), line(99.5, "cyan")],
            },
            ImageLines {
                filepath: "/v/1.png".into(),
                index: 0,
                lines: vec![line(7.0, "blue")],
            },
            ImageLines {
                filepath: "/v/3.png".into(),
                index: 2,
                lines: vec![],
            },
        ];
        let path = store.save(Some("vol/7"), &images).unwrap();
        assert_eq!(path, dir.path().join("output").join("vol_7_lines.csv"));
        assert!(store.exists("vol/7"));

        let loaded = store.load("vol/7").unwrap();
        assert_eq!(loaded.len(), 2);
        for (got, want) in loaded.iter().zip(images.iter()) {
            assert_eq!(got.filepath, want.filepath);
            let pairs: Vec<(f64, &str)> =
                got.lines.iter().map(|l| (l.x, l.color.as_str())).collect();
            let expected: Vec<(f64, &str)> = want
                .lines
                .iter()
                .map(|l| (l.x, l.color.as_deref().unwrap()))
                .collect();
            assert_eq!(pairs, expected);
        }
        assert_eq!(loaded[0].lines[2].id, "line_2");
    }

    #[test]
    fn test_round_trip_keeps_unusual_colors() {
        let dir = tempfile::tempdir().unwrap();
        let store = AnnotationStore::new(dir.path());
        let images = vec![ImageLines {
            filepath: "/v/1.png".into(),
            index: 0,
            lines: vec![line(1.0, " blue"), line(2.0, ""), line(3.0, "#00ff00 ")],
        }];
        store.save(Some("V"), &images).unwrap();
        let colors: Vec<String> = store.load("V").unwrap()[0]
            .lines
            .iter()
            .map(|l| l.color.clone())
            .collect();
        assert_eq!(colors, vec![" blue", "", "#00ff00 "]);
    }

    #[test]
    fn test_concurrent_saves_leave_one_complete_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = AnnotationStore::new(dir.path());
        let batch = |writer: usize| -> Vec<ImageLines> {
            vec![ImageLines {
                filepath: format!("/w{}.png", writer),
                index: writer as i64,
                lines: (0..50).map(|i| line(i as f64, "green")).collect(),
            }]
        };

        std::thread::scope(|scope| {
            for writer in 0..8 {
                let store = &store;
                let images = batch(writer);
                scope.spawn(move || {
                    for _ in 0..10 {
                        store.save(Some("V"), &images).unwrap();
                    }
                });
            }
        });

        let loaded = store.load("V").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].lines.len(), 50);
        assert!((0..8).any(|w| loaded[0].filepath == format!("/w{}.png", w)));
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["V_lines.csv"]);
    }

    #[test]
    fn test_save_replaces_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = AnnotationStore::new(dir.path());
        let first = vec![ImageLines {
            filepath: "/a.png".into(),
            index: 0,
            lines: vec![line(1.0, "red"), line(2.0, "red")],
        }];
        store.save(Some("V"), &first).unwrap();
        let second = vec![ImageLines {
            filepath: "/b.png".into(),
            index: 3,
            lines: vec![LineInput { x: 5.0, color: None }],
        }];
        store.save(Some("V"), &second).unwrap();

        let loaded = store.load("V").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].filepath, "/b.png");
        assert_eq!(loaded[0].lines[0].color, "red");
    }

    #[test]
    fn test_save_without_volume_uses_unscoped_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = AnnotationStore::new(dir.path());
        let path = store.save(Some(""), &[]).unwrap();
        assert_eq!(path, dir.path().join("lines.csv"));
        let text = fs::read_to_string(path).unwrap();
        assert_eq!(text.trim_end(), "volume_id,index,filepath,line_index,x,color");
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = AnnotationStore::new(dir.path());
        assert!(store.load("nothing").unwrap().is_empty());
        assert!(!store.exists("nothing"));
    }
}
