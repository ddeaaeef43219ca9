//! Offline tool: measure each image listed in a dataset CSV and append its
//! horizontal resolution and pixel size.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::Args;
use rayon::prelude::*;
use tracing::info;

use crate::transcode::{ImageCrateTranscoder, ImageTranscoder};

#[derive(Args, Debug)]
pub struct ResolutionArgs {
    /// Dataset CSV to read
    #[arg(long)]
    pub input_file: PathBuf,

    /// Where to write the dataset with resolution/height/width columns
    #[arg(long)]
    pub output_file: PathBuf,

    /// Column holding each image's path
    #[arg(long, default_value = "file_path_coris")]
    pub path_column: String,

    /// Worker threads used to open images
    #[arg(long, default_value_t = 30)]
    pub workers: usize,
}

const START_X: &str = "Start_X";
const END_X: &str = "End_X";
const ADDED_COLUMNS: [&str; 3] = ["resolution", "height", "width"];

/// A CSV held as raw strings so unknown columns pass through untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn read<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
        let headers: Vec<String> = rdr.headers()?.iter().map(str::to_string).collect();
        let rows = rdr
            .records()
            .map(|r| r.map(|rec| rec.iter().map(str::to_string).collect()))
            .collect::<Result<Vec<Vec<String>>, _>>()?;
        Ok(Self { headers, rows })
    }

    pub fn write<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::WriterBuilder::new().flexible(true).from_writer(writer);
        wtr.write_record(&self.headers)?;
        for row in &self.rows {
            wtr.write_record(row)?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }
}

/// Pixel size of one image and the resolution derived from its x extent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub width: u32,
    pub height: u32,
    /// `None` when a Start_X/End_X cell is empty.
    pub resolution: Option<f64>,
}

struct Columns {
    path: usize,
    start_x: Option<usize>,
    end_x: Option<usize>,
}

/// Physical x extent, 0 when the column does not exist at all.
fn coordinate(row: &[String], col: Option<usize>, name: &str) -> Result<Option<f64>> {
    let Some(col) = col else {
        return Ok(Some(0.0));
    };
    let cell = row.get(col).map(|c| c.trim()).unwrap_or("");
    if cell.is_empty() {
        return Ok(None);
    }
    cell.parse::<f64>()
        .map(Some)
        .with_context(|| format!("{} {:?}", name, cell))
}

fn measure_row(row: &[String], cols: &Columns, probe: &dyn ImageTranscoder) -> Result<Measurement> {
    let path = Path::new(row[cols.path].trim());
    let (width, height) = probe
        .dimensions(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let start_x = coordinate(row, cols.start_x, START_X)?;
    let end_x = coordinate(row, cols.end_x, END_X)?;
    let resolution = match (start_x, end_x) {
        (Some(start), Some(end)) => Some((end - start) / width as f64),
        _ => None,
    };
    Ok(Measurement {
        width,
        height,
        resolution,
    })
}

/// Measure every row with a non-empty path on a pool of `workers` threads.
/// Rows without a path are dropped. The first failing row aborts the batch.
pub fn add_resolution(
    table: Table,
    path_column: &str,
    workers: usize,
    probe: &dyn ImageTranscoder,
) -> Result<Table> {
    let cols = Columns {
        path: table
            .column(path_column)
            .ok_or_else(|| anyhow!("missing path column {:?}", path_column))?,
        start_x: table.column(START_X),
        end_x: table.column(END_X),
    };

    let mut headers = table.headers.clone();
    let mut out_cols = [0usize; 3];
    for (slot, name) in out_cols.iter_mut().zip(ADDED_COLUMNS) {
        *slot = match headers.iter().position(|h| h == name) {
            Some(i) => i,
            None => {
                headers.push(name.to_string());
                headers.len() - 1
            }
        };
    }

    let rows: Vec<Vec<String>> = table
        .rows
        .into_iter()
        .filter(|row| row.get(cols.path).map_or(false, |p| !p.trim().is_empty()))
        .collect();
    let total = rows.len();
    info!("measuring rows={} workers={}", total, workers);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
        .map_err(|e| anyhow!("rayon init failed: {}", e))?;
    let processed = AtomicUsize::new(0);
    let width = headers.len();
    let rows = pool.install(|| {
        rows.into_par_iter()
            .map(|mut row| -> Result<Vec<String>> {
                let m = measure_row(&row, &cols, probe)?;
                let idx = processed.fetch_add(1, Ordering::Relaxed) + 1;
                if idx % 100 == 0 || idx == total {
                    info!("[{}/{}] rows measured", idx, total);
                }
                row.resize(width, String::new());
                row[out_cols[0]] = m.resolution.map(|r| r.to_string()).unwrap_or_default();
                row[out_cols[1]] = m.height.to_string();
                row[out_cols[2]] = m.width.to_string();
                Ok(row)
            })
            .collect::<Result<Vec<_>>>()
    })?;

    Ok(Table { headers, rows })
}

pub fn run(args: ResolutionArgs) -> Result<()> {
    let start = Instant::now();
    info!("reading {}", args.input_file.display());
    let input = File::open(&args.input_file)
        .with_context(|| format!("opening {}", args.input_file.display()))?;
    let table = Table::read(input)?;

    let probe = ImageCrateTranscoder::default();
    let table = add_resolution(table, &args.path_column, args.workers, &probe)?;

    let output = File::create(&args.output_file)
        .with_context(|| format!("creating {}", args.output_file.display()))?;
    table.write(output)?;
    info!(
        "wrote rows={} path={} ms={}",
        table.rows.len(),
        args.output_file.display(),
        start.elapsed().as_millis()
    );
    Ok(())
}
