use std::fs::File;
use std::path::{Path, PathBuf};

use crate::errors::{MmxError, Result};
use crate::fsutil::has_extension;

const EPSG_TAG: &str = "epsg:";

/// Field observation points read from a comma-delimited file whose first row
/// carries the spatial reference tag (`epsg:<code>`).
#[derive(Debug, Clone, PartialEq)]
pub struct PresencePoints {
    pub path: PathBuf,
    pub epsg: i32,
    pub points: Vec<(f64, f64)>,
}

/// Checks the presence file the same way everywhere it is accepted.
pub fn validate_presence_file(path: &Path) -> Result<()> {
    let base = format!("presence point file {}", path.display());
    if !path.exists() {
        return Err(MmxError::invalid_config(format!("{} does not exist", base)));
    }
    if !path.is_file() {
        return Err(MmxError::invalid_config(format!("{} must be a file", base)));
    }
    if !has_extension(path, "csv") {
        return Err(MmxError::invalid_config(format!("{} must be a CSV file", base)));
    }
    Ok(())
}

/// Finds `epsg:<code>` in any header field.
pub fn parse_epsg_tag(header: &csv::StringRecord) -> Result<Option<i32>> {
    for field in header.iter() {
        let lower = field.trim().to_ascii_lowercase();
        if let Some(pos) = lower.find(EPSG_TAG) {
            let code = lower[pos + EPSG_TAG.len()..].trim();
            let epsg = code.parse::<i32>().map_err(|_| {
                MmxError::invalid_input(format!("unparseable EPSG tag '{}'", field))
            })?;
            return Ok(Some(epsg));
        }
    }
    Ok(None)
}

impl PresencePoints {
    pub fn read(path: &Path) -> Result<Self> {
        validate_presence_file(path)?;
        let file = File::open(path)?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(file);

        let mut records = reader.records();
        let header = match records.next() {
            Some(rec) => rec?,
            None => {
                return Err(MmxError::invalid_input(format!(
                    "{} is empty",
                    path.display()
                )))
            }
        };
        let epsg = parse_epsg_tag(&header)?.ok_or_else(|| {
            MmxError::invalid_input(
                "points file must contain an EPSG code, like \"epsg:4326\", in its first row",
            )
        })?;

        let mut points = Vec::new();
        for (idx, rec) in records.enumerate() {
            let rec = rec?;
            let row = idx + 2;
            if rec.iter().all(|f| f.trim().is_empty()) {
                continue;
            }
            if rec.len() < 2 {
                return Err(MmxError::invalid_input(format!(
                    "row {} of {} needs x and y columns",
                    row,
                    path.display()
                )));
            }
            let x = parse_coord(&rec[0], row, path)?;
            let y = parse_coord(&rec[1], row, path)?;
            points.push((x, y));
        }

        Ok(Self {
            path: path.to_path_buf(),
            epsg,
            points,
        })
    }
}

fn parse_coord(raw: &str, row: usize, path: &Path) -> Result<f64> {
    raw.trim().parse::<f64>().map_err(|_| {
        MmxError::invalid_input(format!(
            "row {} of {}: '{}' is not a coordinate",
            row,
            path.display(),
            raw
        ))
    })
}
