//! Coordinate dataset loading.
//!
//! Plain-text format: line 1 holds the node count, each following line a
//! latitude and longitude in degrees separated by whitespace. Trailing
//! whitespace and blank interior lines are tolerated; anything else is a
//! typed error naming the offending line.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::info;

use crate::error::DatasetError;
use crate::geo::GeoCoord;

/// Load a coordinate file.
pub fn read_coordinates(path: &Path) -> Result<Vec<GeoCoord>, DatasetError> {
    let file = File::open(path).map_err(|source| DatasetError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);
    let mut lines = reader.lines().enumerate();

    let (_, first) = lines.next().ok_or(DatasetError::Empty)?;
    let first = first?;
    let n: usize = first
        .trim()
        .parse()
        .map_err(|_| DatasetError::Malformed {
            line: 1,
            expected: "a node count",
            got: first.trim().to_owned(),
        })?;

    let mut coords = Vec::with_capacity(n);
    for (idx, line) in lines {
        if coords.len() == n {
            break;
        }
        let line_no = idx + 1;
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let mut fields = trimmed.split_whitespace();
        let (Some(lat_str), Some(lon_str), None) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(DatasetError::Malformed {
                line: line_no,
                expected: "two whitespace-separated floats",
                got: trimmed.to_owned(),
            });
        };

        let lat: f64 = lat_str.parse().map_err(|_| DatasetError::Malformed {
            line: line_no,
            expected: "a latitude",
            got: lat_str.to_owned(),
        })?;
        let lon: f64 = lon_str.parse().map_err(|_| DatasetError::Malformed {
            line: line_no,
            expected: "a longitude",
            got: lon_str.to_owned(),
        })?;

        let coord = GeoCoord::new(lat, lon);
        if !coord.in_range() {
            return Err(DatasetError::OutOfRange {
                line: line_no,
                lat,
                lon,
            });
        }
        coords.push(coord);
    }

    if coords.len() < n {
        return Err(DatasetError::Truncated {
            expected: n,
            got: coords.len(),
        });
    }

    info!(nodes = coords.len(), path = %path.display(), "coordinates loaded");
    Ok(coords)
}
