use std::io::BufRead;
use std::path::Path;

use crate::error::ArgError;
use crate::error::Result;
use crate::records::open_input;

/// A piecewise-constant rate along the genome, read from
/// `left right rate` records.
///
/// Positions outside every record contribute no distance.
#[derive(Clone, Debug)]
pub struct RateMap {
    coordinates: Vec<f64>,
    cumulative: Vec<f64>,
}

impl RateMap {
    /// Build from `(left, right, rate)` segments, sorted by `left`
    /// and not overlapping.
    pub fn new(segments: &[(f64, f64, f64)]) -> Self {
        let mut coordinates = vec![];
        let mut cumulative: Vec<f64> = vec![];
        for &(left, right, rate) in segments {
            let total = cumulative.last().copied().unwrap_or(0.0);
            if coordinates.last() != Some(&left) {
                coordinates.push(left);
                cumulative.push(total);
            }
            coordinates.push(right);
            cumulative.push(total + rate * (right - left));
        }
        Self {
            coordinates,
            cumulative,
        }
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut segments = vec![];
        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let parts = line.split_whitespace().collect::<Vec<_>>();
            if parts.len() != 3 {
                return Err(ArgError::parse(
                    line_num + 1,
                    format!("expected 3 columns, got {}", parts.len()),
                ));
            }
            let mut values = [0.0; 3];
            for (v, p) in values.iter_mut().zip(&parts) {
                *v = p
                    .parse()
                    .map_err(|_| ArgError::parse(line_num + 1, format!("invalid number {p}")))?;
            }
            let [left, right, rate] = values;
            if right <= left {
                return Err(ArgError::parse(line_num + 1, "empty segment"));
            }
            if let Some(&(_, prev_right, _)) = segments.last() {
                if left < prev_right {
                    return Err(ArgError::parse(line_num + 1, "overlapping segments"));
                }
            }
            segments.push((left, right, rate));
        }
        Ok(Self::new(&segments))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_reader(open_input(path)?)
    }

    /// Accumulated rate from the start of the map to `x`.
    pub fn cumulative_distance(&self, x: f64) -> f64 {
        let (Some(&first), Some(&last)) = (self.coordinates.first(), self.coordinates.last()) else {
            return 0.0;
        };
        if x <= first {
            return 0.0;
        }
        if x >= last {
            return self.cumulative[self.cumulative.len() - 1];
        }
        let i = self.coordinates.partition_point(|&c| c <= x);
        let (x0, x1) = (self.coordinates[i - 1], self.coordinates[i]);
        let (c0, c1) = (self.cumulative[i - 1], self.cumulative[i]);
        c0 + (c1 - c0) * (x - x0) / (x1 - x0)
    }

    /// Accumulated rate over `[x, y]`.
    pub fn segment_distance(&self, x: f64, y: f64) -> f64 {
        self.cumulative_distance(y) - self.cumulative_distance(x)
    }
}
