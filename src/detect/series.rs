use crate::detect::DetectError;

/// A simple series of historical readings for one parameter.
pub struct TimeSeries {
    values: Vec<f64>,
}

impl TimeSeries {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Population variance.
    pub fn variance(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let sum_sq_diff: f64 = self
            .values
            .iter()
            .map(|&x| (x - mean).powi(2))
            .sum();
        sum_sq_diff / self.values.len() as f64
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Sample standard deviation (n - 1 denominator). Zero below two points.
    pub fn sample_std_dev(&self) -> f64 {
        let n = self.values.len();
        if n < 2 {
            return 0.0;
        }
        (self.variance() * n as f64 / (n - 1) as f64).sqrt()
    }

    pub fn min(&self) -> Option<f64> {
        self.values.iter().copied().reduce(f64::min)
    }

    pub fn max(&self) -> Option<f64> {
        self.values.iter().copied().reduce(f64::max)
    }

    /// Middle value; the mean of the two middle values for an even count.
    pub fn median(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        let mut sorted = self.values.clone();
        sorted.sort_by(f64::total_cmp);
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            Some((sorted[mid - 1] + sorted[mid]) / 2.0)
        } else {
            Some(sorted[mid])
        }
    }

    /// Absolute z-score of `value` against this series.
    ///
    /// Returns `Ok(None)` for a constant series: no deviation is computable.
    pub fn abs_z_score(&self, value: f64, min_points: usize) -> Result<Option<f64>, DetectError> {
        if self.values.len() < min_points {
            return Err(DetectError::InsufficientBaseline {
                needed: min_points,
                have: self.values.len(),
            });
        }
        let std = self.std_dev();
        if std == 0.0 {
            return Ok(None);
        }
        Ok(Some((value - self.mean()).abs() / std))
    }
}
