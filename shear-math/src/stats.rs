//! Robust summary statistics for pixel arrays

use thiserror::Error;

/// Errors raised by the summary statistics
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatsError {
    #[error("insufficient data points: {total} total values, {valid} valid")]
    InsufficientData { total: usize, valid: usize },
}

/// Calculate median of a slice of f64 values
///
/// This function computes the median while filtering out NaN values but including
/// infinite values (±inf). For even-length data, returns the average of the two
/// middle values.
///
/// # Arguments
///
/// * `values` - Slice of f64 values to compute median from
///
/// # Returns
///
/// * `Ok(median)` - The median value
/// * `Err(StatsError)` - If no valid values remain after filtering NaN
pub fn median(values: &[f64]) -> Result<f64, StatsError> {
    let mut valid_values: Vec<f64> = values.iter().filter(|v| !v.is_nan()).copied().collect();

    if valid_values.is_empty() {
        return Err(StatsError::InsufficientData {
            total: values.len(),
            valid: 0,
        });
    }

    valid_values.sort_by(|a, b| a.total_cmp(b));

    let median_value = if valid_values.len() % 2 == 0 {
        let mid = valid_values.len() / 2;
        (valid_values[mid - 1] + valid_values[mid]) / 2.0
    } else {
        valid_values[valid_values.len() / 2]
    };

    Ok(median_value)
}

/// Population variance (ddof = 0) of the finite values in a slice
///
/// # Returns
///
/// * `Ok(variance)` - Mean squared deviation about the mean
/// * `Err(StatsError)` - If fewer than one finite value is present
pub fn variance<'a>(values: impl IntoIterator<Item = &'a f64>) -> Result<f64, StatsError> {
    let mut total = 0usize;
    let mut n = 0usize;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;

    // Two accumulators, shifted by the first value for stability
    let mut shift = None;
    for &v in values {
        total += 1;
        if !v.is_finite() {
            continue;
        }
        let k = *shift.get_or_insert(v);
        let d = v - k;
        n += 1;
        sum += d;
        sum_sq += d * d;
    }

    if n == 0 {
        return Err(StatsError::InsufficientData { total, valid: 0 });
    }

    let n = n as f64;
    Ok(((sum_sq - sum * sum / n) / n).max(0.0))
}
