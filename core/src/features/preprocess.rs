//! Image conditioning applied before landmark extraction.
//!
//! Scanning-probe images carry a per-scanline offset (each row is acquired at a slightly different
//! time and drifts independently) plus slow background gradients. [`remove_row_noise`] levels the
//! scanlines and [`highpass`] removes the background so that matching responds to structure rather
//! than brightness.
//!
//! The gradient helpers ([`sobel`], [`orientation_bins`], [`orientation_histogram`]) feed the
//! orientation and magnitude terms of template scoring.
use super::GrayImage;

use nalgebra::{DMatrix, DMatrixView};
use std::f64::consts::PI;

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        0.5 * (values[mid - 1] + values[mid])
    } else {
        values[mid]
    }
}

/// Moving average of `row` over `window` samples, edges padded with the nearest sample.
fn moving_average(row: &[f64], window: usize) -> Vec<f64> {
    let n = row.len();
    if n == 0 || window <= 1 {
        return row.to_vec();
    }
    let half = (window / 2) as isize;
    let last = n as isize - 1;
    (0..n as isize)
        .map(|i| {
            let sum: f64 = (i - half..i - half + window as isize)
                .map(|j| row[j.clamp(0, last) as usize])
                .sum();
            sum / window as f64
        })
        .collect()
}

/// Subtract each row's median, optionally detrend along the row with a moving average of
/// `detrend_window` samples, then rescale to `[0, 1]`.
pub fn remove_row_noise(image: &GrayImage, detrend_window: Option<usize>) -> GrayImage {
    let (rows, cols) = image.shape();
    let mut out = image.clone();
    let mut scratch = Vec::with_capacity(cols);
    for r in 0..rows {
        scratch.clear();
        scratch.extend(image.row(r).iter().copied());
        let m = median(&mut scratch);
        let mut leveled: Vec<f64> = image.row(r).iter().map(|v| v - m).collect();
        if let Some(window) = detrend_window {
            let trend = moving_average(&leveled, window);
            for (v, t) in leveled.iter_mut().zip(trend) {
                *v -= t;
            }
        }
        for (c, v) in leveled.into_iter().enumerate() {
            out[(r, c)] = v;
        }
    }
    rescale(&mut out);
    out
}

/// Min-max rescale to `[0, 1]` in place. A flat image becomes all zeros.
pub fn rescale(image: &mut GrayImage) {
    if image.is_empty() {
        return;
    }
    let lo = image.min();
    let span = image.max() - lo;
    image.apply(|v| *v = (*v - lo) / (span + 1e-9));
}

/// Summed-area table with a zero border row and column: entry `(r, c)` is the sum of `image[..r, ..c]`.
pub fn integral(image: &GrayImage) -> GrayImage {
    let (rows, cols) = image.shape();
    let mut table = DMatrix::<f64>::zeros(rows + 1, cols + 1);
    for r in 0..rows {
        let mut row_sum = 0.0;
        for c in 0..cols {
            row_sum += image[(r, c)];
            table[(r + 1, c + 1)] = table[(r, c + 1)] + row_sum;
        }
    }
    table
}

/// Sum over rows `r0..r1` and columns `c0..c1` from a table built by [`integral`].
pub fn window_sum(table: &GrayImage, r0: usize, c0: usize, r1: usize, c1: usize) -> f64 {
    table[(r1, c1)] - table[(r0, c1)] - table[(r1, c0)] + table[(r0, c0)]
}

/// Mean over the `(2·radius + 1)²` window around each pixel, clipped at the borders.
pub fn box_blur(image: &GrayImage, radius: usize) -> GrayImage {
    let (rows, cols) = image.shape();
    if radius == 0 || image.is_empty() {
        return image.clone();
    }
    let table = integral(image);
    DMatrix::from_fn(rows, cols, |r, c| {
        let r0 = r.saturating_sub(radius);
        let c0 = c.saturating_sub(radius);
        let r1 = (r + radius + 1).min(rows);
        let c1 = (c + radius + 1).min(cols);
        window_sum(&table, r0, c0, r1, c1) / ((r1 - r0) * (c1 - c0)) as f64
    })
}

/// Image minus its box blur.
pub fn highpass(image: &GrayImage, radius: usize) -> GrayImage {
    if radius == 0 {
        return image.clone();
    }
    image - box_blur(image, radius)
}

/// Horizontal and vertical Sobel responses (unnormalised 3x3 kernels, borders replicated).
pub fn sobel(image: &GrayImage) -> (GrayImage, GrayImage) {
    let (rows, cols) = image.shape();
    if image.is_empty() {
        return (image.clone(), image.clone());
    }
    let at = |r: isize, c: isize| {
        let r = r.clamp(0, rows as isize - 1) as usize;
        let c = c.clamp(0, cols as isize - 1) as usize;
        image[(r, c)]
    };
    let gx = DMatrix::from_fn(rows, cols, |r, c| {
        let (r, c) = (r as isize, c as isize);
        (at(r - 1, c + 1) + 2.0 * at(r, c + 1) + at(r + 1, c + 1))
            - (at(r - 1, c - 1) + 2.0 * at(r, c - 1) + at(r + 1, c - 1))
    });
    let gy = DMatrix::from_fn(rows, cols, |r, c| {
        let (r, c) = (r as isize, c as isize);
        (at(r + 1, c - 1) + 2.0 * at(r + 1, c) + at(r + 1, c + 1))
            - (at(r - 1, c - 1) + 2.0 * at(r - 1, c) + at(r - 1, c + 1))
    });
    (gx, gy)
}

/// Gradient magnitude of `image`.
pub fn gradient_magnitude(image: &GrayImage) -> GrayImage {
    let (gx, gy) = sobel(image);
    gx.zip_map(&gy, f64::hypot)
}

/// Unsigned gradient orientation in `[0, π)` quantised to `bins` equal bins, plus the magnitude.
pub fn orientation_bins(image: &GrayImage, bins: usize) -> (DMatrix<usize>, GrayImage) {
    let (gx, gy) = sobel(image);
    let bins = bins.max(1);
    let index = gx.zip_map(&gy, |x, y| {
        let angle = y.atan2(x).rem_euclid(PI);
        ((angle / PI * bins as f64) as usize).min(bins - 1)
    });
    (index, gx.zip_map(&gy, f64::hypot))
}

/// Magnitude-weighted histogram of orientation bins, scaled to unit L2 norm. All zeros for a window
/// without gradient.
pub fn orientation_histogram(
    index: DMatrixView<'_, usize>,
    magnitude: DMatrixView<'_, f64>,
    bins: usize,
) -> Vec<f64> {
    let mut histogram = vec![0.0; bins.max(1)];
    let last = histogram.len() - 1;
    for (&bin, &m) in index.iter().zip(magnitude.iter()) {
        histogram[bin.min(last)] += m;
    }
    let norm = histogram.iter().map(|h| h * h).sum::<f64>().sqrt();
    if norm > 0.0 {
        for h in &mut histogram {
            *h /= norm;
        }
    }
    histogram
}

/// Quantile `q` in `[0, 1]` with linear interpolation between order statistics.
pub fn quantile(values: impl Iterator<Item = f64>, q: f64) -> f64 {
    let mut sorted: Vec<f64> = values.filter(|v| !v.is_nan()).collect();
    if sorted.is_empty() {
        return 0.0;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let position = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

/// Mean and population standard deviation.
pub fn mean_std(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let mut n = 0usize;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for v in values {
        n += 1;
        sum += v;
        sum_sq += v * v;
    }
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = sum / n as f64;
    let var = (sum_sq / n as f64 - mean * mean).max(0.0);
    (mean, var.sqrt())
}
