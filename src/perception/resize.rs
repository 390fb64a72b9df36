/// Canonical pixel budget and coordinate normalization.
///
/// Screenshots are rescaled into `[MIN_PIXELS, MAX_PIXELS]` before they reach
/// a model, and the boxes the model answers with are mapped back into `[0, 1]`
/// screen fractions here.
use serde::{Deserialize, Serialize};

use crate::errors::{HarnessError, HarnessResult};

pub const IMAGE_FACTOR: u32 = 28;
pub const MIN_PIXELS: u64 = 100 * 28 * 28;
pub const MAX_PIXELS: u64 = 16384 * 28 * 28;
pub const MAX_RATIO: f64 = 200.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelBudget {
    pub factor: u32,
    pub min_pixels: u64,
    pub max_pixels: u64,
}

impl Default for PixelBudget {
    fn default() -> Self {
        Self {
            factor: IMAGE_FACTOR,
            min_pixels: MIN_PIXELS,
            max_pixels: MAX_PIXELS,
        }
    }
}

/// How a dialect's raw box numbers map onto screen fractions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoordinateConvention {
    /// Every number is divided by the same constant (e.g. 1000).
    Factor(f64),
    /// Even positions are x and divide by `width`, odd positions are y and
    /// divide by `height`.
    AxisAware { height: f64, width: f64 },
}

impl CoordinateConvention {
    pub fn normalize(&self, index: usize, value: f64) -> f64 {
        match *self {
            Self::Factor(factor) => value / factor,
            Self::AxisAware { height, width } => {
                if index % 2 == 1 {
                    value / height
                } else {
                    value / width
                }
            }
        }
    }
}

fn aspect_ratio(height: u32, width: u32) -> f64 {
    let (h, w) = (height as f64, width as f64);
    h.max(w) / h.min(w)
}

/// Rejects images whose long side exceeds `MAX_RATIO` times the short side.
pub fn check_aspect_ratio(height: u32, width: u32) -> HarnessResult<()> {
    if height == 0 || width == 0 {
        return Err(HarnessError::Perception(format!(
            "degenerate image size {width}x{height}"
        )));
    }
    let ratio = aspect_ratio(height, width);
    if ratio > MAX_RATIO {
        return Err(HarnessError::AspectRatio { ratio });
    }
    Ok(())
}

/// Aspect-preserving linear rescale into the pixel budget. The downscale
/// truncates, the upscale rounds up.
pub fn resize_bounds(height: u32, width: u32, budget: &PixelBudget) -> (u32, u32) {
    let (mut h, mut w) = (height as f64, width as f64);

    if h * w > budget.max_pixels as f64 {
        let scale = (budget.max_pixels as f64 / (h * w)).sqrt();
        w = (w * scale).trunc();
        h = (h * scale).trunc();
    }
    if h * w < budget.min_pixels as f64 && h * w > 0.0 {
        let scale = (budget.min_pixels as f64 / (h * w)).sqrt();
        w = (w * scale).ceil();
        h = (h * scale).ceil();
    }

    (h as u32, w as u32)
}

fn round_by_factor(value: f64, factor: f64) -> f64 {
    (value / factor).round_ties_even() * factor
}

fn ceil_by_factor(value: f64, factor: f64) -> f64 {
    (value / factor).ceil() * factor
}

fn floor_by_factor(value: f64, factor: f64) -> f64 {
    (value / factor).floor() * factor
}

/// Rescale so both sides are multiples of `budget.factor` and the area lands
/// inside the budget, keeping the aspect ratio as close as possible.
pub fn smart_resize_bounds(
    height: u32,
    width: u32,
    budget: &PixelBudget,
) -> HarnessResult<(u32, u32)> {
    check_aspect_ratio(height, width)?;

    let factor = budget.factor as f64;
    let (h, w) = (height as f64, width as f64);
    let min = budget.min_pixels as f64;
    let max = budget.max_pixels as f64;

    let mut h_bar = factor.max(round_by_factor(h, factor));
    let mut w_bar = factor.max(round_by_factor(w, factor));

    if h_bar * w_bar > max {
        let beta = (h * w / max).sqrt();
        h_bar = floor_by_factor(h / beta, factor);
        w_bar = floor_by_factor(w / beta, factor);
    } else if h_bar * w_bar < min {
        let beta = (min / (h * w)).sqrt();
        h_bar = ceil_by_factor(h * beta, factor);
        w_bar = ceil_by_factor(w * beta, factor);
    }

    Ok((h_bar as u32, w_bar as u32))
}

/// Map raw box numbers onto screen fractions. A point is widened to a
/// zero-area box by repeating it.
pub fn box_to_fraction(
    numbers: &[f64],
    convention: &CoordinateConvention,
) -> Option<[f64; 4]> {
    let scaled: Vec<f64> = numbers
        .iter()
        .enumerate()
        .map(|(i, v)| convention.normalize(i, *v))
        .collect();

    match scaled.as_slice() {
        [x, y] => Some([*x, *y, *x, *y]),
        [x1, y1, x2, y2] => Some([*x1, *y1, *x2, *y2]),
        _ => None,
    }
}

/// Python-compatible `round(v, 3)`.
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round_ties_even() / 1000.0
}

/// Centre of a `[x1, y1, x2, y2]` box, rounded to three decimals.
pub fn box_center(bx: &[f64; 4]) -> (f64, f64) {
    (round3((bx[0] + bx[2]) / 2.0), round3((bx[1] + bx[3]) / 2.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_sizes_are_unchanged() {
        let budget = PixelBudget::default();
        for (h, w) in [(812, 1288), (28 * 10, 28 * 20), (1092, 1932), (2828, 2828)] {
            assert_eq!(smart_resize_bounds(h, w, &budget).unwrap(), (h, w));
        }
    }

    #[test]
    fn vm_screen_rounds_to_factor() {
        let budget = PixelBudget::default();
        assert_eq!(smart_resize_bounds(800, 1280, &budget).unwrap(), (812, 1288));
    }

    #[test]
    fn extreme_aspect_ratio_is_rejected() {
        let budget = PixelBudget::default();
        let err = smart_resize_bounds(10, 2010, &budget).unwrap_err();
        assert!(matches!(err, HarnessError::AspectRatio { ratio } if ratio > 200.0));
        assert!(smart_resize_bounds(4020, 20, &budget).is_err());
        // exactly 200 is still fine
        assert!(smart_resize_bounds(28, 5600, &budget).is_ok());
    }

    #[test]
    fn oversized_image_is_floored_into_budget() {
        let budget = PixelBudget::default();
        let (h, w) = smart_resize_bounds(8000, 12000, &budget).unwrap();
        assert_eq!(h % 28, 0);
        assert_eq!(w % 28, 0);
        assert!((h as u64) * (w as u64) <= MAX_PIXELS);
    }

    #[test]
    fn tiny_image_is_ceiled_into_budget() {
        let budget = PixelBudget::default();
        let (h, w) = smart_resize_bounds(50, 60, &budget).unwrap();
        assert_eq!(h % 28, 0);
        assert_eq!(w % 28, 0);
        assert!((h as u64) * (w as u64) >= MIN_PIXELS);
    }

    #[test]
    fn linear_resize_keeps_in_budget_sizes() {
        let budget = PixelBudget::default();
        assert_eq!(resize_bounds(800, 1280, &budget), (800, 1280));
        let (h, w) = resize_bounds(10, 10, &budget);
        assert!((h as u64) * (w as u64) >= MIN_PIXELS);
    }

    #[test]
    fn factor_convention_divides_everything() {
        let bx = box_to_fraction(&[100.0, 100.0, 200.0, 200.0], &CoordinateConvention::Factor(1000.0))
            .unwrap();
        assert_eq!(bx, [0.1, 0.1, 0.2, 0.2]);
        assert_eq!(box_center(&bx), (0.15, 0.15));
    }

    #[test]
    fn axis_aware_convention_uses_width_for_x() {
        let conv = CoordinateConvention::AxisAware { height: 812.0, width: 1288.0 };
        let bx = box_to_fraction(&[644.0, 406.0], &conv).unwrap();
        assert_eq!(bx, [0.5, 0.5, 0.5, 0.5]);
    }

    #[test]
    fn odd_number_count_is_not_a_box() {
        assert!(box_to_fraction(&[1.0, 2.0, 3.0], &CoordinateConvention::Factor(1.0)).is_none());
    }
}
