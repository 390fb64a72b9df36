use base64::Engine as _;

use crate::errors::{HarnessError, HarnessResult};
use crate::perception::resize::{check_aspect_ratio, smart_resize_bounds, PixelBudget};
use crate::perception::types::ScreenshotMeta;

/// A screenshot ready to be attached to a model request.
pub struct PreparedScreenshot {
    pub image_bytes: Vec<u8>,
    pub image_base64: String,
    pub meta: ScreenshotMeta,
}

impl PreparedScreenshot {
    pub fn data_url(&self) -> String {
        format!("data:image/png;base64,{}", self.image_base64)
    }
}

/// Reads the dimensions of an encoded screenshot and enforces the aspect
/// ratio limit. Nothing downstream may see an image that fails here.
pub fn inspect_screenshot(bytes: &[u8]) -> HarnessResult<(u32, u32)> {
    let reader = image::ImageReader::new(std::io::Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| HarnessError::Perception(format!("screenshot format: {e}")))?;
    let (width, height) = reader.into_dimensions()?;
    check_aspect_ratio(height, width)?;
    Ok((width, height))
}

/// Resize into the pixel budget and re-encode as PNG + base64.
pub fn prepare_for_model(bytes: &[u8], budget: &PixelBudget) -> HarnessResult<PreparedScreenshot> {
    let (width, height) = inspect_screenshot(bytes)?;
    let (resized_h, resized_w) = smart_resize_bounds(height, width, budget)?;

    let img = image::load_from_memory(bytes)?;
    let img = if (resized_w, resized_h) == (width, height) {
        img
    } else {
        img.resize_exact(resized_w, resized_h, image::imageops::FilterType::Lanczos3)
    };

    let mut png = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
        .map_err(|e| HarnessError::Perception(format!("PNG encode: {e}")))?;
    let image_base64 = base64::engine::general_purpose::STANDARD.encode(&png);

    tracing::debug!(
        width,
        height,
        resized_w,
        resized_h,
        bytes = png.len(),
        "screenshot prepared"
    );

    Ok(PreparedScreenshot {
        image_bytes: png,
        image_base64,
        meta: ScreenshotMeta {
            original_width: width,
            original_height: height,
            resized_width: resized_w,
            resized_height: resized_h,
        },
    })
}
