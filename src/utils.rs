use crate::error::{Result, StarganError};
use burn::prelude::*;
use image::{GenericImage, Rgb, RgbImage};
use std::path::Path;

/// Map [-1, 1] normalized values back to [0, 1].
pub fn denorm(value: f32) -> f32 {
    ((value + 1.0) * 0.5).clamp(0.0, 1.0)
}

/// Convert a BCHW tensor in [-1, 1] to a vector of RGB images.
pub fn tensor_to_images<B: Backend>(tensor: Tensor<B, 4>) -> Result<Vec<RgbImage>> {
    let [batch, channels, height, width] = tensor.dims();
    if channels != 3 {
        return Err(StarganError::shape(format!(
            "expected 3 channels for images, got {channels}"
        )));
    }

    let values = tensor.into_data().convert::<f32>().to_vec::<f32>()?;
    let hw = height * width;
    let mut images = Vec::with_capacity(batch);

    for b in 0..batch {
        let base = b * channels * hw;
        let mut img = RgbImage::new(width as u32, height as u32);
        for y in 0..height {
            for x in 0..width {
                let idx = base + y * width + x;
                let pixel = [0, 1, 2].map(|c| (denorm(values[idx + c * hw]) * 255.0).round() as u8);
                img.put_pixel(x as u32, y as u32, Rgb(pixel));
            }
        }
        images.push(img);
    }

    Ok(images)
}

/// Merge images into a fixed grid (rows x cols), filled row by row.
pub fn merge_images(images: &[RgbImage], rows: usize, cols: usize) -> Result<RgbImage> {
    let first = images
        .first()
        .ok_or_else(|| StarganError::shape("no images to merge"))?;
    if images.len() > rows * cols {
        return Err(StarganError::shape(format!(
            "{} images do not fit a {rows}x{cols} grid",
            images.len()
        )));
    }
    let (width, height) = first.dimensions();
    let mut out = RgbImage::new(width * cols as u32, height * rows as u32);

    for (idx, img) in images.iter().enumerate() {
        if img.dimensions() != (width, height) {
            return Err(StarganError::shape(format!(
                "grid tile {idx} is {:?}, expected {:?}",
                img.dimensions(),
                (width, height)
            )));
        }
        let row = (idx / cols) as u32;
        let col = (idx % cols) as u32;
        out.copy_from(img, col * width, row * height)
            .map_err(|err| StarganError::shape(format!("failed to place grid tile: {err}")))?;
    }

    Ok(out)
}

/// Write a batch of images in [-1, 1] as one grid image, creating parent directories.
pub fn save_image_grid<B: Backend>(tensor: Tensor<B, 4>, path: &Path, rows: usize, cols: usize) -> Result<()> {
    let images = tensor_to_images(tensor)?;
    let grid = merge_images(&images, rows, cols)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    grid.save(path)?;
    Ok(())
}

/// Lay out column groups side by side: each tensor is one column of `N` tiles.
pub fn save_columns<B: Backend>(columns: Vec<Tensor<B, 4>>, path: &Path) -> Result<()> {
    let cols = columns.len();
    let rows = columns.first().map(|column| column.dims()[0]).unwrap_or(0);
    if cols == 0 || rows == 0 {
        return Err(StarganError::shape("no columns to save"));
    }
    // [cols, N, C, H, W] -> [N, cols, C, H, W] so the grid is filled row by row.
    let stacked: Tensor<B, 5> = Tensor::stack(columns, 0);
    let [_, _, channels, height, width] = stacked.dims();
    let tiles = stacked
        .swap_dims(0, 1)
        .reshape([rows * cols, channels, height, width]);
    save_image_grid(tiles, path, rows, cols)
}
