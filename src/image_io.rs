//! Conversions between image files, `RgbImage` rasters and model tensors.
use crate::error::{Error, Result};
use image::{imageops, RgbImage};
use log::debug;
use std::path::Path;
use tch::{Device, Kind, Tensor};

/// Reads an image as RGB, resized to `width` x `height` when it differs.
pub fn load_rgb<P: AsRef<Path>>(path: P, width: u32, height: u32) -> Result<RgbImage> {
    let path = path.as_ref();
    crate::utils::ensure_exists(path)?;
    let image = image::open(path)?.to_rgb8();
    Ok(resize(image, width, height))
}

pub fn resize(image: RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        image
    } else {
        debug!("Resizing {:?} to {width}x{height}.", image.dimensions());
        imageops::resize(&image, width, height, imageops::FilterType::Lanczos3)
    }
}

/// Model input `[1, 3, H, W]` with values in `[-1, 1]`, the spatial size
/// rounded down to a multiple of 32.
pub fn preprocess(image: &RgbImage) -> Result<Tensor> {
    let (width, height) = image.dimensions();
    let (width, height) = (width - width % 32, height - height % 32);
    if width == 0 || height == 0 {
        return Err(Error::invalid(format!(
            "image of size {:?} is smaller than 32 pixels",
            image.dimensions()
        )));
    }
    let image = resize(image.clone(), width, height);
    let tensor =
        Tensor::f_from_data_size(image.as_raw(), &[height as i64, width as i64, 3], Kind::Uint8)?;
    let tensor = tensor.permute([2, 0, 1]).to_kind(Kind::Float) / 255.;
    Ok((tensor * 2. - 1.).unsqueeze(0))
}

/// Raster of a decoded image, `[1, 3, H, W]` or `[3, H, W]` with values in `[-1, 1]`.
pub fn postprocess(image: &Tensor) -> Result<RgbImage> {
    let image = match image.dim() {
        4 => image.squeeze_dim(0),
        3 => image.shallow_clone(),
        _ => return Err(Error::Backend(format!("cannot turn {:?} into an image", image.size()))),
    };
    let (channels, height, width) = image.size3()?;
    if channels != 3 {
        return Err(Error::Backend(format!("expected 3 channels, got {channels}")));
    }
    let image = ((image / 2. + 0.5).clamp(0., 1.) * 255.)
        .to_kind(Kind::Uint8)
        .to_device(Device::Cpu)
        .permute([1, 2, 0])
        .contiguous()
        .flatten(0, -1);
    let data = Vec::<u8>::try_from(image)?;
    RgbImage::from_raw(width as u32, height as u32, data)
        .ok_or_else(|| Error::Backend("decoded buffer does not match its size".to_string()))
}

/// Cuts a sheet into `columns` x `rows` equal cells, in row-major order.
pub fn split_sheet(sheet: &RgbImage, columns: u32, rows: u32) -> Result<Vec<RgbImage>> {
    let (cell_width, cell_height) = (sheet.width() / columns.max(1), sheet.height() / rows.max(1));
    if cell_width == 0 || cell_height == 0 {
        return Err(Error::invalid(format!(
            "sheet of size {:?} cannot hold {columns}x{rows} cells",
            sheet.dimensions()
        )));
    }
    let mut cells = Vec::with_capacity((columns * rows) as usize);
    for row in 0..rows {
        for column in 0..columns {
            let cell = imageops::crop_imm(
                sheet,
                column * cell_width,
                row * cell_height,
                cell_width,
                cell_height,
            );
            cells.push(cell.to_image());
        }
    }
    Ok(cells)
}

pub fn save<P: AsRef<Path>>(image: &RgbImage, path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    image.save(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn tensor_round_trip_keeps_pixels() {
        let image = RgbImage::from_fn(64, 32, |x, y| Rgb([(x * 4) as u8, (y * 8) as u8, 200]));
        let tensor = preprocess(&image).unwrap();
        assert_eq!(tensor.size(), vec![1, 3, 32, 64]);
        let back = postprocess(&tensor).unwrap();
        assert_eq!(back.dimensions(), (64, 32));
        for (a, b) in image.pixels().zip(back.pixels()) {
            for c in 0..3 {
                assert!((a[c] as i32 - b[c] as i32).abs() <= 1);
            }
        }
    }

    #[test]
    fn preprocess_rounds_to_multiples_of_32() {
        let image = RgbImage::new(70, 40);
        assert_eq!(preprocess(&image).unwrap().size(), vec![1, 3, 32, 64]);
        assert!(preprocess(&RgbImage::new(20, 20)).is_err());
    }

    #[test]
    fn sheet_cells_in_row_major_order() {
        let sheet = RgbImage::from_fn(20, 30, |x, y| Rgb([(x / 10) as u8, (y / 10) as u8, 0]));
        let cells = split_sheet(&sheet, 2, 3).unwrap();
        assert_eq!(cells.len(), 6);
        assert_eq!(cells[0].dimensions(), (10, 10));
        assert_eq!(cells[1].get_pixel(0, 0), &Rgb([1, 0, 0]));
        assert_eq!(cells[2].get_pixel(0, 0), &Rgb([0, 1, 0]));
        assert_eq!(cells[5].get_pixel(9, 9), &Rgb([1, 2, 0]));
    }

    #[test]
    fn missing_image() {
        assert!(matches!(load_rgb("nowhere.png", 8, 8), Err(Error::MissingAsset(_))));
    }
}
