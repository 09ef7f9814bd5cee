//! Contact sheets comparing the samples of several experiment variants.
//!
//! Each column holds one variant, each row one sample index, with the variant
//! names drawn under the grid and the sample names on its right. Labels use
//! a configured TrueType font or the bundled DejaVu Sans.
use crate::error::{Error, Result};
use crate::image_io;
use crate::view::ViewMode;
use image::{imageops, Rgb, RgbImage};
use imageproc::drawing::draw_text_mut;
use log::{info, warn};
use rusttype::{Font, Scale};
use std::path::{Path, PathBuf};

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const BLACK: Rgb<u8> = Rgb([0, 0, 0]);
const LABEL_HEIGHT: f32 = 20.;
const BUNDLED_FONT: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

/// Room left on the right and at the bottom of the grid for the labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Margins {
    pub right: u32,
    pub bottom: u32,
}

impl Default for Margins {
    fn default() -> Self {
        Self { right: 100, bottom: 50 }
    }
}

pub const DEFAULT_VARIANTS: [&str; 4] = ["sum_out", "avg_out", "input_bias_out", "z123_bias_out"];

#[derive(Debug, Clone)]
pub struct CompositeSpec {
    pub root: PathBuf,
    pub variants: Vec<String>,
    pub example_id: String,
    pub view_mode: ViewMode,
    pub samples: usize,
    pub margins: Margins,
}

impl CompositeSpec {
    pub fn new<P: Into<PathBuf>>(root: P, example_id: &str, view_mode: ViewMode) -> Self {
        Self {
            root: root.into(),
            variants: DEFAULT_VARIANTS.iter().map(|v| v.to_string()).collect(),
            example_id: example_id.to_string(),
            view_mode,
            samples: 5,
            margins: Margins::default(),
        }
    }

    /// `{root}/{variant}/{example}/{view}{index}.png`, `index` starting at 1.
    pub fn tile_path(&self, variant: &str, index: usize) -> PathBuf {
        self.root
            .join(variant)
            .join(&self.example_id)
            .join(self.view_mode.sample_file_name(index))
    }

    pub fn output_name(&self) -> String {
        format!("{}_{}.png", self.view_mode, self.example_id)
    }

    fn read_tile(&self, variant: &str, index: usize) -> Option<RgbImage> {
        let path = self.tile_path(variant, index);
        if !path.exists() {
            warn!("File not found: {path:?}");
            return None;
        }
        match image::open(&path) {
            Ok(image) => Some(image.to_rgb8()),
            Err(err) => {
                warn!("Cannot read {path:?}: {err}");
                None
            }
        }
    }

    /// Lays the tiles out, `Ok(None)` when not a single one exists.
    pub fn build(&self, font: &Font<'_>) -> Result<Option<RgbImage>> {
        if self.variants.is_empty() || self.samples == 0 {
            return Err(Error::invalid("a composite needs at least one variant and one sample"));
        }
        let mut tiles = Vec::with_capacity(self.samples * self.variants.len());
        for index in 1..=self.samples {
            for variant in self.variants.iter() {
                tiles.push(self.read_tile(variant, index))
            }
        }
        let Some((tile_width, tile_height)) = tiles.iter().flatten().map(|t| t.dimensions()).next()
        else {
            return Ok(None);
        };
        let columns = self.variants.len() as u32;
        let width = columns * tile_width + self.margins.right;
        let height = self.samples as u32 * tile_height + self.margins.bottom;
        let mut canvas = RgbImage::from_pixel(width, height, WHITE);
        for (position, tile) in tiles.into_iter().enumerate() {
            let Some(tile) = tile else { continue };
            let (column, row) = (position as u32 % columns, position as u32 / columns);
            let tile = image_io::resize(tile, tile_width, tile_height);
            imageops::overlay(
                &mut canvas,
                &tile,
                (column * tile_width) as i64,
                (row * tile_height) as i64,
            );
        }
        self.draw_labels(&mut canvas, font, tile_width, tile_height);
        Ok(Some(canvas))
    }

    fn draw_labels(&self, canvas: &mut RgbImage, font: &Font<'_>, tile_width: u32, tile_height: u32) {
        let scale = Scale::uniform(LABEL_HEIGHT);
        let grid_height = (self.samples as u32 * tile_height) as i32;
        for (column, variant) in self.variants.iter().enumerate() {
            let x = (column as u32 * tile_width + tile_width / 2) as i32 - 20;
            draw_text_mut(canvas, BLACK, x, grid_height + 10, scale, font, variant);
        }
        let grid_width = (self.variants.len() as u32 * tile_width) as i32;
        for row in 0..self.samples {
            let y = (row as u32 * tile_height + tile_height / 2) as i32 - 10;
            let label = format!("{}{}", self.view_mode, row + 1);
            draw_text_mut(canvas, BLACK, grid_width + 10, y, scale, font, &label);
        }
    }
}

/// Reads a TrueType font for the labels.
pub fn load_font<P: AsRef<Path>>(path: P) -> Result<Font<'static>> {
    let path = path.as_ref();
    crate::utils::ensure_exists(path)?;
    let data = std::fs::read(path)?;
    Font::try_from_vec(data).ok_or_else(|| Error::invalid(format!("{path:?} is not a usable font")))
}

/// The DejaVu Sans font shipped with the crate.
pub fn default_font() -> Result<Font<'static>> {
    Font::try_from_bytes(BUNDLED_FONT).ok_or_else(|| Error::invalid("the bundled font cannot be parsed"))
}

/// Builds the composite of every view mode and example, saved under `out_dir`.
/// Returns the paths written.
pub fn build_all<P: AsRef<Path>, Q: AsRef<Path>>(
    root: P,
    variants: &[String],
    example_ids: &[String],
    view_modes: &[ViewMode],
    samples: usize,
    font: &Font<'_>,
    out_dir: Q,
) -> Result<Vec<PathBuf>> {
    let out_dir = out_dir.as_ref();
    std::fs::create_dir_all(out_dir)?;
    let mut written = vec![];
    for &view_mode in view_modes.iter() {
        for example_id in example_ids.iter() {
            let spec = CompositeSpec {
                variants: variants.to_vec(),
                samples,
                ..CompositeSpec::new(root.as_ref(), example_id, view_mode)
            };
            match spec.build(font)? {
                Some(canvas) => {
                    let path = out_dir.join(spec.output_name());
                    image_io::save(&canvas, &path)?;
                    info!("Composite image created for {view_mode} in {example_id}");
                    written.push(path)
                }
                None => warn!("No image found for {view_mode} in {example_id}"),
            }
        }
    }
    Ok(written)
}
