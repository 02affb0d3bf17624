use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tch::Tensor;
use tracing::info;

use crate::dataloader::transforms::{self, PostTransform};
use crate::dataloader::{is_png_name, mask_name_for};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub augment: bool,
    pub height: u32,
    pub width: u32,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            augment: true,
            height: 210,
            width: 210,
        }
    }
}

/// Dataset of (image, mask) pairs for segmentation training.
///
/// Images live in one directory, masks in another; a mask file is
/// found by swapping the first underscore-delimited token of the image
/// filename for the `segmentation_` prefix. In training mode each pair
/// goes through a spatially consistent augmentation pipeline (resize
/// guard, random crop, random affine scale, random horizontal flip)
/// followed by color jitter and normalization on the image; in
/// evaluation mode both are converted to tensors at their original
/// size. The mask tensor is thresholded to {0, 1} in both modes.
pub struct SegDataset {
    img_dir: PathBuf,
    label_dir: PathBuf,
    config: DatasetConfig,
    post_transform: PostTransform,
    image_names: Vec<String>,
}

impl SegDataset {
    pub fn new<P: AsRef<Path>>(
        img_dir: P,
        label_dir: P,
        config: DatasetConfig,
        post_transform: Option<PostTransform>,
    ) -> Result<Self> {
        let img_dir = img_dir.as_ref().to_path_buf();
        let label_dir = label_dir.as_ref().to_path_buf();

        // The listing happens once; its order fixes the index order.
        let image_names: Vec<String> = fs::read_dir(&img_dir)
            .with_context(|| format!("Failed to list image directory: {:?}", img_dir))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| is_png_name(name))
            .collect();

        info!(count = image_names.len(), dir = ?img_dir, "enumerated image directory");

        Ok(Self {
            img_dir,
            label_dir,
            config,
            post_transform: post_transform.unwrap_or_default(),
            image_names,
        })
    }

    pub fn len(&self) -> usize {
        self.image_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_names.is_empty()
    }

    pub fn get_item(&self, index: usize) -> Result<(Tensor, Tensor)> {
        if index >= self.len() {
            return Err(anyhow::anyhow!("Index out of bounds"));
        }

        let name = &self.image_names[index];
        let img_path = self.img_dir.join(name);
        let image = image::open(&img_path)
            .with_context(|| format!("Failed to open image: {:?}", img_path))?;

        let mask_path = self.label_dir.join(mask_name_for(name));
        let mask = image::open(&mask_path)
            .with_context(|| format!("Failed to open mask: {:?}", mask_path))?;

        if self.config.augment {
            self.augment_pair(image, mask, &mut rand::thread_rng())
        } else {
            let image = transforms::to_tensor(&image);
            let mask = transforms::binarize(&transforms::mask_to_tensor(&mask));
            Ok((image, mask))
        }
    }

    pub fn iter(&self) -> SegDatasetIter<'_> {
        SegDatasetIter {
            dataset: self,
            current_index: 0,
        }
    }

    /// The augmentation pipeline. Every geometric step uses the same
    /// parameters on image and mask so the two stay aligned.
    fn augment_pair<R: Rng>(
        &self,
        mut image: DynamicImage,
        mut mask: DynamicImage,
        rng: &mut R,
    ) -> Result<(Tensor, Tensor)> {
        let (target_h, target_w) = (self.config.height, self.config.width);
        let (or_w, or_h) = image.dimensions();

        // Undersized inputs are upscaled until a full target crop fits.
        if or_w < target_w || or_h < target_h {
            let edge = target_h.max(target_w);
            image = transforms::resize_min_edge(&image, edge);
            mask = transforms::resize_min_edge(&mask, edge);
        }

        let (cur_w, cur_h) = image.dimensions();
        let top = rng.gen_range(0..=cur_h - target_h);
        let left = rng.gen_range(0..=cur_w - target_w);
        image = image.crop_imm(left, top, target_w, target_h);
        mask = mask.crop_imm(left, top, target_w, target_h);

        if rng.gen::<f32>() <= 0.5 {
            let scale = rng.gen_range(0.8..=1.2f32);
            image = transforms::affine_scale(&image, scale);
            mask = transforms::affine_scale(&mask, scale);
        }

        if rng.gen::<f32>() <= 0.5 {
            image = image.fliph();
            mask = mask.fliph();
        }

        let image = self.post_transform.apply(&image, rng);
        let mask = transforms::binarize(&transforms::mask_to_tensor(&mask));

        Ok((image, mask))
    }
}

pub struct SegDatasetIter<'a> {
    dataset: &'a SegDataset,
    current_index: usize,
}

impl Iterator for SegDatasetIter<'_> {
    type Item = Result<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_index >= self.dataset.len() {
            return None;
        }

        let result = self.dataset.get_item(self.current_index);
        self.current_index += 1;
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma, Rgb};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use tch::Kind;
    use tempfile::TempDir;

    fn write_rgb(path: &Path, width: u32, height: u32) {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x * 5 % 256) as u8, (y * 5 % 256) as u8, 64u8])
        });
        img.save(path).unwrap();
    }

    fn write_mask(path: &Path, width: u32, height: u32) {
        let img = ImageBuffer::from_fn(width, height, |x, _| {
            Luma([if x < width / 2 { 0u8 } else { 255u8 }])
        });
        img.save(path).unwrap();
    }

    fn fixture(img_size: (u32, u32)) -> (TempDir, PathBuf, PathBuf) {
        let dir = TempDir::new().unwrap();
        let img_dir = dir.path().join("images");
        let label_dir = dir.path().join("labels");
        fs::create_dir(&img_dir).unwrap();
        fs::create_dir(&label_dir).unwrap();

        write_rgb(&img_dir.join("img_001.png"), img_size.0, img_size.1);
        write_mask(&label_dir.join("segmentation_001.png"), img_size.0, img_size.1);
        fs::write(img_dir.join("notes.txt"), "not an image").unwrap();

        (dir, img_dir, label_dir)
    }

    fn small_config(augment: bool) -> DatasetConfig {
        DatasetConfig {
            augment,
            height: 8,
            width: 8,
        }
    }

    #[test]
    fn test_default_config() {
        let config = DatasetConfig::default();
        assert!(config.augment);
        assert_eq!(config.height, 210);
        assert_eq!(config.width, 210);
    }

    #[test]
    fn test_length_counts_only_png_names() {
        let (_dir, img_dir, label_dir) = fixture((16, 16));
        let dataset = SegDataset::new(&img_dir, &label_dir, small_config(true), None).unwrap();

        assert_eq!(dataset.len(), 1);
        assert!(!dataset.is_empty());
    }

    #[test]
    fn test_get_item_pairs_image_with_mask() {
        let (_dir, img_dir, label_dir) = fixture((16, 16));
        let dataset = SegDataset::new(&img_dir, &label_dir, small_config(true), None).unwrap();

        let (image, mask) = dataset.get_item(0).unwrap();
        assert_eq!(image.size().len(), 3);
        assert_eq!(mask.size().len(), 3);
    }

    #[test]
    fn test_augmented_output_has_target_dimensions() {
        let (_dir, img_dir, label_dir) = fixture((20, 14));
        let dataset = SegDataset::new(&img_dir, &label_dir, small_config(true), None).unwrap();

        for _ in 0..10 {
            let (image, mask) = dataset.get_item(0).unwrap();
            assert_eq!(image.size(), vec![3, 8, 8]);
            assert_eq!(mask.size(), vec![1, 8, 8]);
        }
    }

    #[test]
    fn test_undersized_image_is_upscaled_to_target() {
        let (_dir, img_dir, label_dir) = fixture((5, 6));
        let dataset = SegDataset::new(&img_dir, &label_dir, small_config(true), None).unwrap();

        let (image, mask) = dataset.get_item(0).unwrap();
        assert_eq!(image.size(), vec![3, 8, 8]);
        assert_eq!(mask.size(), vec![1, 8, 8]);
    }

    #[test]
    fn test_mask_is_strictly_binary() {
        let (_dir, img_dir, label_dir) = fixture((16, 16));
        let dataset = SegDataset::new(&img_dir, &label_dir, small_config(true), None).unwrap();

        for _ in 0..10 {
            let (_, mask) = dataset.get_item(0).unwrap();
            let numel = mask.numel() as f64;
            let zeros =
                f64::try_from(mask.eq(0.0).to_kind(Kind::Float).sum(Kind::Float)).unwrap();
            let ones =
                f64::try_from(mask.eq(1.0).to_kind(Kind::Float).sum(Kind::Float)).unwrap();
            assert_eq!(zeros + ones, numel);
        }
    }

    #[test]
    fn test_no_augmentation_keeps_original_dimensions() {
        let (_dir, img_dir, label_dir) = fixture((20, 14));
        let dataset = SegDataset::new(&img_dir, &label_dir, small_config(false), None).unwrap();

        let (image, mask) = dataset.get_item(0).unwrap();
        assert_eq!(image.size(), vec![3, 14, 20]);
        assert_eq!(mask.size(), vec![1, 14, 20]);
    }

    #[test]
    fn test_index_out_of_bounds() {
        let (_dir, img_dir, label_dir) = fixture((16, 16));
        let dataset = SegDataset::new(&img_dir, &label_dir, small_config(true), None).unwrap();

        assert!(dataset.get_item(1).is_err());
    }

    #[test]
    fn test_missing_mask_is_an_error() {
        let dir = TempDir::new().unwrap();
        let img_dir = dir.path().join("images");
        let label_dir = dir.path().join("labels");
        fs::create_dir(&img_dir).unwrap();
        fs::create_dir(&label_dir).unwrap();
        write_rgb(&img_dir.join("img_001.png"), 16, 16);

        let dataset = SegDataset::new(&img_dir, &label_dir, small_config(true), None).unwrap();
        assert_eq!(dataset.len(), 1);
        assert!(dataset.get_item(0).is_err());
    }

    #[test]
    fn test_iterator_yields_every_sample() {
        let (_dir, img_dir, label_dir) = fixture((16, 16));
        let dataset = SegDataset::new(&img_dir, &label_dir, small_config(true), None).unwrap();

        let samples: Vec<_> = dataset.iter().collect();
        assert_eq!(samples.len(), 1);
        assert!(samples[0].is_ok());
    }

    #[test]
    fn test_augment_pair_is_deterministic_under_seed() {
        let (_dir, img_dir, label_dir) = fixture((20, 20));
        let dataset = SegDataset::new(&img_dir, &label_dir, small_config(true), None).unwrap();

        let image = image::open(img_dir.join("img_001.png")).unwrap();
        let mask = image::open(label_dir.join("segmentation_001.png")).unwrap();

        let mut rng_a = ChaCha8Rng::seed_from_u64(42);
        let mut rng_b = ChaCha8Rng::seed_from_u64(42);

        let (img_a, mask_a) = dataset
            .augment_pair(image.clone(), mask.clone(), &mut rng_a)
            .unwrap();
        let (img_b, mask_b) = dataset.augment_pair(image, mask, &mut rng_b).unwrap();

        let image_diff = f64::try_from((img_a - img_b).abs().sum(Kind::Float)).unwrap();
        let mask_diff = f64::try_from((mask_a - mask_b).abs().sum(Kind::Float)).unwrap();
        assert_eq!(image_diff, 0.0);
        assert_eq!(mask_diff, 0.0);
    }
}
