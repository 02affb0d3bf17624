pub mod seg_dataset;
pub mod transforms;

pub use seg_dataset::{DatasetConfig, SegDataset, SegDatasetIter};
pub use transforms::{ColorJitter, Compose, GaussianBlur, Normalize, PostTransform, Transform};

/// Dataset items are the files whose name contains ".png".
pub fn is_png_name(name: &str) -> bool {
    name.contains(".png")
}

/// Derives the mask filename for an image filename: the first
/// underscore-delimited token is replaced by the `segmentation_`
/// prefix. A name without an underscore yields bare `segmentation_`.
pub fn mask_name_for(image_name: &str) -> String {
    let rest = match image_name.split_once('_') {
        Some((_, rest)) => rest,
        None => "",
    };
    format!("segmentation_{}", rest)
}
