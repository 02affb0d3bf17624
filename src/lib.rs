pub mod dataloader;

pub use dataloader::seg_dataset::{DatasetConfig, SegDataset, SegDatasetIter};
pub use dataloader::transforms::{
    ColorJitter, Compose, GaussianBlur, Normalize, PostTransform, Transform,
};
