//! src/stages/mod.rs
//!
//! Ready-made filters.
//!
//! | Stage       | Declared ROI        | Request                       | Batch                      |
//! |-------------|---------------------|-------------------------------|----------------------------|
//! | `Crop`      | intersected         | unchanged                     | unchanged                  |
//! | `Pad`       | grown / unbounded   | clipped to upstream           | filled outside             |
//! | `Normalize` | unchanged           | unchanged                     | `(x - offset) * factor`    |
//! | `DownSample`| adds coarse keys    | input over the output's ROI   | every `f`-th voxel         |
//! | `Augment`   | shrunk by context   | enlarged by the augmentation  | transformed, then cropped  |

mod augment;
mod crop;
mod downsample;
mod normalize;
mod pad;

pub use augment::{Augment, Augmentation, ContextPadding, IntensityAugment};
pub use crop::Crop;
pub use downsample::DownSample;
pub use normalize::Normalize;
pub use pad::Pad;
