//! curate-stages: The built-in image stages.
//!
//! Each stage is a [`StageTransform`](curate_pipeline::StageTransform)
//! that reads the images in its input directory and writes its results
//! to its output directory:
//!
//! - [`Select`]: best-resolution image per filename-prefix group
//! - [`Resize`]: shorter side scaled to `target_size`
//! - [`FaceCrop`]: `target_size` square around the detected faces
//! - [`SingleFace`]: images with exactly one face
//! - [`Zoom`]: tight crop around the single face
//! - [`MinResolution`]: images at least `min_size` on both sides
//! - [`Identify`]: images of the most frequent identity
//! - [`SortSimilarity`]: every image, prefixed with its similarity to
//!   a reference set
//!
//! Face detection and face encoding are supplied by the caller through
//! [`FaceDetector`] and [`FaceEncoder`]. Per-file work inside a stage
//! runs on the rayon thread pool.

pub mod detect;
pub mod face_crop;
pub mod files;
pub mod identify;
pub mod min_resolution;
pub mod presets;
pub mod resize;
pub mod select;
pub mod single_face;
pub mod sort_similarity;
pub mod zoom;

pub use detect::{CollaboratorError, FaceBox, FaceDetector, FaceEncoder, FaceEncoding, NoFaceDetector};
pub use face_crop::FaceCrop;
pub use identify::Identify;
pub use min_resolution::MinResolution;
pub use presets::Preset;
pub use resize::Resize;
pub use select::Select;
pub use single_face::SingleFace;
pub use sort_similarity::SortSimilarity;
pub use zoom::Zoom;
