pub mod annotations;
pub mod error;
pub mod image_access;
pub mod resolution;
pub mod serve;
pub mod transcode;
pub mod volume_index;

// Re-exports for easy access
pub use annotations::{AnnotationStore, ImageAnnotations, ImageLines};
pub use error::AppError;
pub use image_access::{ImageGateway, ImagePayload};
pub use serve::{build_router, AppState};
pub use transcode::{ImageCrateTranscoder, ImageTranscoder};
pub use volume_index::{IndexColumns, VolumeIndex};
