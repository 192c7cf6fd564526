pub mod camera;
pub mod frame_source;
pub mod phash;

pub use camera::{Camera, CameraError, CameraProvider, DirectoryCamera};
pub use frame_source::{capture_shared, release_shared, share, CameraLease, FrameSource, SharedLease};
