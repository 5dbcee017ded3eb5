// Error types the backend's callers need to tell apart
//
// Everything else travels as anyhow::Error with context attached.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// An error-severity message came through the validation layers
    #[error("Validation layer reported an error: {0}")]
    Validation(String),

    /// A frame tried to allocate more descriptors than its pool declares
    #[error("Descriptor pool exhausted: {0}")]
    DescriptorPoolExhausted(String),

    /// begin_frame / render_scene / end_frame called out of order
    #[error("Frame protocol violated: {0}")]
    FrameOrder(&'static str),

    /// Fence wait timed out or the driver reported device loss
    #[error("GPU device lost: {0}")]
    DeviceLost(String),

    /// No presentation surface can be created for this window system
    #[error("Surface unavailable: {0}")]
    SurfaceUnavailable(String),

    #[error("No suitable GPU found")]
    NoSuitableGpu,
}

/// Look through an anyhow chain for a backend error
pub fn backend_error(err: &anyhow::Error) -> Option<&BackendError> {
    err.chain().find_map(|cause| cause.downcast_ref::<BackendError>())
}
