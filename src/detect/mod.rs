mod backend;
mod backends;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::{StubBackend, PERSON_MARKER_RGB};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use registry::BackendRegistry;
pub use result::{
    non_max_suppression, BoundingBox, DetectionEvent, PresencePolicy, DEFAULT_MIN_CONFIDENCE,
    PERSON_CLASS_ID,
};
