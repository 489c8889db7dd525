pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::{StubBackend, PERSON_MARKER_RGB};

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;
