mod registry;
mod replay;
mod source;
mod stub;

pub use registry::{split_locator, SourceFactory, SourceRegistry};
pub use replay::{ReplayConfig, ReplaySource, ReplayStats};
pub use source::DetectionSource;
pub use stub::StubSource;
