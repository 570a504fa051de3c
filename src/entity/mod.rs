pub mod builder;
pub mod capture;
pub mod map;
pub mod thread;

pub use builder::{
    EntityDescriptor, EntityMapBuilder, TransactionOptionsDescriptor, parse_descriptors,
};
pub use capture::{CaptureFilter, EventCapturer};
pub use map::{EntityKind, EntityMap, TEST_RUNNER_ID};
pub use thread::ThreadEntity;
