pub mod error;
pub mod event;
pub mod value;

pub use error::ExpectedError;
pub use event::{ExpectedEventsForClient, assert_events, event_matches};
pub use value::{UnifiedValueMatcher, ValueMatcher};
