pub mod media;
pub mod watch_event;
pub mod sync_state;
pub mod dead_letter;
pub mod aggregate;

pub use media::{EpisodeInfo, MediaType};
pub use watch_event::WatchEvent;
pub use sync_state::{BackfillState, Cursor, HistoryWindow, SyncMode};
pub use dead_letter::DeadLetterEntry;
pub use aggregate::{AggregateLabel, DailyAggregate};
