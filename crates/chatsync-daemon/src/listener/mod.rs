pub mod coordinator;
pub mod debounce;
pub mod event_loop;
pub mod watcher;

pub use coordinator::{CoordinatorSettings, PollCoordinator, PollOutcome};
pub use debounce::DebounceGate;
pub use event_loop::{CHAT_DB_KEY, ChatListener, run};
pub use watcher::{ChangeEvent, ChangeNotifier, WatchError, WatchEvent, modified_at};
