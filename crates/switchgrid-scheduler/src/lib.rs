//! Durable wall-clock event scheduler.
//!
//! Events live in the key-value store under the `timer/` prefix, so they
//! survive restarts and can be created or edited by any store writer. A
//! background poll loop scans the prefix once a minute and arms an in-process
//! timer for every event due inside the scheduling window.

mod event;
mod scheduler;

pub use event::{next_occurrence, Event, TIMER_KEY_PREFIX};
pub use scheduler::{
    EventCallback, Scheduler, SchedulerOptions, CALLBACK_RETRY_DELAY, CALLBACK_RETRY_LIMIT,
    EVENT_SCAN_INTERVAL, EVENT_SCHEDULE_WINDOW,
};
