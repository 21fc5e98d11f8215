//! Event loop, subprocess runner, and miscellaneous parsing used throughout
//! rsbackup: the layer below the data model and policy logic
//! ([`rsbackup-api-types`](../rsbackup_api_types/index.html)), with no
//! dependency back onto it.

pub mod base64;
pub mod event_loop;
pub mod file_logger;
pub mod name_cmp;
pub mod parsing;
pub mod process_lock;
pub mod subprocess;

pub use event_loop::{EventLoop, Reactor, SharedReactor};
pub use file_logger::{FileLogOptions, FileLogger};
pub use name_cmp::name_cmp;
pub use parsing::{
    format_time_interval, format_time_of_day, now_backup, now_finish, parse_integer,
    parse_time_interval, parse_time_of_day, today,
};
pub use process_lock::{ProcessLock, ProcessLockGuard};
pub use subprocess::{
    run_command, run_standalone, spawn_captured, Completion, CompletionPolicy, SubprocessSpec,
};
