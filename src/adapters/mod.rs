//! Adapters: concrete implementations of the hexagonal port traits.
//!
//! | Adapter    | Implements       | Connects to                  |
//! |------------|------------------|------------------------------|
//! | `log_sink` | EventSink        | `log` facade                 |
//! | `sim`      | CommandExecutor  | In-process simulated pod     |
//! | `store`    | StoragePort      | In-memory key-value map      |
//! |            | SessionStore     | Any StoragePort (postcard)   |
//! | `time`     | Clock            | Host monotonic + wall clock  |

pub mod log_sink;
pub mod sim;
pub mod store;
pub mod time;
