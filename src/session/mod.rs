//! Interactive annotation sessions.
//!
//! A session walks a user through their assigned articles one at a time,
//! keeps the answers in memory and sends them as a single batch on request.

mod fetch;
mod state;
mod terminal;

pub use self::fetch::{fetch_work, fetch_work_or_empty, WorkSource};
pub use self::state::*;
pub use self::terminal::run_interactive;
