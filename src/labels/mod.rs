//! Label vocabulary and the typed records exchanged between the session and
//! the labeled-batch store.

mod types;

pub use self::types::*;
