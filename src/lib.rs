pub mod api;
pub mod assignment;
pub mod auth;
pub mod environment;
pub mod labels;
pub mod logging;
pub mod reconcile;
pub mod session;
pub mod storage;
pub mod table;

pub const TARGET_WEB_REQUEST: &str = "web_request";
pub const TARGET_STORAGE: &str = "storage";
pub const TARGET_SESSION: &str = "session";
