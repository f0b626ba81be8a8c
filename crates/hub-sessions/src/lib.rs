//! Session and message persistence: create/list/rename/delete sessions,
//! append messages, derive titles, and sweep idle sessions.

pub mod service;
pub mod title;

pub use service::SessionService;
pub use title::derive_title;
