//! Request middleware and extractors.

pub mod actor;

pub use actor::{ACTOR_ID_HEADER, ACTOR_ROLE_HEADER, STUDENT_IDS_HEADER};
