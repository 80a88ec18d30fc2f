pub mod tracing;

pub use self::tracing::{REQUEST_ID_HEADER, RequestMeta, request_context_middleware};
