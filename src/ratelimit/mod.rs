//! Sliding-window rate limiting: field extraction, correlation matching,
//! the request window and admission decisions.

mod fields;
mod limiter;
mod matcher;
mod window;

pub use fields::{FieldName, FieldSnapshot, FieldValue, RequestContext};
pub use limiter::{AdmissionController, Decision};
pub use matcher::MatchMethod;
pub use window::{RequestRecord, SlidingWindow};
