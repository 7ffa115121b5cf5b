pub mod encoding;
pub mod http;
pub mod id;

pub use encoding::{decode_body, encode_body};
pub use http::{status_reason, synthesize_response};
pub use id::generate_request_id;
