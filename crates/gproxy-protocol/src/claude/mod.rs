pub mod count_tokens;
pub mod create_message;
pub mod error;
pub mod get_model;
pub mod list_models;
pub mod types;

pub use error::{ErrorDetail, ErrorResponse, ErrorType};
pub use types::{AnthropicHeaders, AnthropicResponseHeaders, AnthropicVersion, RequestId};
