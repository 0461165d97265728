use super::types::BetaMessage;

/// Non-streaming `POST /v1/messages` response body.
pub type CreateMessageResponse = BetaMessage;
