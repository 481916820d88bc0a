mod call;
mod email;
mod env;
mod errors;
mod push;
mod sms;

pub use call::{place_call, PlaceCallParams};
pub use email::{send_email, SendEmailParams};
pub use errors::SendError;
pub use push::{send_push, SendPushParams};
pub use sms::{send_sms, SendSmsParams};

/// Provider acknowledgement for a single outbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReceipt {
    pub provider_id: Option<String>,
}
