pub mod callback_processor;
pub mod payment;
pub mod webhook;

pub use callback_processor::{CallbackError, CallbackOutcome, CallbackProcessor};
pub use payment::{InitiatePayment, InitiatedPayment, PaymentError, PaymentService};
pub use webhook::{
    sign_payload, DeliveryReceipt, RetrySchedule, WebhookDispatcher, WebhookError, WebhookPayload,
    MAX_ATTEMPTS, SIGNATURE_HEADER,
};
