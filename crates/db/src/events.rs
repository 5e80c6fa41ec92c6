use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const EVENT_PAYMENT_SUCCESS: &str = "payment.success";
pub const EVENT_PAYMENT_FAILED: &str = "payment.failed";
pub const EVENT_PAYMENT_REFUNDED: &str = "payment.refunded";

/// Wire shape of an inbound webhook body. Field names are part of the
/// external contract; unknown fields are tolerated on decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEnvelope {
    pub event_type: String,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}
