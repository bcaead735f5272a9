use uuid::Uuid;

/// Client order id: 128 random bits rendered as 32 lowercase hex digits.
/// Fits the exchange's 36-character limit on client ids.
pub fn generate_client_order_id() -> String {
    Uuid::new_v4().simple().to_string()
}
