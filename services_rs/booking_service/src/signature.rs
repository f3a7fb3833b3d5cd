use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub fn hmac_hex(secret: &str, payload: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return String::new(),
    };
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison of `provided` against the hex HMAC of `payload`.
pub fn verify_hmac_hex(secret: &str, payload: &[u8], provided: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let provided = provided.trim().to_ascii_lowercase();
    if provided.is_empty() {
        return false;
    }
    let expected = hmac_hex(secret, payload);
    expected.as_bytes().ct_eq(provided.as_bytes()).unwrap_u8() == 1
}

fn checkout_payload(order_id: &str, payment_id: &str) -> String {
    format!("{order_id}|{payment_id}")
}

/// Signature the gateway's checkout hands back to the client.
pub fn checkout_signature(key_secret: &str, order_id: &str, payment_id: &str) -> String {
    hmac_hex(key_secret, checkout_payload(order_id, payment_id).as_bytes())
}

pub fn verify_checkout(key_secret: &str, order_id: &str, payment_id: &str, provided: &str) -> bool {
    verify_hmac_hex(
        key_secret,
        checkout_payload(order_id, payment_id).as_bytes(),
        provided,
    )
}

pub fn verify_webhook(webhook_secret: &str, raw_body: &[u8], provided: &str) -> bool {
    verify_hmac_hex(webhook_secret, raw_body, provided)
}
