// src/api/signature.rs

use hmac::{Hmac, Mac};
use sha2::Sha256;

/// HMAC-SHA256 in hex.
pub fn sign_hmac_sha256_hex(secret: &str, data: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(data.as_bytes());
    let result = mac.finalize().into_bytes();
    hex::encode(result)
}

/// Checks the `x-signature` header Mercado Pago sends with webhooks:
/// `ts=<unix>,v1=<hmac>`, where the hmac covers the manifest
/// `id:{data.id};request-id:{x-request-id};ts:{ts};` (data.id lowercased).
pub fn verify_webhook_signature(
    secret: &str,
    signature_header: &str,
    request_id: &str,
    data_id: &str,
) -> bool {
    let mut ts = None;
    let mut v1 = None;
    for part in signature_header.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            match key.trim() {
                "ts" => ts = Some(value.trim()),
                "v1" => v1 = Some(value.trim()),
                _ => {}
            }
        }
    }
    let (Some(ts), Some(v1)) = (ts, v1) else {
        return false;
    };
    let manifest = format!("id:{};request-id:{request_id};ts:{ts};", data_id.to_lowercase());
    sign_hmac_sha256_hex(secret, &manifest) == v1.to_lowercase()
}
