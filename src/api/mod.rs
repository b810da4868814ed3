pub mod identity;
pub mod mp_client;
pub mod payments;
pub mod requests;
pub mod signature;
pub mod webhooks_mp;
