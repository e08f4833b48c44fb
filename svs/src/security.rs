//! Pluggable signing and validation.
//!
//! Cryptographic identity is out of scope for the protocol itself; the
//! engine only needs a way to sign what it sends and a policy for what it
//! accepts. The built-in options are no signing and HMAC-SHA256 over a shared
//! group key; anything else plugs in through the traits.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::packet::{Data, Interest};

/// Signs outgoing data packets.
pub trait DataSigner: Send + Sync + 'static {
    fn sign_data(&self, data: &mut Data);
}

/// Signs outgoing interests under the `custom` policy.
pub trait InterestSigner: Send + Sync + 'static {
    fn sign_interest(&self, interest: &mut Interest);
}

/// Accepts or rejects received packets.
///
/// Both methods default to accepting; implement the one you care about.
pub trait Validator: Send + Sync + 'static {
    fn verify_data(&self, _data: &Data) -> bool {
        true
    }

    fn verify_interest(&self, _interest: &Interest) -> bool {
        true
    }
}

/// Leaves packets unsigned.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSigner;

impl DataSigner for NullSigner {
    fn sign_data(&self, _data: &mut Data) {}
}

impl InterestSigner for NullSigner {
    fn sign_interest(&self, _interest: &mut Interest) {}
}

/// A shared HMAC-SHA256 key.
#[derive(Clone)]
pub struct HmacKey {
    key: Bytes,
}

impl HmacKey {
    pub fn new(key: impl Into<Bytes>) -> Self {
        Self { key: key.into() }
    }

    pub fn sign(&self, message: &[u8]) -> Bytes {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(message);
        Bytes::copy_from_slice(&mac.finalize().into_bytes())
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(message);
        mac.verify_slice(signature).is_ok()
    }
}

impl std::fmt::Debug for HmacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("HmacKey").finish_non_exhaustive()
    }
}

impl DataSigner for HmacKey {
    fn sign_data(&self, data: &mut Data) {
        let signature = self.sign(&data.signed_portion());
        data.set_signature(signature);
    }
}

impl Validator for HmacKey {
    fn verify_data(&self, data: &Data) -> bool {
        self.verify(&data.signed_portion(), data.signature())
    }

    fn verify_interest(&self, interest: &Interest) -> bool {
        match interest.signature() {
            Some(signature) => self.verify(&interest.signed_portion(), signature),
            None => false,
        }
    }
}

/// How sync interests are signed and checked.
#[derive(Clone, Default)]
pub enum InterestSigningPolicy {
    /// Accept everything, sign nothing.
    #[default]
    None,
    /// HMAC-SHA256 over a shared key; failures drop silently.
    Hmac(HmacKey),
    /// Sign with the given signer; verify with the configured validator.
    Custom(Arc<dyn InterestSigner>),
}

impl std::fmt::Debug for InterestSigningPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            InterestSigningPolicy::None => write!(f, "None"),
            InterestSigningPolicy::Hmac(_) => write!(f, "Hmac"),
            InterestSigningPolicy::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// Security configuration for one sync instance.
#[derive(Clone)]
pub struct SecurityOptions {
    /// Policy for sync interests.
    pub interest_signing: InterestSigningPolicy,
    /// Signer for sync-layer data packets (outer packets, mapping replies).
    pub data_signer: Arc<dyn DataSigner>,
    /// Signer for application publications (inner packets). Defaults to the
    /// same as `data_signer`.
    pub pub_signer: Arc<dyn DataSigner>,
    /// Validator for fetched data and, under the custom policy, interests.
    pub validator: Option<Arc<dyn Validator>>,
    /// Validator for encapsulated publication data.
    pub encapsulated_data_validator: Option<Arc<dyn Validator>>,
    /// Retries when validation of fetched data fails.
    pub n_retries_on_validation_fail: u32,
    /// Delay before a validation-failure retry.
    pub retry_delay_on_validation_fail: Duration,
}

impl Default for SecurityOptions {
    fn default() -> Self {
        let null = Arc::new(NullSigner);
        Self {
            interest_signing: InterestSigningPolicy::None,
            data_signer: null.clone(),
            pub_signer: null,
            validator: None,
            encapsulated_data_validator: None,
            n_retries_on_validation_fail: 0,
            retry_delay_on_validation_fail: Duration::from_millis(300),
        }
    }
}

impl std::fmt::Debug for SecurityOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SecurityOptions")
            .field("interest_signing", &self.interest_signing)
            .field("validator", &self.validator.is_some())
            .field(
                "encapsulated_data_validator",
                &self.encapsulated_data_validator.is_some(),
            )
            .field(
                "n_retries_on_validation_fail",
                &self.n_retries_on_validation_fail,
            )
            .finish_non_exhaustive()
    }
}
