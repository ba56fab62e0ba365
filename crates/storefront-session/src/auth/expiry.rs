use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

/// Renew this long before the access credential expires (5 minutes)
pub const DEFAULT_RENEWAL_MARGIN_SECS: i64 = 5 * 60;

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    exp: Option<f64>,
}

/// Works out when an access credential should be renewed.
#[derive(Debug, Clone, Copy)]
pub struct ExpiryClock {
    margin: Duration,
}

impl Default for ExpiryClock {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_RENEWAL_MARGIN_SECS))
    }
}

impl ExpiryClock {
    pub fn new(margin: Duration) -> Self {
        Self { margin }
    }

    pub fn margin(&self) -> Duration {
        self.margin
    }

    /// Expiry claim of a JWT-shaped credential, `None` if it has none or
    /// cannot be decoded.
    pub fn expires_at(&self, credential: &str) -> Option<DateTime<Utc>> {
        let mut segments = credential.split('.');
        let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
        if segments.next().is_some() {
            return None;
        }

        let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
        let claims: Claims = serde_json::from_slice(&bytes).ok()?;
        let exp = claims.exp.filter(|e| e.is_finite())?;
        DateTime::from_timestamp(exp as i64, 0)
    }

    /// When to renew: expiry minus the margin. May already be in the past,
    /// which means "renew now".
    pub fn deadline_for(&self, credential: &str) -> Option<DateTime<Utc>> {
        self.expires_at(credential)?.checked_sub_signed(self.margin)
    }
}
