//! Redacted string wrapper for credentials
//!
//! Registry passwords, the cloud client secret and cluster key material are held
//! in [`Sensitive`] so that `Debug`/`Display` (and therefore `tracing` fields and
//! error messages) never print them. The buffer is zeroized on drop.

use std::fmt;

use zeroize::Zeroizing;

/// Placeholder printed in place of a sensitive value
pub const REDACTED: &str = "<redacted>";

/// A string whose contents are never formatted
#[derive(Clone, PartialEq, Eq)]
pub struct Sensitive(Zeroizing<String>);

impl Sensitive {
    /// Wrap a secret value
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// Access the secret value
    ///
    /// Callers must not log or echo the returned string.
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    /// True if the wrapped value is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Sensitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl fmt::Display for Sensitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl From<String> for Sensitive {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Sensitive {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl std::str::FromStr for Sensitive {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}
