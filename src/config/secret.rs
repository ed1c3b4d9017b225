//! Password wrapper kept out of logs.

use std::fmt;

/// Session or policy password.
///
/// `Debug` prints a placeholder, so configs, logins and user records can be
/// logged whole.
///
/// ```
/// use team_store::config::SecretString;
///
/// let passwd = SecretString::new("hunter2");
/// assert_eq!(format!("{passwd:?}"), "<REDACTED>");
/// assert_eq!(passwd.expose(), "hunter2");
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    /// Wraps a password.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The plain password, for binding into a statement or comparing.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<REDACTED>")
    }
}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
