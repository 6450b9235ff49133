//! Database and session credentials

use secrecy::{ExposeSecret, SecretString};

/// Credentials for one deployment.
///
/// The secret halves are wrapped so `Debug` output never shows them.
#[derive(Debug)]
pub struct Credentials {
    pub database_name: String,
    pub database_user: String,
    pub database_password: SecretString,
    pub session_secret: SecretString,
}

impl Credentials {
    pub fn new(
        database_name: impl Into<String>,
        database_user: impl Into<String>,
        database_password: impl Into<String>,
        session_secret: impl Into<String>,
    ) -> Self {
        Self {
            database_name: database_name.into(),
            database_user: database_user.into(),
            database_password: SecretString::from(database_password.into()),
            session_secret: SecretString::from(session_secret.into()),
        }
    }

    /// Secret values, for redaction of captured output
    pub fn secret_values(&self) -> Vec<&str> {
        vec![
            self.database_password.expose_secret(),
            self.session_secret.expose_secret(),
        ]
    }
}

impl Clone for Credentials {
    fn clone(&self) -> Self {
        Self::new(
            self.database_name.clone(),
            self.database_user.clone(),
            self.database_password.expose_secret(),
            self.session_secret.expose_secret(),
        )
    }
}

impl PartialEq for Credentials {
    fn eq(&self, other: &Self) -> bool {
        self.database_name == other.database_name
            && self.database_user == other.database_user
            && self.database_password.expose_secret() == other.database_password.expose_secret()
            && self.session_secret.expose_secret() == other.session_secret.expose_secret()
    }
}
