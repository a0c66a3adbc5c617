use std::collections::HashMap;

/// Credential check consulted during CONNECT admission.
pub trait Authenticator: Send + Sync {
    fn check_valid(&self, username: &str, password: Option<&[u8]>) -> bool;
}

/// Accepts every username, the default when no credentials are configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn check_valid(&self, _: &str, _: Option<&[u8]>) -> bool {
        true
    }
}

/// Fixed username -> password table.
#[derive(Debug, Default, Clone)]
pub struct StaticAuthenticator {
    credentials: HashMap<String, String>,
}

impl StaticAuthenticator {
    pub fn new(credentials: HashMap<String, String>) -> StaticAuthenticator {
        StaticAuthenticator { credentials }
    }

    pub fn with_user(mut self, username: &str, password: &str) -> StaticAuthenticator {
        self.credentials
            .insert(username.to_string(), password.to_string());
        self
    }
}

impl Authenticator for StaticAuthenticator {
    fn check_valid(&self, username: &str, password: Option<&[u8]>) -> bool {
        match (self.credentials.get(username), password) {
            (Some(expected), Some(given)) => expected.as_bytes() == given,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_credentials() {
        let auth = StaticAuthenticator::default().with_user("alice", "secret");
        assert!(auth.check_valid("alice", Some(b"secret")));
        assert!(!auth.check_valid("alice", Some(b"wrong")));
        assert!(!auth.check_valid("alice", None));
        assert!(!auth.check_valid("bob", Some(b"secret")));
    }
}
