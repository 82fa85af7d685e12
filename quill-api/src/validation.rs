//! Input Validation
//!
//! Field-level validation for account mutations. Failures are reported as
//! per-field errors so the client can attach them to form inputs rather
//! than aborting the whole GraphQL response.

use once_cell::sync::Lazy;
use regex::Regex;

/// Loose email shape check. Deliverability is the mailer's problem; this
/// only rejects obviously malformed addresses.
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex is valid")
});

/// A validation failure attached to a single input field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a registration request. Returns every failure, not just the
/// first, so the client can surface all of them at once.
pub fn validate_register(username: &str, email: &str, password: &str) -> Vec<FieldError> {
    let mut errors = Vec::new();

    if username.len() <= 2 {
        errors.push(FieldError::new(
            "username",
            "Username must be longer than 2 characters",
        ));
    }
    if username.contains('@') {
        errors.push(FieldError::new("username", "Username cannot include an @"));
    }

    if !EMAIL_RE.is_match(email) {
        errors.push(FieldError::new("email", "Invalid email address"));
    }

    errors.extend(validate_password("password", password));
    errors
}

/// Validate a password under the given field name (registration uses
/// "password", the reset flow uses "newPassword").
pub fn validate_password(field: &str, password: &str) -> Vec<FieldError> {
    if password.len() <= 3 {
        vec![FieldError::new(
            field,
            "Password must be longer than 3 characters",
        )]
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_registration_passes() {
        let errors = validate_register("alice", "alice@example.com", "hunter2");
        assert!(errors.is_empty());
    }

    #[test]
    fn test_short_username_rejected() {
        let errors = validate_register("ab", "ab@example.com", "hunter2");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "username");
    }

    #[test]
    fn test_username_with_at_sign_rejected() {
        let errors = validate_register("not@name", "me@example.com", "hunter2");
        assert!(errors.iter().any(|e| e.field == "username"));
    }

    #[test]
    fn test_bad_email_rejected() {
        for email in ["plainaddress", "missing@tld", "two words@example.com", ""] {
            let errors = validate_register("alice", email, "hunter2");
            assert!(
                errors.iter().any(|e| e.field == "email"),
                "expected email error for {:?}",
                email
            );
        }
    }

    #[test]
    fn test_all_failures_reported_together() {
        let errors = validate_register("a", "bad", "x");
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"username"));
        assert!(fields.contains(&"email"));
        assert!(fields.contains(&"password"));
    }

    #[test]
    fn test_password_length_boundary() {
        assert!(!validate_password("password", "abc").is_empty());
        assert!(validate_password("password", "abcd").is_empty());
    }

    #[test]
    fn test_reset_flow_field_name() {
        let errors = validate_password("newPassword", "x");
        assert_eq!(errors[0].field, "newPassword");
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// A username containing '@' never validates, regardless of the
        /// rest of the input.
        #[test]
        fn prop_at_sign_usernames_rejected(
            prefix in "[a-z]{1,8}",
            suffix in "[a-z]{0,8}",
        ) {
            let username = format!("{}@{}", prefix, suffix);
            let errors = validate_register(&username, "ok@example.com", "hunter2");
            prop_assert!(errors.iter().any(|e| e.field == "username"));
        }

        /// Passwords of four or more characters pass the length rule.
        #[test]
        fn prop_password_length_rule(password in ".{4,32}") {
            prop_assert!(validate_password("password", &password).is_empty());
        }
    }
}
