//! Test support for vouch pools.
//!
//! [`ScriptedVerifier`] reads its instructions from the assertion text, so a
//! test can decide each job's fate without a real identity provider:
//!
//! | assertion            | outcome                                        |
//! |----------------------|------------------------------------------------|
//! | `ok:<email>`         | identity for `<email>`                         |
//! | `fail:<reason>`      | `InvalidSignature(<reason>)`                   |
//! | `sleep:<ms>:<rest>`  | sleep, then handle `<rest>`                    |
//! | `exit:<code>`        | exit the process (worker processes only!)      |
//!
//! Anything else is `Malformed`.

use std::time::Duration;

use vouch::{Identity, Outcome, VerificationError, Verifier, VerifyRequest};

pub const DEFAULT_ISSUER: &str = "login.example.com";

#[derive(Debug, Clone)]
pub struct ScriptedVerifier {
    issuer: String,
    audience: Option<String>,
}

impl Default for ScriptedVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedVerifier {
    pub fn new() -> Self {
        Self {
            issuer: DEFAULT_ISSUER.to_string(),
            audience: None,
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    /// Reject requests naming any other audience.
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    fn run(&self, script: &str, request: &VerifyRequest) -> Outcome {
        let (command, arg) = script.split_once(':').unwrap_or((script, ""));
        match command {
            "ok" => self.identity(arg, request),
            "fail" => Err(VerificationError::InvalidSignature(arg.to_string())),
            "sleep" => {
                let (ms, rest) = arg.split_once(':').unwrap_or((arg, "ok:"));
                let ms = ms
                    .parse::<u64>()
                    .map_err(|e| VerificationError::Malformed(format!("sleep: {e}")))?;
                std::thread::sleep(Duration::from_millis(ms));
                self.run(rest, request)
            }
            "exit" => {
                let code = arg.parse::<i32>().unwrap_or(1);
                tracing::warn!(code, "Scripted exit");
                std::process::exit(code);
            }
            _ => Err(VerificationError::Malformed(format!(
                "unrecognized assertion: {script}"
            ))),
        }
    }

    fn identity(&self, email: &str, request: &VerifyRequest) -> Outcome {
        if email.is_empty() || !email.contains('@') {
            return Err(VerificationError::Malformed(format!("not an email: {email:?}")));
        }
        let audience = request.audience.clone().unwrap_or_default();
        if let Some(expected) = &self.audience
            && &audience != expected
        {
            return Err(VerificationError::AudienceMismatch(audience));
        }
        Ok(Identity {
            email: email.to_string(),
            audience,
            issuer: self.issuer.clone(),
            expires: None,
        })
    }
}

impl Verifier for ScriptedVerifier {
    fn verify(&self, request: &VerifyRequest) -> Outcome {
        self.run(&request.assertion, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verify(assertion: &str) -> Outcome {
        ScriptedVerifier::new().verify(&VerifyRequest::new(assertion).with_audience("https://rp"))
    }

    #[test]
    fn ok_yields_identity() {
        let identity = verify("ok:alice@example.com").unwrap();
        assert_eq!(identity.email, "alice@example.com");
        assert_eq!(identity.audience, "https://rp");
        assert_eq!(identity.issuer, DEFAULT_ISSUER);
    }

    #[test]
    fn fail_yields_invalid_signature() {
        assert_eq!(
            verify("fail:bad sig"),
            Err(VerificationError::InvalidSignature("bad sig".to_string()))
        );
    }

    #[test]
    fn sleep_then_continue() {
        let started = std::time::Instant::now();
        let identity = verify("sleep:20:ok:bob@example.com").unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(identity.email, "bob@example.com");
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(verify("hello"), Err(VerificationError::Malformed(_))));
        assert!(matches!(verify("ok:nobody"), Err(VerificationError::Malformed(_))));
        assert!(matches!(verify("sleep:soon:ok:a@b"), Err(VerificationError::Malformed(_))));
    }

    #[test]
    fn audience_is_checked() {
        let verifier = ScriptedVerifier::new().with_audience("https://rp");
        let err = verifier
            .verify(&VerifyRequest::new("ok:a@example.com").with_audience("https://evil"))
            .unwrap_err();
        assert_eq!(err, VerificationError::AudienceMismatch("https://evil".into()));
    }
}
