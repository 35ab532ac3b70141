// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP authentication: building `Authorization` headers on the client and
//! issuing/validating challenges on the server. Both Basic and Digest (MD5,
//! no qop, as RTSP servers conventionally use) are supported.

use rand::RngCore;

use crate::{Error, Result};

/// A username/password pair.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Don't leak the password into logs.
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish()
    }
}

/// Client side: answers a server challenge. Digest is preferred when the
/// server offers both.
pub(crate) struct Sender {
    creds: Credentials,
    mode: Mode,
}

enum Mode {
    Basic,
    Digest(digest_auth::WwwAuthenticateHeader),
}

impl Sender {
    pub(crate) fn new(www_authenticate: &str, creds: &Credentials) -> Result<Sender> {
        if let Some(digest_start) = www_authenticate.find("Digest ") {
            let prompt = digest_auth::parse(&www_authenticate[digest_start..])
                .map_err(|e| Error::AuthChallenge(e.to_string()))?;
            return Ok(Sender {
                creds: creds.clone(),
                mode: Mode::Digest(prompt),
            });
        }
        if www_authenticate.trim_start().starts_with("Basic") {
            return Ok(Sender {
                creds: creds.clone(),
                mode: Mode::Basic,
            });
        }
        Err(Error::AuthChallenge(format!(
            "unsupported challenge {:?}",
            www_authenticate
        )))
    }

    /// The `Authorization` value for one request.
    pub(crate) fn authorization(&self, method: &'static str, uri: &str) -> Result<String> {
        match &self.mode {
            Mode::Basic => Ok(format!(
                "Basic {}",
                base64::encode(format!("{}:{}", self.creds.username, self.creds.password))
            )),
            Mode::Digest(prompt) => {
                let mut prompt = prompt.clone();
                let ctx = digest_auth::AuthContext::new_with_method(
                    &self.creds.username,
                    &self.creds.password,
                    uri,
                    Option::<&[u8]>::None,
                    digest_auth::HttpMethod::from(method),
                );
                let answer = prompt
                    .respond(&ctx)
                    .map_err(|e| Error::AuthChallenge(e.to_string()))?;
                Ok(answer.to_string())
            }
        }
    }
}

/// Server side: issues challenges and validates what comes back.
pub struct Validator {
    creds: Credentials,
    realm: String,
    nonce: String,
    basic: bool,
    digest: bool,
}

impl Validator {
    /// A validator offering both Basic and Digest.
    pub fn new(username: &str, password: &str) -> Validator {
        Self::with_methods(username, password, true, true)
    }

    pub fn with_methods(username: &str, password: &str, basic: bool, digest: bool) -> Validator {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        Validator {
            creds: Credentials {
                username: username.to_owned(),
                password: password.to_owned(),
            },
            realm: "fovea".to_owned(),
            nonce: hex::encode(nonce),
            basic,
            digest,
        }
    }

    /// The `WWW-Authenticate` challenge values for a 401 response.
    pub fn challenges(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(2);
        if self.digest {
            out.push(format!(
                "Digest realm=\"{}\", nonce=\"{}\"",
                self.realm, self.nonce
            ));
        }
        if self.basic {
            out.push(format!("Basic realm=\"{}\"", self.realm));
        }
        out
    }

    /// Validates a request's `Authorization` value, if any, against the
    /// stored credentials, the request method, and the request URI.
    pub fn validate(
        &self,
        authorization: Option<&str>,
        method: &'static str,
        uri: &str,
    ) -> Result<()> {
        let authorization = authorization.ok_or(Error::InvalidCredentials)?;
        let authorization = authorization.trim();
        if let Some(b64) = authorization.strip_prefix("Basic ") {
            if !self.basic {
                return Err(Error::InvalidCredentials);
            }
            let expected = base64::encode(format!(
                "{}:{}",
                self.creds.username, self.creds.password
            ));
            if b64.trim() == expected {
                return Ok(());
            }
            return Err(Error::InvalidCredentials);
        }
        if let Some(params) = authorization.strip_prefix("Digest ") {
            if !self.digest {
                return Err(Error::InvalidCredentials);
            }
            let params = parse_digest_params(params);
            let find = |k: &str| params.iter().find(|(pk, _)| pk == k).map(|(_, v)| v.as_str());
            let username = find("username").ok_or(Error::InvalidCredentials)?;
            let nonce = find("nonce").ok_or(Error::InvalidCredentials)?;
            let declared_uri = find("uri").ok_or(Error::InvalidCredentials)?;
            let response = find("response").ok_or(Error::InvalidCredentials)?;
            if username != self.creds.username || nonce != self.nonce {
                return Err(Error::InvalidCredentials);
            }
            if !uri_matches(declared_uri, uri) {
                return Err(Error::InvalidCredentials);
            }
            // Recompute the digest with the known-good password and compare.
            let mut prompt = digest_auth::parse(&format!(
                "Digest realm=\"{}\", nonce=\"{}\"",
                self.realm, self.nonce
            ))
            .map_err(|e| Error::AuthChallenge(e.to_string()))?;
            let ctx = digest_auth::AuthContext::new_with_method(
                &self.creds.username,
                &self.creds.password,
                declared_uri,
                Option::<&[u8]>::None,
                digest_auth::HttpMethod::from(method),
            );
            let expected = prompt
                .respond(&ctx)
                .map_err(|e| Error::AuthChallenge(e.to_string()))?;
            if expected.response.eq_ignore_ascii_case(response) {
                return Ok(());
            }
            return Err(Error::InvalidCredentials);
        }
        Err(Error::InvalidCredentials)
    }
}

/// Accept the exact request URI, or the same URI with a trailing slash
/// difference: VLC SETUPs `<base>/trackID=n` while authorizing `<base>/`.
fn uri_matches(declared: &str, requested: &str) -> bool {
    if declared == requested {
        return true;
    }
    requested
        .strip_prefix(declared.trim_end_matches('/'))
        .map_or(false, |rest| rest.starts_with('/'))
}

fn parse_digest_params(s: &str) -> Vec<(String, String)> {
    // key="value" pairs; values may contain commas only inside quotes,
    // which RTSP clients don't produce in practice.
    s.split(',')
        .filter_map(|kv| {
            let i = kv.find('=')?;
            let k = kv[..i].trim().to_ascii_lowercase();
            let v = kv[i + 1..].trim().trim_matches('"').to_owned();
            Some((k, v))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(user: &str, pass: &str) -> Credentials {
        Credentials {
            username: user.to_owned(),
            password: pass.to_owned(),
        }
    }

    fn roundtrip(
        validator: &Validator,
        challenge_idx: usize,
        c: &Credentials,
        sign_uri: &str,
        validate_uri: &str,
    ) -> Result<()> {
        let challenge = &validator.challenges()[challenge_idx];
        let sender = Sender::new(challenge, c)?;
        let authorization = sender.authorization("ANNOUNCE", sign_uri)?;
        validator.validate(Some(&authorization), "ANNOUNCE", validate_uri)
    }

    #[test]
    fn digest_and_basic_accept_good_credentials() {
        let va = Validator::new("testuser", "testpass");
        let c = creds("testuser", "testpass");
        let url = "rtsp://myhost/mypath";
        // Challenge 0 is digest, 1 is basic.
        roundtrip(&va, 0, &c, url, url).unwrap();
        roundtrip(&va, 1, &c, url, url).unwrap();
    }

    #[test]
    fn wrong_user_or_pass_rejected() {
        let va = Validator::new("testuser", "testpass");
        let url = "rtsp://myhost/mypath";
        for c in &[creds("test1user", "testpass"), creds("testuser", "test1pass")] {
            for idx in 0..2 {
                assert!(matches!(
                    roundtrip(&va, idx, c, url, url),
                    Err(Error::InvalidCredentials)
                ));
            }
        }
    }

    #[test]
    fn wrong_url_rejected_for_digest() {
        let va = Validator::new("testuser", "testpass");
        let c = creds("testuser", "testpass");
        assert!(matches!(
            roundtrip(&va, 0, &c, "rtsp://myhost/my1path", "rtsp://myhost/mypath"),
            Err(Error::InvalidCredentials)
        ));
    }

    #[test]
    fn base_url_authorizes_track_setup() {
        let va = Validator::new("testuser", "testpass");
        let c = creds("testuser", "testpass");
        roundtrip(
            &va,
            0,
            &c,
            "rtsp://myhost/mypath/",
            "rtsp://myhost/mypath/trackID=0",
        )
        .unwrap();
    }

    #[test]
    fn missing_or_garbage_authorization_rejected() {
        let va = Validator::new("u", "p");
        assert!(va.validate(None, "DESCRIBE", "rtsp://h/p").is_err());
        assert!(va
            .validate(Some("Bearer zzz"), "DESCRIBE", "rtsp://h/p")
            .is_err());
    }

    #[test]
    fn digest_preferred_over_basic() {
        let c = creds("u", "p");
        let s = Sender::new("Basic realm=\"r\", Digest realm=\"r\", nonce=\"n\"", &c).unwrap();
        let auth = s.authorization("DESCRIBE", "rtsp://h/p").unwrap();
        assert!(auth.starts_with("Digest "));
    }
}
