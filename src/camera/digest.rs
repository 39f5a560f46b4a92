//! HTTP digest authentication (RFC 7616, with the RFC 2069 no-qop form).
//!
//! Only `qop=auth` is answered; `auth-int` only challenges are rejected.

use md5::Md5;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
}

impl Algorithm {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "MD5" => Some(Self::Md5),
            "MD5-SESS" => Some(Self::Md5Sess),
            "SHA-256" => Some(Self::Sha256),
            "SHA-256-SESS" => Some(Self::Sha256Sess),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Md5Sess => "MD5-sess",
            Self::Sha256 => "SHA-256",
            Self::Sha256Sess => "SHA-256-sess",
        }
    }

    fn is_session(self) -> bool {
        matches!(self, Self::Md5Sess | Self::Sha256Sess)
    }

    fn hash_hex(self, data: &str) -> String {
        match self {
            Self::Md5 | Self::Md5Sess => hex::encode(Md5::digest(data.as_bytes())),
            Self::Sha256 | Self::Sha256Sess => hex::encode(Sha256::digest(data.as_bytes())),
        }
    }
}

/// A parsed `WWW-Authenticate: Digest ...` challenge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Algorithm,
    /// `true` when the server offered `qop=auth`.
    pub qop_auth: bool,
}

impl DigestChallenge {
    /// Parse one header value. Returns `None` for non-digest schemes and for
    /// digest challenges this client cannot answer.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, rest) = header.split_once(char::is_whitespace)?;
        if !scheme.eq_ignore_ascii_case("digest") {
            return None;
        }
        let params = parse_auth_params(rest);

        let algorithm = match params.get("algorithm") {
            Some(value) => Algorithm::parse(value)?,
            None => Algorithm::Md5,
        };
        let qop_auth = match params.get("qop") {
            Some(value) => {
                let offered = value
                    .split(',')
                    .map(str::trim)
                    .any(|qop| qop.eq_ignore_ascii_case("auth"));
                if !offered {
                    return None;
                }
                true
            }
            None => false,
        };

        Some(Self {
            realm: params.get("realm").cloned().unwrap_or_default(),
            nonce: params.get("nonce").cloned()?,
            opaque: params.get("opaque").cloned(),
            algorithm,
            qop_auth,
        })
    }

    /// Pick the strongest answerable challenge among several header values.
    pub fn select<'a, I>(headers: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut challenges: Vec<Self> = headers.into_iter().filter_map(Self::parse).collect();
        challenges.sort_by_key(|challenge| match challenge.algorithm {
            Algorithm::Sha256 | Algorithm::Sha256Sess => 0,
            Algorithm::Md5 | Algorithm::Md5Sess => 1,
        });
        challenges.into_iter().next()
    }

    /// `Authorization` header value with a random client nonce.
    pub fn authorization(&self, username: &str, password: &str, method: &str, uri: &str) -> String {
        let mut cnonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cnonce);
        self.authorization_with(username, password, method, uri, &hex::encode(cnonce), 1)
    }

    /// `Authorization` header value with an explicit client nonce and nonce count.
    pub fn authorization_with(
        &self,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
        cnonce: &str,
        nonce_count: u32,
    ) -> String {
        let alg = self.algorithm;
        let nc = format!("{:08x}", nonce_count);

        let mut ha1 = alg.hash_hex(&format!("{}:{}:{}", username, self.realm, password));
        if alg.is_session() {
            ha1 = alg.hash_hex(&format!("{}:{}:{}", ha1, self.nonce, cnonce));
        }
        let ha2 = alg.hash_hex(&format!("{}:{}", method, uri));
        let response = if self.qop_auth {
            alg.hash_hex(&format!("{}:{}:{}:{}:auth:{}", ha1, self.nonce, nc, cnonce, ha2))
        } else {
            alg.hash_hex(&format!("{}:{}:{}", ha1, self.nonce, ha2))
        };

        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", algorithm={}, response=\"{}\"",
            quote_escape(username),
            quote_escape(&self.realm),
            quote_escape(&self.nonce),
            quote_escape(uri),
            alg.as_str(),
            response
        );
        if self.qop_auth {
            header.push_str(&format!(", qop=auth, nc={}, cnonce=\"{}\"", nc, cnonce));
        }
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{}\"", quote_escape(opaque)));
        }
        header
    }
}

fn quote_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Split `key=value, key="quoted, value"` into a lowercase-keyed map.
fn parse_auth_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ',' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if key.is_empty() && chars.peek().is_none() {
            break;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'=') {
            chars.next();
            while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
                chars.next();
            }
            if chars.peek() == Some(&'"') {
                chars.next();
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        '"' => break,
                        c => value.push(c),
                    }
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if c == ',' {
                        break;
                    }
                    value.push(c);
                    chars.next();
                }
            }
        }
        let key = key.trim().to_ascii_lowercase();
        if !key.is_empty() {
            params.insert(key, value.trim().to_string());
        }
        if chars.peek().is_none() {
            break;
        }
    }
    params
}
