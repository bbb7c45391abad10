//! SCRAM-SHA-256 client exchange (RFC 5802 / RFC 7677) used by the V1_0 handshake.

use crate::{Error, ErrorContext, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

fn auth_error(message: impl Into<String>) -> Error {
    Error::connection_with_context(
        message,
        ErrorContext::new()
            .with_source("rethinkdb")
            .with_details("SCRAM-SHA-256"),
    )
}

fn hmac(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| auth_error(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

// RFC 5802 saslname escaping.
fn escape_username(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}

fn attribute<'a>(message: &'a str, name: char) -> Option<&'a str> {
    message.split(',').find_map(|part| {
        let mut chars = part.chars();
        match (chars.next(), chars.next()) {
            (Some(c), Some('=')) if c == name => Some(&part[2..]),
            _ => None,
        }
    })
}

pub struct ScramClient {
    password: String,
    nonce: String,
    first_bare: String,
}

impl ScramClient {
    pub fn new(username: &str, password: &str) -> Self {
        let mut raw = [0u8; 18];
        rand::thread_rng().fill(&mut raw);
        Self::with_nonce(username, password, &STANDARD.encode(raw))
    }

    pub fn with_nonce(username: &str, password: &str, nonce: &str) -> Self {
        Self {
            password: password.to_string(),
            nonce: nonce.to_string(),
            first_bare: format!("n={},r={}", escape_username(username), nonce),
        }
    }

    /// `client-first-message` with the `n,,` GS2 header (no channel binding).
    pub fn client_first(&self) -> String {
        format!("n,,{}", self.first_bare)
    }

    /// Compute `client-final-message` from the server's challenge.
    pub fn client_final(&self, server_first: &str) -> Result<(String, ServerSignature)> {
        let nonce = attribute(server_first, 'r')
            .ok_or_else(|| auth_error("server challenge has no nonce"))?;
        if !nonce.starts_with(&self.nonce) || nonce.len() == self.nonce.len() {
            return Err(auth_error("server nonce does not extend client nonce"));
        }
        let salt = attribute(server_first, 's')
            .ok_or_else(|| auth_error("server challenge has no salt"))
            .and_then(|s| {
                STANDARD
                    .decode(s)
                    .map_err(|e| auth_error(format!("invalid salt: {}", e)))
            })?;
        let iterations: u32 = attribute(server_first, 'i')
            .and_then(|i| i.parse().ok())
            .filter(|i| *i > 0)
            .ok_or_else(|| auth_error("server challenge has no valid iteration count"))?;

        let mut salted = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(self.password.as_bytes(), &salt, iterations, &mut salted);

        let client_key = hmac(&salted, b"Client Key")?;
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();
        let without_proof = format!("c=biws,r={}", nonce);
        let auth_message = format!("{},{},{}", self.first_bare, server_first, without_proof);

        let client_signature = hmac(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let server_key = hmac(&salted, b"Server Key")?;
        let expected = hmac(&server_key, auth_message.as_bytes())?;

        Ok((
            format!("{},p={}", without_proof, STANDARD.encode(proof)),
            ServerSignature(expected),
        ))
    }
}

/// Signature the server must present in its final message.
pub struct ServerSignature([u8; 32]);

impl ServerSignature {
    pub fn verify(&self, server_final: &str) -> Result<()> {
        if let Some(err) = attribute(server_final, 'e') {
            return Err(auth_error(format!("server rejected authentication: {}", err)));
        }
        let presented = attribute(server_final, 'v')
            .and_then(|v| STANDARD.decode(v).ok())
            .ok_or_else(|| auth_error("server final message has no signature"))?;
        if presented.as_slice() != self.0.as_slice() {
            return Err(auth_error("server signature mismatch"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER_FIRST: &str = "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";

    #[test]
    fn test_rfc7677_vector() {
        let client = ScramClient::with_nonce("user", "pencil", "rOprNGfwEbeRWgbNEkqO");
        assert_eq!(client.client_first(), "n,,n=user,r=rOprNGfwEbeRWgbNEkqO");

        let (final_message, signature) = client.client_final(SERVER_FIRST).unwrap();
        assert_eq!(
            final_message,
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );
        signature
            .verify("v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=")
            .unwrap();
        assert!(signature.verify("v=AAAA").is_err());
        assert!(signature.verify("e=invalid-proof").is_err());
    }

    #[test]
    fn test_rejects_foreign_nonce() {
        let client = ScramClient::with_nonce("user", "pencil", "abc");
        let err = client
            .client_final("r=xyz123,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096")
            .err()
            .unwrap();
        assert!(err.is_connection());
    }

    #[test]
    fn test_username_is_escaped() {
        let client = ScramClient::with_nonce("a=b,c", "", "n");
        assert_eq!(client.client_first(), "n,,n=a=3Db=2Cc,r=n");
    }

    #[test]
    fn test_random_nonces_differ() {
        let a = ScramClient::new("u", "p");
        let b = ScramClient::new("u", "p");
        assert_ne!(a.client_first(), b.client_first());
    }
}
