use std::collections::HashMap;
use std::path::Path;

use actix_web::http::header::Header;
use actix_web::HttpRequest;
use actix_web_httpauth::headers::authorization::{Authorization, Bearer};
use anyhow::Context;
use ota_schema::content_hash;
use subtle::ConstantTimeEq;

pub fn extract_token(request: &HttpRequest) -> Option<String> {
    if let Ok(auth) = Authorization::<Bearer>::parse(request) {
        Some(auth.into_scheme().token().to_string())
    } else {
        None
    }
}

pub fn hash_token(token: &str) -> String {
    content_hash(token.as_bytes())
}

/// Device credentials. Only the SHA-256 of each token is held.
#[derive(Debug, Default, Clone)]
pub struct DeviceAuthenticator {
    tokens: HashMap<String, String>,
}

impl DeviceAuthenticator {
    /// Reads a JSON object mapping device id to hex token hash.
    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let data = std::fs::read(path)
            .with_context(|| format!("reading device tokens from {:?}", path))?;
        let tokens: HashMap<String, String> =
            serde_json::from_slice(&data).context("parsing device token table")?;
        log::info!("Loaded credentials for {} devices", tokens.len());
        Ok(Self::from_hashes(tokens))
    }

    pub fn from_hashes(tokens: HashMap<String, String>) -> Self {
        let tokens = tokens
            .into_iter()
            .map(|(device, hash)| (device, hash.to_ascii_lowercase()))
            .collect();
        Self { tokens }
    }

    /// Builds the table from plain tokens.
    pub fn from_tokens<'a>(tokens: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            tokens: tokens
                .into_iter()
                .map(|(device, token)| (device.to_string(), hash_token(token)))
                .collect(),
        }
    }

    pub fn verify(&self, device_id: &str, token: &str) -> bool {
        match self.tokens.get(device_id) {
            Some(expected) => expected.as_bytes().ct_eq(hash_token(token).as_bytes()).into(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

pub fn verify_admin(admin_key: &str, token: &str) -> bool {
    hash_token(admin_key)
        .as_bytes()
        .ct_eq(hash_token(token).as_bytes())
        .into()
}
