use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("failed to read credentials file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

/// Parse `username,password` lines. Lines that do not split into exactly two
/// fields are skipped.
pub fn parse_credentials(text: &str) -> Vec<Credential> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.trim_end_matches('\r').split(',');
            match (fields.next(), fields.next(), fields.next()) {
                (Some(username), Some(password), None) if !username.is_empty() => {
                    Some(Credential {
                        username: username.to_string(),
                        password: password.to_string(),
                    })
                }
                _ => None,
            }
        })
        .collect()
}

pub async fn load_credentials(path: &Path) -> Result<Vec<Credential>, CredentialsError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| CredentialsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(parse_credentials(&text))
}

/// A username is only usable when it maps onto exactly one directory below
/// the upload root.
pub fn is_valid_username(username: &str) -> bool {
    !username.is_empty()
        && username != "."
        && username != ".."
        && !username.contains(['/', '\\', '\0'])
}

/// Compare two passwords without exiting early on the first differing byte.
pub fn passwords_match(given: &str, stored: &str) -> bool {
    if given.len() != stored.len() {
        return false;
    }
    given
        .bytes()
        .zip(stored.bytes())
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

/// Look up `username` and compare its password in constant time.
pub fn verify(credentials: &[Credential], username: &str, password: &str) -> bool {
    if !is_valid_username(username) {
        return false;
    }
    credentials
        .iter()
        .filter(|credential| credential.username == username)
        .fold(false, |found, credential| {
            passwords_match(password, &credential.password) | found
        })
}
