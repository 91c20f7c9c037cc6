//! `config.json` and `token.json` under the config directory.
//!
//! Both files are created interactively on first start: the OAuth2 client
//! registration is prompted for, then the consent URL is printed and the
//! authorization code read back.

use std::io::{BufRead, Write};
use std::path::Path;

use common::drive::auth::{self, ClientCredentials, Token};

use crate::service_config::ConfigError;

/// Load the client registration, prompting for it and writing it out if absent.
pub fn load_or_prompt_credentials<R, W>(
    path: &Path,
    input: &mut R,
    output: &mut W,
) -> Result<ClientCredentials, ConfigError>
where
    R: BufRead,
    W: Write,
{
    if path.exists() {
        return read_credentials(path);
    }

    tracing::info!(path = %path.display(), "no client credentials found, prompting");
    let client_id = prompt(input, output, "Client ID: ")?;
    if client_id.is_empty() {
        return Err(ConfigError::Empty("client id"));
    }
    let client_secret = prompt(input, output, "Client secret: ")?;
    if client_secret.is_empty() {
        return Err(ConfigError::Empty("client secret"));
    }

    let credentials = ClientCredentials {
        client_id,
        client_secret,
    };
    write_credentials(path, &credentials)?;
    Ok(credentials)
}

pub fn read_credentials(path: &Path) -> Result<ClientCredentials, ConfigError> {
    let raw = std::fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&raw).map_err(|source| ConfigError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

fn write_credentials(path: &Path, credentials: &ClientCredentials) -> Result<(), ConfigError> {
    let raw = serde_json::to_vec_pretty(credentials).map_err(|source| ConfigError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, raw).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Load the stored token, running the authorization-code flow if there is none.
pub async fn load_or_authorize_token<R, W>(
    path: &Path,
    http: &reqwest::Client,
    credentials: &ClientCredentials,
    input: &mut R,
    output: &mut W,
) -> Result<Token, ConfigError>
where
    R: BufRead,
    W: Write,
{
    if path.exists() {
        return auth::load_token(path).await.map_err(ConfigError::Authorization);
    }

    let code = prompt_authorization_code(credentials, input, output)?;
    let token = auth::exchange_code(http, credentials, &code)
        .await
        .map_err(ConfigError::Authorization)?;
    auth::save_token(path, &token)
        .await
        .map_err(ConfigError::Authorization)?;
    tracing::info!(path = %path.display(), "stored new token");
    Ok(token)
}

/// Print the consent URL and read the code the user pastes back.
pub fn prompt_authorization_code<R, W>(
    credentials: &ClientCredentials,
    input: &mut R,
    output: &mut W,
) -> Result<String, ConfigError>
where
    R: BufRead,
    W: Write,
{
    let url = auth::authorization_url(credentials).map_err(ConfigError::Authorization)?;
    writeln!(output, "Open the following URL in a browser and authorize access:")
        .and_then(|_| writeln!(output, "{}", url))
        .map_err(stdout_error)?;
    let code = prompt(input, output, "Authorization code: ")?;
    if code.is_empty() {
        return Err(ConfigError::Empty("authorization code"));
    }
    Ok(code)
}

fn prompt<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    label: &str,
) -> Result<String, ConfigError> {
    write!(output, "{}", label)
        .and_then(|_| output.flush())
        .map_err(stdout_error)?;

    let mut line = String::new();
    input
        .read_line(&mut line)
        .map_err(|source| ConfigError::Read {
            path: "<stdin>".into(),
            source,
        })?;
    Ok(line.trim().to_string())
}

fn stdout_error(source: std::io::Error) -> ConfigError {
    ConfigError::Write {
        path: "<stdout>".into(),
        source,
    }
}
