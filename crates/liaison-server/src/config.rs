use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use uuid::Uuid;

pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub api_url: String,
    pub session_token: String,
    pub counsellor_id: Uuid,
    pub store_secret: Option<String>,
    /// Beneficiaries tracked from startup.
    pub portfolio: HashSet<Uuid>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |name: &str| -> Result<String> {
            match lookup(name) {
                Some(value) if !value.trim().is_empty() => Ok(value),
                _ => bail!("{} must be set", name),
            }
        };

        let port = lookup("LIAISON_PORT")
            .unwrap_or_else(|| "3100".into())
            .parse()
            .context("LIAISON_PORT is not a port number")?;
        let counsellor_id = required("LIAISON_COUNSELLOR_ID")?
            .parse()
            .context("LIAISON_COUNSELLOR_ID is not a UUID")?;
        let portfolio = lookup("LIAISON_PORTFOLIO")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| {
                id.parse()
                    .with_context(|| format!("LIAISON_PORTFOLIO entry '{}' is not a UUID", id))
            })
            .collect::<Result<_>>()?;

        Ok(Self {
            host: lookup("LIAISON_HOST").unwrap_or_else(|| "127.0.0.1".into()),
            port,
            db_path: lookup("LIAISON_DB_PATH")
                .unwrap_or_else(|| "liaison.db".into())
                .into(),
            api_url: required("LIAISON_API_URL")?,
            session_token: required("LIAISON_SESSION_TOKEN")?,
            counsellor_id,
            store_secret: lookup("LIAISON_STORE_SECRET").filter(|s| !s.is_empty()),
            portfolio,
        })
    }
}
