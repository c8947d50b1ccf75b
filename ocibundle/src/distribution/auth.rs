//! Registry credentials and 401-challenge solving.
//!
//! Credentials come from wherever the operator already logged in:
//! docker's `~/.docker/config.json`, podman's `auth.json`, and the
//! `REGISTRY_USERNAME`/`REGISTRY_PASSWORD` environment pair, later
//! sources winning. A [Keychain] turns a `WWW-Authenticate` header
//! into a ready-to-send `Authorization` value in one step, whether
//! the registry wants Basic or a Bearer token exchange.

use crate::{
    error::{Error, Result},
    Name,
};
use base64::engine::{general_purpose::STANDARD, Engine};
use serde::Deserialize;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};
use url::Url;

const USERNAME_ENV: &str = "REGISTRY_USERNAME";
const PASSWORD_ENV: &str = "REGISTRY_PASSWORD";

/// The registry hostname docker writes Docker Hub credentials under.
const DOCKER_HUB_AUTH_KEY: &str = "https://index.docker.io/v1/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    /// `username:password` as the base64 octet Basic auth wants.
    fn octet(&self) -> String {
        STANDARD.encode(format!("{}:{}", self.username, self.password))
    }
}

/// Credentials per registry host, resolved once at client startup.
#[derive(Debug, Clone, Default)]
pub struct Keychain {
    credentials: HashMap<String, Credential>,
    /// `REGISTRY_USERNAME`/`REGISTRY_PASSWORD`, overriding every file.
    env_credential: Option<Credential>,
}

impl Keychain {
    /// Gather credentials from docker, podman, and the environment.
    ///
    /// Unreadable or malformed files are skipped: a broken docker
    /// config must not stop anonymous pulls.
    pub fn load() -> Self {
        let mut keychain = Keychain::default();
        for path in [docker_config_path(), podman_auth_path()].into_iter().flatten() {
            match read_config_file(&path) {
                Ok(entries) => keychain.credentials.extend(entries),
                Err(err) => {
                    log::debug!("Ignoring credential file {}: {}", path.display(), err)
                }
            }
        }
        if let (Ok(username), Ok(password)) = (env::var(USERNAME_ENV), env::var(PASSWORD_ENV))
        {
            keychain.env_credential = Some(Credential { username, password });
        }
        keychain
    }

    /// Register an explicit credential for a registry host.
    pub fn insert(&mut self, host: &str, username: &str, password: &str) {
        self.credentials.insert(
            host.to_string(),
            Credential {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
    }

    /// The credential to present to a registry host, if any.
    ///
    /// The environment pair overrides files; Docker Hub hides its
    /// credentials under a legacy URL key.
    pub fn credential_for(&self, host: &str) -> Option<&Credential> {
        if let Some(credential) = &self.env_credential {
            return Some(credential);
        }
        self.credentials.get(host).or_else(|| {
            (host == "index.docker.io" || host == "registry-1.docker.io")
                .then(|| self.credentials.get(DOCKER_HUB_AUTH_KEY))
                .flatten()
        })
    }

    /// Answer a 401 challenge for `repo` on `registry` with a full
    /// `Authorization` header value.
    ///
    /// `Basic` challenges are answered from the keychain directly.
    /// `Bearer` challenges go through the token endpoint named by the
    /// realm; when the registry's challenge does not carry a scope,
    /// pull+push on the repository is requested.
    pub fn solve(&self, www_authenticate: &str, registry: &Url, repo: &Name) -> Result<String> {
        let host = registry.host_str().unwrap_or_default();
        let (scheme, params) = www_authenticate
            .split_once(' ')
            .unwrap_or((www_authenticate, ""));
        match scheme {
            "Basic" => {
                let credential = self
                    .credential_for(host)
                    .ok_or_else(|| Error::AuthRequired(registry.to_string()))?;
                Ok(format!("Basic {}", credential.octet()))
            }
            "Bearer" => {
                let challenge = BearerChallenge::parse(params, www_authenticate)?;
                let token = self.exchange_token(&challenge, host, repo)?;
                Ok(format!("Bearer {}", token))
            }
            _ => Err(Error::UnsupportedAuthHeader(www_authenticate.to_string())),
        }
    }

    /// Trade a credential (or anonymity) for a bearer token at the
    /// challenge's realm.
    fn exchange_token(
        &self,
        challenge: &BearerChallenge,
        host: &str,
        repo: &Name,
    ) -> Result<String> {
        let realm = Url::parse(&challenge.realm)?;
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull,push", repo));

        let mut req = ureq::get(realm.as_str())
            .set("Accept", "application/json")
            .query("scope", &scope);
        if let Some(service) = &challenge.service {
            req = req.query("service", service);
        }
        if let Some(credential) = self.credential_for(host) {
            req = req.set("Authorization", &format!("Basic {}", credential.octet()));
        }

        let res = req.call().map_err(Error::from)?;
        let token: TokenResponse = res.into_json()?;
        // Registries answer with `token`, some older ones with
        // `access_token`; either works.
        token
            .token
            .or(token.access_token)
            .ok_or_else(|| Error::AuthRequired(challenge.realm.clone()))
    }
}

/// Parsed `Bearer realm="...",service="...",scope="..."` challenge.
///
/// Only the realm is mandatory; registries routinely omit the scope
/// on probe requests.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

impl BearerChallenge {
    fn parse(params: &str, header: &str) -> Result<Self> {
        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for param in params.split(',') {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            let value = value.trim_matches('"');
            match key.trim() {
                "realm" => realm = Some(value.to_string()),
                "service" => service = Some(value.to_string()),
                "scope" => scope = Some(value.to_string()),
                _ => {}
            }
        }
        Ok(BearerChallenge {
            realm: realm.ok_or_else(|| Error::UnsupportedAuthHeader(header.to_string()))?,
            service,
            scope,
        })
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// `auths` section of a docker/podman config file. Entries either
/// carry the base64 `auth` octet or split username/password fields.
#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    auths: HashMap<String, ConfigAuth>,
}

#[derive(Deserialize)]
struct ConfigAuth {
    auth: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

impl ConfigAuth {
    fn into_credential(self) -> Option<Credential> {
        if let (Some(username), Some(password)) = (self.username, self.password) {
            return Some(Credential { username, password });
        }
        let decoded = STANDARD.decode(self.auth?).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Some(Credential {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

fn read_config_file(path: &Path) -> Result<HashMap<String, Credential>> {
    if !path.is_file() {
        return Ok(HashMap::new());
    }
    let config: ConfigFile = serde_json::from_slice(&fs::read(path)?)?;
    Ok(config
        .auths
        .into_iter()
        .filter_map(|(host, auth)| Some((host, auth.into_credential()?)))
        .collect())
}

fn docker_config_path() -> Option<PathBuf> {
    let dirs = directories::BaseDirs::new()?;
    Some(dirs.home_dir().join(".docker/config.json"))
}

fn podman_auth_path() -> Option<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "containers")?;
    Some(dirs.runtime_dir()?.join("auth.json"))
}
