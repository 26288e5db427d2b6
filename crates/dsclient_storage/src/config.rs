//! Client configuration.

use crate::cloud::RemoteService;
use dsclient_codec::{DsError, DsResult};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Environment variable consulted last when resolving the project id.
pub const PROJECT_ID_ENV: &str = "DATASTORE_PROJECT_ID";

/// OAuth scope granting datastore access.
pub const DATASTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";

/// Supplies bearer tokens for remote calls.
pub trait TokenSource: Send + Sync + fmt::Debug {
    /// Returns a currently valid token.
    ///
    /// # Errors
    ///
    /// Returns an error if no token can be obtained.
    fn token(&self) -> DsResult<String>;
}

/// A token source returning one fixed token.
#[derive(Debug, Clone)]
pub struct StaticTokenSource(String);

impl StaticTokenSource {
    /// Creates a token source for `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenSource for StaticTokenSource {
    fn token(&self) -> DsResult<String> {
        Ok(self.0.clone())
    }
}

/// The backend metadata service, asked for the project id.
pub trait MetadataSource: Send + Sync + fmt::Debug {
    /// The project the process runs in, if known.
    fn project_id(&self) -> Option<String>;
}

/// A metadata source with fixed answers.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    project_id: Option<String>,
}

impl StaticMetadata {
    /// Creates a metadata source reporting `project_id`.
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: Some(project_id.into()),
        }
    }
}

impl MetadataSource for StaticMetadata {
    fn project_id(&self) -> Option<String> {
        self.project_id.clone()
    }
}

#[derive(Deserialize)]
struct CredentialsFile {
    #[serde(default)]
    project_id: Option<String>,
}

/// Options for constructing a client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Explicit project id.
    pub project_id: Option<String>,

    /// OAuth scopes requested for remote calls.
    pub scopes: Vec<String>,

    /// Source of bearer tokens for remote calls.
    pub token_source: Option<Arc<dyn TokenSource>>,

    /// Path of a JSON credentials file, consulted for the project id.
    pub credentials_file: Option<PathBuf>,

    /// Transport used by the cloud adapter.
    pub transport: Option<Arc<dyn RemoteService>>,

    /// Metadata service consulted for the project id.
    pub metadata: Option<Arc<dyn MetadataSource>>,

    /// How many times `run_in_transaction` attempts a conflicting commit.
    pub transaction_attempts: u32,

    /// Rows fetched per query round trip by the cloud adapter.
    pub query_batch_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            project_id: None,
            scopes: vec![DATASTORE_SCOPE.to_string()],
            token_source: None,
            credentials_file: None,
            transport: None,
            metadata: None,
            transaction_attempts: 3,
            query_batch_size: 300,
        }
    }
}

impl ClientOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the project id.
    #[must_use]
    pub fn project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Replaces the requested scopes.
    #[must_use]
    pub fn scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the token source.
    #[must_use]
    pub fn token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
        self.token_source = Some(source);
        self
    }

    /// Sets the credentials file.
    #[must_use]
    pub fn credentials_file(mut self, path: impl AsRef<Path>) -> Self {
        self.credentials_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Sets the cloud transport.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn RemoteService>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the metadata source.
    #[must_use]
    pub fn metadata(mut self, metadata: Arc<dyn MetadataSource>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Sets the commit attempts of `run_in_transaction`.
    #[must_use]
    pub const fn transaction_attempts(mut self, attempts: u32) -> Self {
        self.transaction_attempts = attempts;
        self
    }

    /// Sets the query page size of the cloud adapter.
    #[must_use]
    pub const fn query_batch_size(mut self, size: usize) -> Self {
        self.query_batch_size = size;
        self
    }

    /// Resolves the project id.
    ///
    /// Sources in order: the explicit option, the credentials file, the
    /// metadata service, then [`PROJECT_ID_ENV`].
    ///
    /// # Errors
    ///
    /// Returns [`DsError::Config`] if the credentials file cannot be read.
    pub fn resolve_project_id(&self) -> DsResult<Option<String>> {
        if let Some(id) = self.project_id.as_ref().filter(|id| !id.is_empty()) {
            return Ok(Some(id.clone()));
        }
        if let Some(path) = &self.credentials_file {
            if let Some(id) = read_credentials_project(path)? {
                return Ok(Some(id));
            }
        }
        if let Some(id) = self
            .metadata
            .as_ref()
            .and_then(|m| m.project_id())
            .filter(|id| !id.is_empty())
        {
            return Ok(Some(id));
        }
        Ok(std::env::var(PROJECT_ID_ENV).ok().filter(|id| !id.is_empty()))
    }
}

fn read_credentials_project(path: &Path) -> DsResult<Option<String>> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        DsError::config(format!("reading credentials file {}: {err}", path.display()))
    })?;
    let credentials: CredentialsFile = serde_json::from_str(&raw).map_err(|err| {
        DsError::config(format!("parsing credentials file {}: {err}", path.display()))
    })?;
    Ok(credentials.project_id.filter(|id| !id.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_credentials(body: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("dsclient-creds-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn default_options() {
        let options = ClientOptions::default();
        assert_eq!(options.project_id, None);
        assert_eq!(options.scopes, vec![DATASTORE_SCOPE.to_string()]);
        assert_eq!(options.transaction_attempts, 3);
        assert_eq!(options.query_batch_size, 300);
    }

    #[test]
    fn builder_pattern() {
        let options = ClientOptions::new()
            .project_id("demo")
            .scopes(["a", "b"])
            .transaction_attempts(5)
            .query_batch_size(10);

        assert_eq!(options.project_id.as_deref(), Some("demo"));
        assert_eq!(options.scopes, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(options.transaction_attempts, 5);
        assert_eq!(options.query_batch_size, 10);
    }

    #[test]
    fn explicit_project_wins() {
        let options = ClientOptions::new()
            .project_id("explicit")
            .metadata(Arc::new(StaticMetadata::new("meta")));
        assert_eq!(options.resolve_project_id().unwrap().as_deref(), Some("explicit"));
    }

    #[test]
    fn credentials_file_precedes_metadata() {
        let path = temp_credentials(r#"{"type":"service_account","project_id":"from-file"}"#);
        let options = ClientOptions::new()
            .credentials_file(&path)
            .metadata(Arc::new(StaticMetadata::new("meta")));
        assert_eq!(options.resolve_project_id().unwrap().as_deref(), Some("from-file"));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn metadata_fills_in_without_file_project() {
        let path = temp_credentials(r#"{"type":"authorized_user"}"#);
        let options = ClientOptions::new()
            .credentials_file(&path)
            .metadata(Arc::new(StaticMetadata::new("meta")));
        assert_eq!(options.resolve_project_id().unwrap().as_deref(), Some("meta"));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn unreadable_credentials_are_config_errors() {
        let options = ClientOptions::new().credentials_file("/nonexistent/dsclient/creds.json");
        assert!(matches!(
            options.resolve_project_id(),
            Err(DsError::Config { .. })
        ));
    }

    #[test]
    fn static_token_source() {
        let source = StaticTokenSource::new("secret");
        assert_eq!(source.token().unwrap(), "secret");
    }
}
