use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::cache::{Artifact, ContentHash, ResultCache, StoreOutcome};
use crate::caller::Caller;
use crate::convert::FormatConverter;
use crate::error::{BrokerError, Result};
use crate::identity::{ClientId, ClientSession, IdentityResolver, SessionStore};

/// Request-handler flow: identity, cache, then the broker on a miss.
pub struct ComputeService<S, C> {
    sessions: Arc<S>,
    cache: Arc<C>,
    identity: IdentityResolver,
    caller: Caller,
    scratch_dir: PathBuf,
}

impl<S, C> ComputeService<S, C>
where
    S: SessionStore,
    C: ResultCache,
{
    pub fn new(sessions: Arc<S>, cache: Arc<C>, identity: IdentityResolver, caller: Caller) -> Self {
        Self {
            sessions,
            cache,
            identity,
            caller,
            scratch_dir: std::env::temp_dir(),
        }
    }

    /// Directory where uploads are written before conversion.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn caller(&self) -> &Caller {
        &self.caller
    }

    /// Cache key of a remote call: function name, NUL, then the JSON arguments.
    pub fn call_hash(function: &str, args: &Value) -> Result<ContentHash> {
        let encoded = serde_json::to_vec(args)?;
        Ok(ContentHash::of_parts(&[function.as_bytes(), b"\0", &encoded]))
    }

    /// Run `function` for the session's client, serving repeats from the cache.
    pub async fn compute(&self, token: &str, function: &str, args: Value) -> Result<Artifact> {
        self.caller.broker().catalog().build_call(function, &args)?;

        let (mut session, client_id) = self.open_session(token).await?;
        let hash = Self::call_hash(function, &args)?;

        if let Some(artifact) = self.cached(&mut session, &client_id, &hash).await? {
            tracing::debug!(client_id = %client_id, function, "Serving computation from cache");
            return Ok(artifact);
        }

        let artifact = self.caller.call(function, args, &client_id, None).await?;
        self.remember(&mut session, &client_id, hash, artifact).await
    }

    /// Convert an upload, keyed by the hash of its raw bytes.
    pub async fn convert(
        &self,
        token: &str,
        input: &[u8],
        converter: &dyn FormatConverter,
        options: &[String],
    ) -> Result<Artifact> {
        if input.is_empty() {
            return Err(BrokerError::InvalidInput("empty upload".to_string()));
        }

        let (mut session, client_id) = self.open_session(token).await?;
        let hash = ContentHash::of(input);

        if let Some(artifact) = self.cached(&mut session, &client_id, &hash).await? {
            tracing::debug!(client_id = %client_id, hash = %hash, "Serving conversion from cache");
            return Ok(artifact);
        }

        let path = self
            .scratch_dir
            .join(format!("geo-broker-{}.upload", Uuid::new_v4()));
        tokio::fs::write(&path, input).await?;
        let converted = converter.convert(&path, options).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove scratch file");
        }

        let artifact = converted?;
        if artifact.is_empty() {
            return Err(BrokerError::ConversionFailed("empty output".to_string()));
        }
        self.remember(&mut session, &client_id, hash, artifact).await
    }

    /// Store client-supplied, already converted data under its content hash.
    pub async fn cache_input(&self, token: &str, name: &str, bytes: Vec<u8>) -> Result<ContentHash> {
        if bytes.is_empty() {
            return Err(BrokerError::InvalidInput(format!("{} is empty", name)));
        }

        let (mut session, client_id) = self.open_session(token).await?;
        let hash = ContentHash::of(&bytes);
        tracing::info!(client_id = %client_id, name, hash = %hash, bytes = bytes.len(), "Caching client input");
        self.remember(&mut session, &client_id, hash.clone(), bytes).await?;
        Ok(hash)
    }

    async fn open_session(&self, token: &str) -> Result<(ClientSession, ClientId)> {
        let mut session = self.sessions.load(token).await?;
        let client_id = self.identity.resolve(&mut session).await;
        self.sessions.save(&session).await?;
        Ok((session, client_id))
    }

    /// Cache lookup that keeps the session hints in line with the store.
    async fn cached(
        &self,
        session: &mut ClientSession,
        client_id: &ClientId,
        hash: &ContentHash,
    ) -> Result<Option<Artifact>> {
        let hinted = session.cached_hashes.contains(hash);
        match self.cache.lookup(client_id, hash).await? {
            Some(artifact) => {
                if !hinted {
                    tracing::debug!(client_id = %client_id, hash = %hash, "Repairing missing cache hint");
                    session.cached_hashes.insert(hash.clone());
                    self.sessions.save(session).await?;
                }
                Ok(Some(artifact))
            }
            None => {
                if hinted {
                    tracing::warn!(client_id = %client_id, hash = %hash, "Dropping stale cache hint");
                    session.cached_hashes.remove(hash);
                    self.sessions.save(session).await?;
                }
                Ok(None)
            }
        }
    }

    async fn remember(
        &self,
        session: &mut ClientSession,
        client_id: &ClientId,
        hash: ContentHash,
        artifact: Artifact,
    ) -> Result<Artifact> {
        if self.cache.store(client_id, &hash, artifact.clone()).await? == StoreOutcome::AlreadyPresent {
            tracing::debug!(client_id = %client_id, hash = %hash, "Result already cached");
        }
        session.cached_hashes.insert(hash);
        self.sessions.save(session).await?;
        Ok(artifact)
    }
}
