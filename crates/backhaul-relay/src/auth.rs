//! Control stream authentication

use backhaul_proto::{read_auth, Auth, CodecError, CONNECT_SCOPE};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::debug;

use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("can't decode auth payload: {0}")]
    Decode(#[from] CodecError),

    #[error("route lookup failed: {0}")]
    Route(#[source] StorageError),

    #[error("token lookup failed: {0}")]
    Token(#[source] StorageError),

    #[error("token is missing the \"connect\" scope")]
    MissingScope,

    #[error("token owner {token_owner} does not own route for {domain}")]
    OwnerMismatch {
        domain: String,
        token_owner: String,
    },

    #[error("handshake timed out")]
    Timeout,
}

/// Validates the single `Auth` payload a backend writes on its control stream
#[derive(Clone)]
pub struct Authenticator {
    storage: Arc<dyn Storage>,
}

impl Authenticator {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Read one payload from `stream` and check it against storage
    ///
    /// Returns the owning user and the payload with its domain lowercased.
    pub async fn authenticate<R>(&self, stream: &mut R) -> Result<(String, Auth), AuthError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut auth = read_auth(stream).await?;
        auth.domain = auth.domain.to_ascii_lowercase();

        let route_owner = self
            .storage
            .has_route(&auth.domain)
            .await
            .map_err(AuthError::Route)?;

        let (token_owner, scopes) = self
            .storage
            .has_token(&auth.token)
            .await
            .map_err(AuthError::Token)?;

        if !scopes.iter().any(|scope| scope == CONNECT_SCOPE) {
            return Err(AuthError::MissingScope);
        }

        if route_owner != token_owner {
            return Err(AuthError::OwnerMismatch {
                domain: auth.domain,
                token_owner,
            });
        }

        debug!(user = %route_owner, domain = %auth.domain, "Backend authenticated");
        Ok((route_owner, auth))
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use backhaul_proto::write_auth;

    const USER: &str = "shachi";
    const TOKEN: &str = "orcaz r kewl";
    const NO_PERM_TOKEN: &str = "aw heck";
    const OTHER_USER_TOKEN: &str = "even more heck";
    const DOMAIN: &str = "cetacean.club";

    fn authenticator() -> Authenticator {
        let storage = MemoryStorage::new();
        storage.add_token(TOKEN, USER, ["connect"]);
        storage.add_token(NO_PERM_TOKEN, USER, Vec::<String>::new());
        storage.add_token(OTHER_USER_TOKEN, "cadey", ["connect"]);
        storage.add_route(DOMAIN, USER);
        Authenticator::new(Arc::new(storage))
    }

    async fn run(auth: &Auth) -> Result<(String, Auth), AuthError> {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_auth(&mut client, auth).await.unwrap();
        authenticator().authenticate(&mut server).await
    }

    #[tokio::test]
    async fn test_valid_credentials() {
        let (user, auth) = run(&Auth::new(TOKEN, DOMAIN)).await.unwrap();
        assert_eq!(user, USER);
        assert_eq!(auth.domain, DOMAIN);
    }

    #[tokio::test]
    async fn test_domain_is_case_insensitive() {
        let (_, auth) = run(&Auth::new(TOKEN, "Cetacean.CLUB")).await.unwrap();
        assert_eq!(auth.domain, DOMAIN);
    }

    #[tokio::test]
    async fn test_handshake_matrix() {
        let cases: &[(&str, &str, fn(&AuthError) -> bool)] = &[
            ("unknown token", "cetacean.club", |e| {
                matches!(e, AuthError::Token(_))
            }),
            (NO_PERM_TOKEN, "cetacean.club", |e| {
                matches!(e, AuthError::MissingScope)
            }),
            (OTHER_USER_TOKEN, "cetacean.club", |e| {
                matches!(e, AuthError::OwnerMismatch { .. })
            }),
            (TOKEN, "unknown.club", |e| matches!(e, AuthError::Route(_))),
        ];

        for (token, domain, expected) in cases {
            let err = run(&Auth::new(*token, *domain)).await.unwrap_err();
            assert!(expected(&err), "{} @ {}: unexpected {:?}", token, domain, err);
        }
    }

    #[tokio::test]
    async fn test_garbage_payload() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::io::AsyncWriteExt::write_all(&mut client, b"hello there")
            .await
            .unwrap();
        drop(client);

        assert!(matches!(
            authenticator().authenticate(&mut server).await,
            Err(AuthError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_eof_before_payload() {
        let (client, mut server) = tokio::io::duplex(1024);
        drop(client);

        assert!(matches!(
            authenticator().authenticate(&mut server).await,
            Err(AuthError::Decode(CodecError::UnexpectedEof))
        ));
    }
}
