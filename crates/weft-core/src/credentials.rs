//! Channel and call credentials, and the composition algebra.
//!
//! Channel credentials carry the secure/insecure distinction plus any CA and
//! client-identity material; call credentials carry an async metadata
//! generator run against the call's authority. Composition attaches call
//! credentials to a composable channel credential; the result is sealed
//! against further composition.

use crate::error::WeftError;
use crate::metadata::Metadata;
use crate::status::Status;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::future::Future;
use std::sync::Arc;

type GeneratorFn =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<Metadata, Status>> + Send + Sync>;

/// An external bearer-token source: given nothing but itself, yields an
/// access token. Acquisition (OAuth flows, metadata servers) lives outside
/// this layer.
pub trait TokenSource: Send + Sync {
    fn access_token(&self) -> BoxFuture<'_, Result<String, Status>>;
}

/// Per-call credentials: one or more metadata generators run against the
/// call's authority URI, their outputs merged in order.
#[derive(Clone)]
pub struct CallCredentials {
    generators: Vec<GeneratorFn>,
}

impl CallCredentials {
    /// Wrap a metadata generator `(authority_uri) -> metadata`.
    pub fn from_generator<F, Fut>(generator: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Metadata, Status>> + Send + 'static,
    {
        Self {
            generators: vec![Arc::new(move |authority| generator(authority).boxed())],
        }
    }

    /// Credentials emitting a fixed `authorization: Bearer <token>` entry.
    pub fn from_access_token(token: impl Into<String>) -> Self {
        let header = format!("Bearer {}", token.into());
        Self::from_generator(move |_authority| {
            let header = header.clone();
            async move {
                let mut metadata = Metadata::new();
                metadata
                    .add("authorization", header)
                    .map_err(|e| Status::internal(e.to_string()))?;
                Ok(metadata)
            }
        })
    }

    /// Credentials that fetch a bearer token from `source` on every call.
    pub fn from_token_source(source: Arc<dyn TokenSource>) -> Self {
        Self::from_generator(move |_authority| {
            let source = Arc::clone(&source);
            async move {
                let token = source.access_token().await?;
                let mut metadata = Metadata::new();
                metadata
                    .add("authorization", format!("Bearer {}", token))
                    .map_err(|e| Status::internal(e.to_string()))?;
                Ok(metadata)
            }
        })
    }

    /// Combine two call credentials into one whose generator runs both and
    /// merges their metadata, preserving order.
    pub fn compose(mut self, other: CallCredentials) -> CallCredentials {
        self.generators.extend(other.generators);
        self
    }

    /// Run every generator against `authority` and merge the results.
    pub async fn apply(&self, authority: &str) -> Result<Metadata, Status> {
        let mut merged = Metadata::new();
        for generator in &self.generators {
            let metadata = generator(authority.to_string()).await?;
            merged.merge(metadata);
        }
        Ok(merged)
    }
}

impl std::fmt::Debug for CallCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallCredentials")
            .field("generators", &self.generators.len())
            .finish()
    }
}

/// Client identity material for mutual TLS: private key plus cert chain.
/// Requiring both at once is what keeps a half-configured identity out of
/// the channel.
#[derive(Debug, Clone)]
pub struct Identity {
    pub private_key: Bytes,
    pub cert_chain: Bytes,
}

impl Identity {
    pub fn new(private_key: impl Into<Bytes>, cert_chain: impl Into<Bytes>) -> Self {
        Self {
            private_key: private_key.into(),
            cert_chain: cert_chain.into(),
        }
    }
}

#[derive(Clone)]
enum ChannelKind {
    Insecure,
    Ssl {
        root_certs: Option<Bytes>,
        identity: Option<Identity>,
    },
}

/// Channel-level credentials: the insecure sentinel, an ssl credential, or a
/// composite carrying attached call credentials.
#[derive(Clone)]
pub struct ChannelCredentials {
    kind: ChannelKind,
    composable: bool,
    call_credentials: Option<CallCredentials>,
}

impl ChannelCredentials {
    /// The non-composable insecure sentinel.
    pub fn insecure() -> Self {
        Self {
            kind: ChannelKind::Insecure,
            composable: false,
            call_credentials: None,
        }
    }

    /// A composable secure credential. `root_certs` holds PEM-encoded CA
    /// material (the platform trust store when absent); `identity` supplies
    /// the client key/chain pair for mutual TLS.
    pub fn ssl(root_certs: Option<Bytes>, identity: Option<Identity>) -> Self {
        Self {
            kind: ChannelKind::Ssl {
                root_certs,
                identity,
            },
            composable: true,
            call_credentials: None,
        }
    }

    /// Whether call credentials may be attached to this credential.
    pub fn is_composable(&self) -> bool {
        self.composable
    }

    /// Whether this credential establishes a secure channel. Per-call
    /// credential overrides require a secure channel.
    pub fn is_secure(&self) -> bool {
        !matches!(self.kind, ChannelKind::Insecure)
    }

    /// Attach call credentials, producing a new channel credential. The
    /// result is itself non-composable; chain further call credentials with
    /// [`CallCredentials::compose`] or [`ChannelCredentials::combine`].
    pub fn compose(self, call: CallCredentials) -> Result<ChannelCredentials, WeftError> {
        if !self.composable {
            return Err(WeftError::invalid_argument(
                "cannot attach call credentials to a non-composable channel credential",
            ));
        }
        Ok(ChannelCredentials {
            kind: self.kind,
            composable: false,
            call_credentials: Some(match self.call_credentials {
                Some(existing) => existing.compose(call),
                None => call,
            }),
        })
    }

    /// Fold any number of call credentials onto this channel credential:
    /// `combine(c, [k1, k2])` is `c.compose(k1.compose(k2))`. With no call
    /// credentials the channel credential is returned unchanged.
    pub fn combine(
        self,
        calls: impl IntoIterator<Item = CallCredentials>,
    ) -> Result<ChannelCredentials, WeftError> {
        let mut iter = calls.into_iter();
        let first = match iter.next() {
            Some(first) => first,
            None => return Ok(self),
        };
        let folded = iter.fold(first, |acc, next| acc.compose(next));
        self.compose(folded)
    }

    /// The call credentials attached to this credential, if any.
    pub fn call_credentials(&self) -> Option<&CallCredentials> {
        self.call_credentials.as_ref()
    }

    /// The PEM root-CA material, if this is an ssl credential with pinned
    /// roots.
    pub fn root_certs(&self) -> Option<&Bytes> {
        match &self.kind {
            ChannelKind::Ssl { root_certs, .. } => root_certs.as_ref(),
            ChannelKind::Insecure => None,
        }
    }
}

impl std::fmt::Debug for ChannelCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            ChannelKind::Insecure => "insecure",
            ChannelKind::Ssl { .. } => "ssl",
        };
        f.debug_struct("ChannelCredentials")
            .field("kind", &kind)
            .field("composable", &self.composable)
            .field("call_credentials", &self.call_credentials.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call_cred(key: &'static str, value: &'static str) -> CallCredentials {
        CallCredentials::from_generator(move |_authority| async move {
            let mut md = Metadata::new();
            md.add(key, value).map_err(|e| Status::internal(e.to_string()))?;
            Ok(md)
        })
    }

    #[test]
    fn test_insecure_is_not_composable() {
        let insecure = ChannelCredentials::insecure();
        assert!(!insecure.is_composable());
        assert!(!insecure.is_secure());

        let err = insecure.compose(call_cred("x-a", "1")).unwrap_err();
        assert!(matches!(err, WeftError::InvalidArgument(_)));
    }

    #[test]
    fn test_composite_is_sealed() {
        let composite = ChannelCredentials::ssl(None, None)
            .compose(call_cred("x-a", "1"))
            .unwrap();
        assert!(!composite.is_composable());
        assert!(composite.is_secure());

        let err = composite.compose(call_cred("x-b", "2")).unwrap_err();
        assert!(matches!(err, WeftError::InvalidArgument(_)));
    }

    #[test]
    fn test_combine_folds_call_credentials() {
        let combined = ChannelCredentials::ssl(None, None)
            .combine([call_cred("x-a", "1"), call_cred("x-b", "2")])
            .unwrap();
        assert!(!combined.is_composable());
        assert!(combined.call_credentials().is_some());

        let unchanged = ChannelCredentials::ssl(None, None).combine([]).unwrap();
        assert!(unchanged.is_composable());
        assert!(unchanged.call_credentials().is_none());
    }

    #[tokio::test]
    async fn test_compose_call_merges_in_order() {
        let merged = call_cred("x-a", "1")
            .compose(call_cred("x-a", "2"))
            .compose(call_cred("x-b", "3"));

        let metadata = merged.apply("example.test").await.unwrap();
        let values: Vec<_> = metadata
            .get("x-a")
            .iter()
            .map(|v| v.as_text().unwrap())
            .collect();
        assert_eq!(values, vec!["1", "2"]);
        assert_eq!(metadata.get("x-b").len(), 1);
    }

    #[tokio::test]
    async fn test_access_token_credentials() {
        let creds = CallCredentials::from_access_token("tok-123");
        let metadata = creds.apply("example.test").await.unwrap();
        assert_eq!(
            metadata.first("authorization").unwrap().as_text(),
            Some("Bearer tok-123")
        );
    }

    #[tokio::test]
    async fn test_token_source_credentials() {
        struct Fixed;
        impl TokenSource for Fixed {
            fn access_token(&self) -> BoxFuture<'_, Result<String, Status>> {
                async { Ok("from-source".to_string()) }.boxed()
            }
        }

        let creds = CallCredentials::from_token_source(Arc::new(Fixed));
        let metadata = creds.apply("example.test").await.unwrap();
        assert_eq!(
            metadata.first("authorization").unwrap().as_text(),
            Some("Bearer from-source")
        );
    }

    #[tokio::test]
    async fn test_generator_failure_propagates() {
        let failing = CallCredentials::from_generator(|_authority| async {
            Err(Status::unauthenticated("no token"))
        });
        let err = failing.apply("example.test").await.unwrap_err();
        assert_eq!(err.code(), crate::status::Code::Unauthenticated);
    }
}
