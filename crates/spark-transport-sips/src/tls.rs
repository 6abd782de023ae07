//! TLS 凭据与握手配置。
//!
//! ## 意图（Why）
//! - 证书在构造阶段一次性装配，运行期不可变，因此服务端与客户端配置都只构建一次并以
//!   `Arc` 共享给所有握手任务；
//! - 出站校验策略显式化：[`PeerValidationPolicy::Permissive`] 通过自定义
//!   `ServerCertVerifier` 在证书校验失败时告警放行，[`PeerValidationPolicy::Strict`]
//!   直接使用 WebPKI 校验器。
//!
//! ## 契约（What）
//! - [`ChannelCredentials`]：可选服务端身份与出站信任根；
//! - `TlsContext::build`：生成可选的 `TlsAcceptor` 与必有的 `TlsConnector`，证书或私钥
//!   非法时返回 [`SipsError::Credentials`]。
//!
//! ## 风险与权衡（Trade-offs）
//! - 宽松策略下握手签名仍然严格校验，但证书链与名称不再可信，中间人可伪装对端。

use std::{fmt, net::SocketAddr, sync::Arc};

use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, Error as RustlsError, RootCertStore,
    ServerConfig, SignatureScheme,
    client::{
        WebPkiServerVerifier,
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    },
    crypto::{CryptoProvider, aws_lc_rs, verify_tls12_signature, verify_tls13_signature},
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::{config::PeerValidationPolicy, error::SipsError};

/// 服务端身份：证书链与私钥。
pub struct ServerIdentity {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl ServerIdentity {
    pub fn new(cert_chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { cert_chain, key }
    }
}

impl fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("chain_len", &self.cert_chain.len())
            .finish_non_exhaustive()
    }
}

/// 通道使用的证书材料。
///
/// 没有服务端身份时通道不监听，只能发起出站连接。
#[derive(Debug)]
pub struct ChannelCredentials {
    identity: Option<ServerIdentity>,
    roots: RootCertStore,
}

impl ChannelCredentials {
    pub fn new(identity: ServerIdentity, roots: RootCertStore) -> Self {
        Self {
            identity: Some(identity),
            roots,
        }
    }

    /// 仅用于出站连接的凭据。
    pub fn client_only(roots: RootCertStore) -> Self {
        Self {
            identity: None,
            roots,
        }
    }

    pub fn has_identity(&self) -> bool {
        self.identity.is_some()
    }
}

/// 构建完成、可直接用于握手的 TLS 上下文。
#[derive(Clone)]
pub(crate) struct TlsContext {
    acceptor: Option<TlsAcceptor>,
    connector: TlsConnector,
}

impl TlsContext {
    pub(crate) fn build(
        credentials: ChannelCredentials,
        policy: PeerValidationPolicy,
    ) -> Result<Self, SipsError> {
        let provider = crypto_provider();
        let acceptor = credentials
            .identity
            .map(|identity| server_config(Arc::clone(&provider), identity))
            .transpose()?
            .map(TlsAcceptor::from);
        let connector = TlsConnector::from(client_config(provider, credentials.roots, policy)?);
        Ok(Self {
            acceptor,
            connector,
        })
    }

    pub(crate) fn acceptor(&self) -> Option<&TlsAcceptor> {
        self.acceptor.as_ref()
    }

    pub(crate) fn connector(&self) -> &TlsConnector {
        &self.connector
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("accepts", &self.acceptor.is_some())
            .finish_non_exhaustive()
    }
}

/// 出站握手期望的对端证书名。
#[derive(Debug, Clone)]
pub(crate) struct ExpectedPeerName {
    pub(crate) name: String,
    pub(crate) server_name: ServerName<'static>,
}

/// 把调用方提供的期望证书名解析为 SNI / 校验名。
pub(crate) fn parse_peer_name(
    peer: SocketAddr,
    name: &str,
) -> Result<ExpectedPeerName, SipsError> {
    let name = name.trim().to_owned();
    let server_name =
        ServerName::try_from(name.clone()).map_err(|err| SipsError::Configuration {
            peer,
            detail: format!("invalid expected peer name `{name}`: {err}").into(),
        })?;
    Ok(ExpectedPeerName { name, server_name })
}

fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(aws_lc_rs::default_provider()))
}

fn credentials_error(source: RustlsError) -> SipsError {
    SipsError::Credentials { source }
}

fn server_config(
    provider: Arc<CryptoProvider>,
    identity: ServerIdentity,
) -> Result<Arc<ServerConfig>, SipsError> {
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(credentials_error)?
        .with_no_client_auth()
        .with_single_cert(identity.cert_chain, identity.key)
        .map_err(credentials_error)?;
    Ok(Arc::new(config))
}

fn client_config(
    provider: Arc<CryptoProvider>,
    roots: RootCertStore,
    policy: PeerValidationPolicy,
) -> Result<Arc<ClientConfig>, SipsError> {
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(credentials_error)?;
    let config = match policy {
        PeerValidationPolicy::Strict => builder.with_root_certificates(roots).with_no_client_auth(),
        PeerValidationPolicy::Permissive => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PermissiveServerVerifier::new(
                provider, roots,
            )?))
            .with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// 证书校验失败时告警放行的校验器。
///
/// 信任根为空时没有内层 WebPKI 校验器，每次握手都按“未知签发者”告警。
#[derive(Debug)]
pub(crate) struct PermissiveServerVerifier {
    inner: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
}

impl PermissiveServerVerifier {
    pub(crate) fn new(provider: Arc<CryptoProvider>, roots: RootCertStore) -> Result<Self, SipsError> {
        let inner = if roots.is_empty() {
            None
        } else {
            let verifier =
                WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
                    .build()
                    .map_err(|err| credentials_error(RustlsError::General(err.to_string())))?;
            Some(verifier)
        };
        Ok(Self { inner, provider })
    }
}

impl ServerCertVerifier for PermissiveServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        let outcome = match &self.inner {
            Some(inner) => {
                inner.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            }
            None => Err(RustlsError::InvalidCertificate(
                CertificateError::UnknownIssuer,
            )),
        };
        match outcome {
            Ok(verified) => Ok(verified),
            Err(error) => {
                tracing::warn!(
                    server_name = ?server_name,
                    error = %error,
                    code = "spark.transport.sips.peer_validation_bypassed",
                    "accepting peer certificate despite validation failure"
                );
                Ok(ServerCertVerified::assertion())
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
