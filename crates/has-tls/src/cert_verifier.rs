//! rustls 校验器适配层：把实时信任库与主机名策略接到握手路径上。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 证书链校验交给 rustls 自带的 WebPKI 实现，本模块只负责两件事：
//!   每次握手从 [`TrustManager`] 取最新根证书，以及用 [`HostnameVerifier`] 替换 WebPKI 的名称匹配；
//! - 根证书未变化时复用已构建的 WebPKI 校验器，避免每次握手重建。
//!
//! ## 契约（What）
//! - [`PolicyServerVerifier`]：客户端侧。链校验失败直接拒绝；链校验通过后名称是否可接受完全由策略决定；
//! - [`LiveClientVerifier`]：服务端侧，强制要求客户端证书，并按当前根证书校验；
//! - 签名校验统一使用加密提供者的算法表。

use std::{fmt, net::IpAddr, sync::Arc};

use arc_swap::ArcSwapOption;
use rustls::{
    CertificateError, DigitallySignedStruct, DistinguishedName, Error as TlsError, RootCertStore,
    SignatureScheme,
    client::{
        WebPkiServerVerifier,
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    },
    crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature},
    server::{
        WebPkiClientVerifier,
        danger::{ClientCertVerified, ClientCertVerifier},
    },
};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tracing::debug;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::{
    error::TlsFactoryError,
    material::TrustManager,
    verifier::{HostnameVerifier, PeerNames},
};

/// 从终端实体证书中提取可用于主机名匹配的名称。
///
/// 无法解析的证书按 `BadEncoding` 拒绝；无法解码的单个 CN 或长度异常的 IP SAN 被跳过。
pub fn peer_names(cert: &CertificateDer<'_>) -> Result<PeerNames, TlsError> {
    let (_, parsed) = X509Certificate::from_der(cert.as_ref())
        .map_err(|_| TlsError::InvalidCertificate(CertificateError::BadEncoding))?;

    let mut names = PeerNames::default();
    for attribute in parsed.subject().iter_common_name() {
        if let Ok(value) = attribute.as_str() {
            names.common_names.push(value.to_owned());
        }
    }
    if let Ok(Some(san)) = parsed.subject_alternative_name() {
        for general_name in &san.value.general_names {
            match general_name {
                GeneralName::DNSName(dns) => names.dns_names.push((*dns).to_owned()),
                GeneralName::IPAddress(octets) => {
                    if let Some(ip) = ip_from_octets(octets) {
                        names.ip_addresses.push(ip);
                    }
                }
                _ => {}
            }
        }
    }
    Ok(names)
}

fn ip_from_octets(octets: &[u8]) -> Option<IpAddr> {
    if let Ok(v4) = <[u8; 4]>::try_from(octets) {
        Some(IpAddr::from(v4))
    } else if let Ok(v6) = <[u8; 16]>::try_from(octets) {
        Some(IpAddr::from(v6))
    } else {
        None
    }
}

/// 按根证书快照缓存的 WebPKI 校验器。
struct Cached<V: ?Sized> {
    roots: Arc<RootCertStore>,
    verifier: Arc<V>,
}

struct VerifierCache<V: ?Sized> {
    slot: ArcSwapOption<Cached<V>>,
}

impl<V: ?Sized> VerifierCache<V> {
    fn empty() -> Self {
        Self {
            slot: ArcSwapOption::empty(),
        }
    }

    fn get_or_build(
        &self,
        roots: Arc<RootCertStore>,
        build: impl FnOnce(Arc<RootCertStore>) -> Result<Arc<V>, TlsError>,
    ) -> Result<Arc<V>, TlsError> {
        if let Some(cached) = self.slot.load_full()
            && Arc::ptr_eq(&cached.roots, &roots)
        {
            return Ok(Arc::clone(&cached.verifier));
        }
        let verifier = build(Arc::clone(&roots))?;
        self.slot.store(Some(Arc::new(Cached {
            roots,
            verifier: Arc::clone(&verifier),
        })));
        Ok(verifier)
    }
}

fn is_name_mismatch(err: &TlsError) -> bool {
    matches!(
        err,
        TlsError::InvalidCertificate(
            CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
        )
    )
}

/// 客户端侧的服务端证书校验器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - WebPKI 的名称匹配固定为“通配符只覆盖一级标签”，无法表达 `DEFAULT` 的多级通配，
///   也无法实现 `ALLOW_ALL`；因此保留其链校验结果，名称判定改由 [`HostnameVerifier`] 完成。
///
/// ## 契约（What）
/// - 链校验（签名、有效期、用途）失败时原样返回 WebPKI 的错误；
/// - 链校验通过而仅名称不匹配时，交给策略重新判定；
/// - 策略拒绝时返回 `InvalidCertificate(NotValidForName)`。
pub struct PolicyServerVerifier {
    trust: Arc<dyn TrustManager>,
    hostname: HostnameVerifier,
    provider: Arc<CryptoProvider>,
    cache: VerifierCache<WebPkiServerVerifier>,
}

impl PolicyServerVerifier {
    /// 构造并立即用当前根证书预构建一次，根证书不可用时返回 `SecurityInit`。
    pub fn new(
        trust: Arc<dyn TrustManager>,
        hostname: HostnameVerifier,
        provider: Arc<CryptoProvider>,
    ) -> Result<Self, TlsFactoryError> {
        let verifier = Self {
            trust,
            hostname,
            provider,
            cache: VerifierCache::empty(),
        };
        verifier
            .current()
            .map_err(TlsFactoryError::at_stage("truststore"))?;
        Ok(verifier)
    }

    pub fn hostname_verifier(&self) -> HostnameVerifier {
        self.hostname
    }

    fn current(&self) -> Result<Arc<WebPkiServerVerifier>, TlsError> {
        let provider = Arc::clone(&self.provider);
        self.cache.get_or_build(self.trust.roots(), move |roots| {
            WebPkiServerVerifier::builder_with_provider(roots, provider)
                .build()
                .map_err(|err| TlsError::General(err.to_string()))
        })
    }
}

impl ServerCertVerifier for PolicyServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        match self.current()?.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(_) => {}
            Err(err) if is_name_mismatch(&err) => {}
            Err(err) => return Err(err),
        }

        let host = server_name.to_str();
        let names = peer_names(end_entity)?;
        if self.hostname.verify(&host, &names) {
            Ok(ServerCertVerified::assertion())
        } else {
            debug!(
                host = %host,
                policy = %self.hostname,
                dns_names = ?names.dns_names,
                "peer certificate does not cover host"
            );
            Err(TlsError::InvalidCertificate(CertificateError::NotValidForName))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
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
    ) -> Result<HandshakeSignatureValid, TlsError> {
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

impl fmt::Debug for PolicyServerVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyServerVerifier")
            .field("trust", &self.trust)
            .field("hostname", &self.hostname)
            .finish_non_exhaustive()
    }
}

/// 服务端侧的客户端证书校验器，始终要求客户端出示证书。
pub struct LiveClientVerifier {
    trust: Arc<dyn TrustManager>,
    provider: Arc<CryptoProvider>,
    cache: VerifierCache<dyn ClientCertVerifier>,
}

impl LiveClientVerifier {
    pub fn new(
        trust: Arc<dyn TrustManager>,
        provider: Arc<CryptoProvider>,
    ) -> Result<Self, TlsFactoryError> {
        let verifier = Self {
            trust,
            provider,
            cache: VerifierCache::empty(),
        };
        verifier
            .current()
            .map_err(TlsFactoryError::at_stage("truststore"))?;
        Ok(verifier)
    }

    fn current(&self) -> Result<Arc<dyn ClientCertVerifier>, TlsError> {
        let provider = Arc::clone(&self.provider);
        self.cache.get_or_build(self.trust.roots(), move |roots| {
            WebPkiClientVerifier::builder_with_provider(roots, provider)
                .build()
                .map_err(|err| TlsError::General(err.to_string()))
        })
    }
}

impl ClientCertVerifier for LiveClientVerifier {
    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        // 根证书会热更新，不向客户端提示 CA 名称。
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, TlsError> {
        self.current()?
            .verify_client_cert(end_entity, intermediates, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
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
    ) -> Result<HandshakeSignatureValid, TlsError> {
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

impl fmt::Debug for LiveClientVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveClientVerifier")
            .field("trust", &self.trust)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use rcgen::{
        BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
        KeyPair,
    };

    use super::*;
    use crate::{material::StaticTrustManager, protocol::crypto_provider};

    struct Pki {
        roots: RootCertStore,
        ca_cert: Certificate,
        ca_key: KeyPair,
    }

    fn pki() -> Pki {
        let ca_key = KeyPair::generate().expect("CA 密钥");
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("CA 参数");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "HAS Test Root");
        let ca_cert = params.self_signed(&ca_key).expect("自签 CA");
        let mut roots = RootCertStore::empty();
        roots.add(ca_cert.der().clone()).expect("加入根证书");
        Pki {
            roots,
            ca_cert,
            ca_key,
        }
    }

    fn leaf(pki: &Pki, names: &[&str]) -> CertificateDer<'static> {
        let key = KeyPair::generate().expect("叶子密钥");
        let owned: Vec<String> = names.iter().map(|n| (*n).to_owned()).collect();
        let mut params = CertificateParams::new(owned).expect("叶子参数");
        params
            .distinguished_name
            .push(DnType::CommonName, "kdc.example.com");
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params
            .signed_by(&key, &pki.ca_cert, &pki.ca_key)
            .expect("CA 签发")
            .der()
            .clone()
    }

    fn server_verifier(pki: &Pki, policy: HostnameVerifier) -> PolicyServerVerifier {
        let trust: Arc<dyn TrustManager> = Arc::new(StaticTrustManager::new(pki.roots.clone()));
        PolicyServerVerifier::new(trust, policy, crypto_provider()).expect("构造校验器")
    }

    fn verify(
        verifier: &PolicyServerVerifier,
        cert: &CertificateDer<'_>,
        host: &str,
    ) -> Result<ServerCertVerified, TlsError> {
        let name = ServerName::try_from(host.to_owned()).expect("合法主机名");
        verifier.verify_server_cert(cert, &[], &name, &[], UnixTime::now())
    }

    #[test]
    fn extracts_dns_ip_and_common_names() {
        let pki = pki();
        let cert = leaf(&pki, &["kdc.example.com", "127.0.0.1"]);
        let names = peer_names(&cert).expect("解析证书");
        assert_eq!(names.dns_names, vec!["kdc.example.com".to_owned()]);
        assert_eq!(names.ip_addresses, vec![IpAddr::from([127, 0, 0, 1])]);
        assert_eq!(names.common_names, vec!["kdc.example.com".to_owned()]);
    }

    #[test]
    fn garbage_certificate_is_bad_encoding() {
        let garbage = CertificateDer::from(vec![0u8; 12]);
        assert_eq!(
            peer_names(&garbage),
            Err(TlsError::InvalidCertificate(CertificateError::BadEncoding))
        );
    }

    #[test]
    fn policy_decides_deep_wildcards() {
        let pki = pki();
        let cert = leaf(&pki, &["*.example.com"]);

        let default = server_verifier(&pki, HostnameVerifier::Default);
        assert!(verify(&default, &cert, "deep.node.example.com").is_ok());
        assert!(verify(&default, &cert, "kdc.example.com").is_ok());

        let strict = server_verifier(&pki, HostnameVerifier::Strict);
        assert!(verify(&strict, &cert, "kdc.example.com").is_ok());
        assert_eq!(
            verify(&strict, &cert, "deep.node.example.com").map(|_| ()),
            Err(TlsError::InvalidCertificate(CertificateError::NotValidForName))
        );
    }

    #[test]
    fn allow_all_still_requires_a_trusted_chain() {
        let trusted = pki();
        let stranger = pki();
        let cert = leaf(&stranger, &["kdc.example.com"]);

        let verifier = server_verifier(&trusted, HostnameVerifier::AllowAll);
        let err = verify(&verifier, &cert, "other.host")
            .map(|_| ())
            .expect_err("未受信任的链");
        assert!(!is_name_mismatch(&err));

        let own = leaf(&trusted, &["kdc.example.com"]);
        assert!(verify(&verifier, &own, "other.host").is_ok());
    }

    #[test]
    fn verifier_is_reused_while_roots_are_unchanged() {
        let pki = pki();
        let verifier = server_verifier(&pki, HostnameVerifier::Default);
        let first = verifier.current().expect("首次构建");
        let second = verifier.current().expect("复用");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn client_verifier_requires_certificates_from_known_roots() {
        let trusted = pki();
        let trust: Arc<dyn TrustManager> =
            Arc::new(StaticTrustManager::new(trusted.roots.clone()));
        let verifier = LiveClientVerifier::new(trust, crypto_provider()).expect("构造校验器");
        assert!(verifier.client_auth_mandatory());

        let own = leaf(&trusted, &["client.example.com"]);
        assert!(verifier.verify_client_cert(&own, &[], UnixTime::now()).is_ok());

        let stranger = pki();
        let foreign = leaf(&stranger, &["client.example.com"]);
        assert!(verifier
            .verify_client_cert(&foreign, &[], UnixTime::now())
            .is_err());
    }

    #[test]
    fn empty_roots_fail_at_construction() {
        let trust: Arc<dyn TrustManager> =
            Arc::new(StaticTrustManager::new(RootCertStore::empty()));
        assert!(matches!(
            LiveClientVerifier::new(trust, crypto_provider()),
            Err(TlsFactoryError::SecurityInit { stage: "truststore", .. })
        ));
    }
}
