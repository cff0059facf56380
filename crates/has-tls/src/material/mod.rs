//! # material 模块说明
//!
//! ## 角色定位（Why）
//! - 工厂需要两类信任材料：表明自身身份的 key manager（证书链 + 私钥），以及校验对端的
//!   trust manager（根证书集合）；两者的来源、格式与热更新策略都交给 [`TrustMaterialProvider`]；
//! - trust manager 是“活”的：工厂在每次对端校验时向它索取当前根证书，而不是在 `init` 时拷贝一份。
//!
//! ## 契约（What）
//! - [`TrustMaterialProvider::init`] 每个工厂只调用一次（失败后允许再次调用）；
//! - [`TrustMaterialProvider::destroy`] 释放文件监视与缓存，之后已发放的 trust manager 仍可读，但不再刷新。

mod file;
mod reload;

use std::{fmt, sync::Arc};

use rustls::RootCertStore;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::{error::TlsFactoryError, mode::Mode};

pub use file::{
    DEFAULT_KEYSTORE_TYPE, DEFAULT_TRUSTSTORE_RELOAD_INTERVAL_MS, FileKeyStoresProvider,
};
pub use reload::ReloadingTrustStore;

pub(crate) use reload::load_certificates;

/// 对端校验所用根证书的实时来源。
///
/// 实现者可以在两次握手之间替换根证书；调用方每次校验前都会重新调用 [`TrustManager::roots`]。
pub trait TrustManager: Send + Sync + fmt::Debug {
    fn roots(&self) -> Arc<RootCertStore>;
}

/// 不会变化的根证书集合。
#[derive(Clone, Debug)]
pub struct StaticTrustManager {
    roots: Arc<RootCertStore>,
}

impl StaticTrustManager {
    pub fn new(roots: RootCertStore) -> Self {
        Self {
            roots: Arc::new(roots),
        }
    }

    /// 内置的 Mozilla 根证书，CLIENT 模式未配置信任库时使用。
    pub fn platform_default() -> Self {
        Self::new(RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        })
    }
}

impl TrustManager for StaticTrustManager {
    fn roots(&self) -> Arc<RootCertStore> {
        Arc::clone(&self.roots)
    }
}

/// 本端身份：证书链与对应私钥。
pub struct KeyMaterial {
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
}

impl KeyMaterial {
    /// # 契约（What）
    /// - `cert_chain` 首项为终端实体证书，不能为空。
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Result<Self, TlsFactoryError> {
        if cert_chain.is_empty() {
            return Err(TlsFactoryError::security_init(
                "keystore",
                "key material carries no certificate",
            ));
        }
        Ok(Self {
            cert_chain,
            private_key,
        })
    }

    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        self.private_key.clone_key()
    }
}

impl Clone for KeyMaterial {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            private_key: self.private_key.clone_key(),
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("certificates", &self.cert_chain.len())
            .finish_non_exhaustive()
    }
}

/// 信任材料提供者为某个模式产出的材料。
///
/// - `key_managers` 为 `None` 表示本端不出示证书；
/// - `trust_managers` 为 `None` 表示未配置信任库：CLIENT 回落到内置根证书，SERVER 无法校验客户端证书。
#[derive(Clone, Debug, Default)]
pub struct TrustMaterial {
    pub key_managers: Option<KeyMaterial>,
    pub trust_managers: Option<Arc<dyn TrustManager>>,
}

/// 信任材料提供者契约。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 让密钥库格式、文件位置与热更新策略独立于工厂演进，测试与嵌入方也能注入自定义实现；
///
/// ## 契约（What）
/// - `init(mode)`：按模式装载材料；失败时返回 [`TlsFactoryError::SecurityInit`]；
/// - `destroy()`：尽力释放资源，失败会被工厂记录并上报，但不会阻止工厂进入销毁状态；
/// - 两个方法都以 `&mut self` 调用，工厂保证它们不会与彼此并发。
pub trait TrustMaterialProvider: Send + Sync {
    fn init(&mut self, mode: Mode) -> Result<TrustMaterial, TlsFactoryError>;

    fn destroy(&mut self) -> Result<(), TlsFactoryError>;
}
