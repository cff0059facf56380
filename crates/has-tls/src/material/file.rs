use std::{path::PathBuf, sync::Arc, time::Duration};

use rustls_pki_types::{PrivateKeyDer, pem::PemObject};
use tracing::{debug, info};

use super::{
    KeyMaterial, TrustManager, TrustMaterial, TrustMaterialProvider, load_certificates,
    reload::ReloadingTrustStore,
};
use crate::{
    config::{ConfigSource, MapConfig},
    error::TlsFactoryError,
    mode::Mode,
};

/// 唯一支持的密钥库格式。
pub const DEFAULT_KEYSTORE_TYPE: &str = "pem";

/// 信任库文件的默认检查间隔（毫秒）。
pub const DEFAULT_TRUSTSTORE_RELOAD_INTERVAL_MS: u64 = 10_000;

/// 基于 PEM 文件的信任材料提供者。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 运维侧按模式分别下发证书文件，工厂只认子配置里的文件路径；
/// - 信任库交给 [`ReloadingTrustStore`]，证书轮换不需要重启进程。
///
/// ## 契约（What）
/// 子配置键（`<mode>` 为 `client` 或 `server`）：
/// - `ssl.<mode>.keystore.type`：只接受 `pem`，缺省即 `pem`；
/// - `ssl.<mode>.keystore.location`：证书链 PEM，可同时包含私钥；SERVER 模式必填；
/// - `ssl.<mode>.keystore.keyfile`：独立的私钥 PEM，缺省时从证书链文件中读取私钥；
/// - `ssl.<mode>.truststore.location`：根证书 PEM，缺省表示不配置信任库；
/// - `ssl.<mode>.truststore.reload.interval`：信任库检查间隔（毫秒）。
///
/// ## 注意事项（Gotchas）
/// - 重复 `init` 会先关闭上一次打开的信任库；
/// - `destroy` 只关闭信任库，已交给 TLS 上下文的快照仍然可用。
#[derive(Debug)]
pub struct FileKeyStoresProvider {
    conf: MapConfig,
    trust_store: Option<Arc<ReloadingTrustStore>>,
}

impl FileKeyStoresProvider {
    pub fn new(conf: MapConfig) -> Self {
        Self {
            conf,
            trust_store: None,
        }
    }

    /// 最近一次 `init` 打开的信任库。
    pub fn trust_store(&self) -> Option<&Arc<ReloadingTrustStore>> {
        self.trust_store.as_ref()
    }

    fn key(mode: Mode, suffix: &str) -> String {
        format!("ssl.{}.{suffix}", mode.key_segment())
    }

    fn path(&self, mode: Mode, suffix: &str) -> Option<PathBuf> {
        self.conf
            .get(&Self::key(mode, suffix))
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
    }

    fn load_key_material(&self, mode: Mode) -> Result<Option<KeyMaterial>, TlsFactoryError> {
        let keystore_type = self
            .conf
            .get_string(&Self::key(mode, "keystore.type"), DEFAULT_KEYSTORE_TYPE);
        if !keystore_type.trim().eq_ignore_ascii_case(DEFAULT_KEYSTORE_TYPE) {
            return Err(TlsFactoryError::security_init(
                "keystore",
                format!("unsupported keystore type `{keystore_type}`"),
            ));
        }

        let Some(location) = self.path(mode, "keystore.location") else {
            if mode == Mode::Server {
                let key = Self::key(mode, "keystore.location");
                return Err(TlsFactoryError::security_init(
                    "keystore",
                    format!("`{key}` is required in SERVER mode"),
                ));
            }
            debug!(%mode, "no keystore configured, client will not present a certificate");
            return Ok(None);
        };

        let chain = load_certificates(&location, "keystore")?;
        let key_path = self.path(mode, "keystore.keyfile").unwrap_or_else(|| location.clone());
        let key = PrivateKeyDer::from_pem_file(&key_path).map_err(|err| {
            TlsFactoryError::security_init("keystore", format!("`{}`: {err}", key_path.display()))
        })?;
        info!(
            %mode,
            keystore = %location.display(),
            certificates = chain.len(),
            "keystore loaded"
        );
        KeyMaterial::new(chain, key).map(Some)
    }

    fn open_trust_store(
        &self,
        mode: Mode,
    ) -> Result<Option<ReloadingTrustStore>, TlsFactoryError> {
        let Some(location) = self.path(mode, "truststore.location") else {
            return Ok(None);
        };
        let interval = self
            .conf
            .get_u64(
                &Self::key(mode, "truststore.reload.interval"),
                DEFAULT_TRUSTSTORE_RELOAD_INTERVAL_MS,
            )
            .map_err(|err| TlsFactoryError::security_init("truststore", err.to_string()))?;
        ReloadingTrustStore::open(location, Duration::from_millis(interval)).map(Some)
    }
}

impl TrustMaterialProvider for FileKeyStoresProvider {
    fn init(&mut self, mode: Mode) -> Result<TrustMaterial, TlsFactoryError> {
        if let Some(previous) = self.trust_store.take() {
            previous.close();
        }
        let key_managers = self.load_key_material(mode)?;
        let trust_store = self.open_trust_store(mode)?.map(Arc::new);
        self.trust_store = trust_store.clone();
        Ok(TrustMaterial {
            key_managers,
            trust_managers: trust_store.map(|store| store as Arc<dyn TrustManager>),
        })
    }

    fn destroy(&mut self) -> Result<(), TlsFactoryError> {
        if let Some(store) = self.trust_store.take() {
            store.close();
        }
        Ok(())
    }
}
