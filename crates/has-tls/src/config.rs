//! # config 模块说明
//!
//! ## 角色定位（Why）
//! - 工厂只通过 `get(key) -> value` 契约消费配置，[`ConfigSource`] 就是这条边界；
//! - 模式相关的子配置（`client.conf` / `server.conf` 指向的资源）以 TOML 文件承载，
//!   加载后拍平成点分键，与主配置使用同一套读取接口。
//!
//! ## 契约（What）
//! - 主配置键统一带 `hadoop.ssl.` 前缀，见本模块的常量；
//! - 布尔与整数取值非法时返回 [`TlsFactoryError::Configuration`]，不做静默回落。

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{error::TlsFactoryError, mode::Mode};

pub const SSL_REQUIRE_CLIENT_CERT_KEY: &str = "hadoop.ssl.require.client.cert";
pub const SSL_HOSTNAME_VERIFIER_KEY: &str = "hadoop.ssl.hostname.verifier";
pub const SSL_CLIENT_CONF_KEY: &str = "hadoop.ssl.client.conf";
pub const SSL_SERVER_CONF_KEY: &str = "hadoop.ssl.server.conf";
pub const SSL_ENABLED_PROTOCOLS_KEY: &str = "hadoop.ssl.enabled.protocols";

pub const DEFAULT_REQUIRE_CLIENT_CERT: bool = false;
pub const DEFAULT_HOSTNAME_VERIFIER: &str = "DEFAULT";
pub const DEFAULT_ENABLED_PROTOCOLS: &str = "TLSv1";

/// 键值配置源契约。
///
/// ### 设计目的（Why）
/// - 屏蔽配置来自文件、环境还是内存，工厂只关心“某个键当前的字符串值”；
/// - 类型化读取（布尔、整数、列表）以默认方法提供，实现者只需实现 [`ConfigSource::get`]。
///
/// ### 契约说明（What）
/// - `get` 返回 `None` 表示键不存在；空字符串是合法取值，由调用方自行判定；
/// - 实现必须 `Send + Sync`，工厂可能在多线程中共享同一个配置源。
pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn get_string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_owned())
    }

    fn get_bool(&self, key: &str, default: bool) -> Result<bool, TlsFactoryError> {
        let Some(raw) = self.get(key) else {
            return Ok(default);
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(TlsFactoryError::configuration(format!(
                "`{key}` expects a boolean, got `{raw}`"
            ))),
        }
    }

    fn get_u64(&self, key: &str, default: u64) -> Result<u64, TlsFactoryError> {
        let Some(raw) = self.get(key) else {
            return Ok(default);
        };
        raw.trim().parse().map_err(|_| {
            TlsFactoryError::configuration(format!(
                "`{key}` expects an unsigned integer, got `{raw}`"
            ))
        })
    }

    /// 逗号分隔的列表；空白项被丢弃。
    fn get_strings(&self, key: &str, default: &str) -> Vec<String> {
        self.get_string(key, default)
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

/// 基于 `BTreeMap` 的内存配置。
///
/// 既用作调用方手工拼装的主配置，也承载从 TOML 资源加载出的模式子配置。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MapConfig {
    entries: BTreeMap<String, String>,
}

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以值语义追加一项，便于链式构造。
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) -> &mut Self {
        self.set(key, value.to_string())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// 解析 TOML 文本并把嵌套表拍平成点分键。
    ///
    /// # 契约（What）
    /// - `[ssl.server]` 下的 `keystore.location = "..."` 与顶层 `"ssl.server.keystore.location" = "..."` 等价；
    /// - 数组按逗号拼接，其余标量取其文本形式；
    /// - `origin` 只用于错误文案。
    pub fn from_toml_str(text: &str, origin: &str) -> Result<Self, TlsFactoryError> {
        let table: toml::Table = text.parse().map_err(|err| {
            TlsFactoryError::configuration(format!("cannot parse ssl resource `{origin}`: {err}"))
        })?;
        let mut config = Self::new();
        flatten_into(&mut config.entries, None, &table);
        Ok(config)
    }

    pub fn load_toml_file(path: &Path) -> Result<Self, TlsFactoryError> {
        let text = fs::read_to_string(path).map_err(|err| {
            TlsFactoryError::configuration(format!(
                "cannot read ssl resource `{}`: {err}",
                path.display()
            ))
        })?;
        let config = Self::from_toml_str(&text, &path.display().to_string())?;
        debug!(
            resource = %path.display(),
            entries = config.len(),
            "loaded ssl resource"
        );
        Ok(config)
    }
}

impl ConfigSource for MapConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }
}

impl<T: ConfigSource + ?Sized> ConfigSource for &T {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }
}

fn flatten_into(out: &mut BTreeMap<String, String>, prefix: Option<&str>, table: &toml::Table) {
    for (key, value) in table {
        let full = match prefix {
            Some(prefix) => format!("{prefix}.{key}"),
            None => key.clone(),
        };
        match value {
            toml::Value::Table(nested) => flatten_into(out, Some(&full), nested),
            other => {
                out.insert(full, scalar_text(other));
            }
        }
    }
}

fn scalar_text(value: &toml::Value) -> String {
    match value {
        toml::Value::String(text) => text.clone(),
        toml::Value::Array(items) => items
            .iter()
            .map(scalar_text)
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

/// 工厂的声明式配置。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把主配置中与 TLS 相关的几项在构造阶段一次读完，`init` 时只做解析与校验，不再回读配置源；
///
/// ## 契约（What）
/// - `require_client_cert`：仅在 SERVER 模式下生效，默认 `false`；
/// - `enabled_protocols`：最低可接受协议版本的令牌列表，默认只有 `TLSv1`；
/// - `hostname_verifier_name`：未解析的策略名，默认 `DEFAULT`，在 `init` 时解析；
/// - `config_resource`：按模式挑选出的子配置资源路径。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FactoryConfig {
    pub require_client_cert: bool,
    pub enabled_protocols: Vec<String>,
    pub hostname_verifier_name: String,
    pub config_resource: PathBuf,
}

impl FactoryConfig {
    /// 以默认值构造，仅指定子配置资源。
    pub fn new(config_resource: impl Into<PathBuf>) -> Self {
        Self {
            require_client_cert: DEFAULT_REQUIRE_CLIENT_CERT,
            enabled_protocols: vec![DEFAULT_ENABLED_PROTOCOLS.to_owned()],
            hostname_verifier_name: DEFAULT_HOSTNAME_VERIFIER.to_owned(),
            config_resource: config_resource.into(),
        }
    }

    pub fn with_require_client_cert(mut self, required: bool) -> Self {
        self.require_client_cert = required;
        self
    }

    pub fn with_hostname_verifier(mut self, name: impl Into<String>) -> Self {
        self.hostname_verifier_name = name.into();
        self
    }

    pub fn with_enabled_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enabled_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// 按模式返回子配置资源所在的主配置键。
    pub const fn resource_key(mode: Mode) -> &'static str {
        match mode {
            Mode::Client => SSL_CLIENT_CONF_KEY,
            Mode::Server => SSL_SERVER_CONF_KEY,
        }
    }

    /// 从主配置读取工厂配置。
    ///
    /// # 契约（What）
    /// - **前置条件**：模式对应的资源键必须存在且非空，否则返回 `Configuration`；
    /// - **后置条件**：只读取，不访问文件系统。
    pub fn from_source(mode: Mode, conf: &dyn ConfigSource) -> Result<Self, TlsFactoryError> {
        let require_client_cert =
            conf.get_bool(SSL_REQUIRE_CLIENT_CERT_KEY, DEFAULT_REQUIRE_CLIENT_CERT)?;
        let resource_key = Self::resource_key(mode);
        let resource = conf
            .get(resource_key)
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                TlsFactoryError::configuration(format!(
                    "`{resource_key}` is not set for {mode} mode"
                ))
            })?;
        Ok(Self {
            require_client_cert,
            enabled_protocols: conf
                .get_strings(SSL_ENABLED_PROTOCOLS_KEY, DEFAULT_ENABLED_PROTOCOLS),
            hostname_verifier_name: conf
                .get_string(SSL_HOSTNAME_VERIFIER_KEY, DEFAULT_HOSTNAME_VERIFIER),
            config_resource: PathBuf::from(resource),
        })
    }

    /// 加载模式子配置，并把 `require_client_cert` 的解析结果写回子配置。
    pub fn load_ssl_config(&self) -> Result<MapConfig, TlsFactoryError> {
        let mut ssl_conf = MapConfig::load_toml_file(&self.config_resource)?;
        ssl_conf.set_bool(SSL_REQUIRE_CLIENT_CERT_KEY, self.require_client_cert);
        Ok(ssl_conf)
    }
}
