#![doc = r#"
# has-tls

## 设计动机（Why）
- **统一信任边界**：HAS 管理服务既要暴露 HTTPS 服务端入口，又要向其它节点发起 HTTPS 请求；
  两个方向共用一份配置与一套生命周期，避免证书、协议与主机名策略各自漂移；
- **延迟初始化**：构造工厂只读配置，证书与协议问题集中在 `init` 暴露，便于在启动阶段一次性报错；
- **证书轮换**：信任库按需检测文件变化并热替换根证书，已建立的上下文无需重建。

## 核心契约（What）
- [`TlsContextFactory`]：按 [`Mode`] 发放握手引擎（[`TlsEngine`]）、套接字工厂
  （[`ServerSocketFactory`] / [`ClientSocketFactory`]）与主机名策略（[`HostnameVerifier`]）；
- [`TrustMaterialProvider`]：信任材料的来源契约，默认实现为基于 PEM 文件的 [`FileKeyStoresProvider`]；
- [`OutboundConnection`]：出站连接描述，经 [`TlsContextFactory::configure`] 附加 TLS 设施；
- 所有错误以 [`TlsFactoryError`] 同步返回；套接字层使用 [`TlsHandshakeError`]。

## 实现策略（How）
- TLS 协议由 `rustls`（ring 加密提供者）实现，异步套接字由 `tokio-rustls` 提供；
- 对端证书链校验交给 WebPKI，主机名匹配由本 crate 的策略注册表决定；
- 信任库快照使用 `ArcSwap` 发布，检查节流状态由 `parking_lot::Mutex` 保护。

## 风险与考量（Trade-offs）
- rustls 不实现 TLS 1.0/1.1，`TLSv1`、`TLSv1.1` 令牌被视作最低版本并抬升到 TLS 1.2；
- `ALLOW_ALL` 完全跳过主机名校验，只应出现在测试环境；
- 信任库检查发生在握手路径上，检查间隔越短，文件系统访问越频繁。
"#]

mod cert_verifier;
mod config;
mod connection;
mod engine;
mod error;
mod factory;
mod material;
mod mode;
mod protocol;
mod socket;
mod verifier;

pub use cert_verifier::{LiveClientVerifier, PolicyServerVerifier, peer_names};
pub use config::{
    ConfigSource, DEFAULT_ENABLED_PROTOCOLS, DEFAULT_HOSTNAME_VERIFIER,
    DEFAULT_REQUIRE_CLIENT_CERT, FactoryConfig, MapConfig, SSL_CLIENT_CONF_KEY,
    SSL_ENABLED_PROTOCOLS_KEY, SSL_HOSTNAME_VERIFIER_KEY, SSL_REQUIRE_CLIENT_CERT_KEY,
    SSL_SERVER_CONF_KEY,
};
pub use connection::{OutboundConnection, PlainConnection, SecureConnection};
pub use engine::TlsEngine;
pub use error::TlsFactoryError;
pub use factory::{TlsContext, TlsContextFactory};
pub use material::{
    DEFAULT_KEYSTORE_TYPE, DEFAULT_TRUSTSTORE_RELOAD_INTERVAL_MS, FileKeyStoresProvider,
    KeyMaterial, ReloadingTrustStore, StaticTrustManager, TrustManager, TrustMaterial,
    TrustMaterialProvider,
};
pub use mode::Mode;
pub use protocol::CONTEXT_PROTOCOL;
#[cfg(feature = "runtime-tokio")]
pub use socket::TlsServerSocket;
pub use socket::{ClientSocketFactory, ServerSocketFactory, TlsHandshakeError};
pub use verifier::{HostnameVerifier, PeerNames};
