use std::{fmt, sync::Arc};

use rustls::{
    ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection,
    SupportedProtocolVersion, crypto::CryptoProvider,
};
use tracing::{debug, info, warn};

use crate::{
    cert_verifier::{LiveClientVerifier, PolicyServerVerifier},
    config::{ConfigSource, FactoryConfig},
    connection::OutboundConnection,
    engine::TlsEngine,
    error::TlsFactoryError,
    material::{
        FileKeyStoresProvider, StaticTrustManager, TrustManager, TrustMaterial,
        TrustMaterialProvider,
    },
    mode::Mode,
    protocol::{CONTEXT_PROTOCOL, crypto_provider, resolve_versions},
    socket::{ClientSocketFactory, ServerSocketFactory, parse_server_name},
    verifier::HostnameVerifier,
};

/// `init` 成功后产出的 TLS 上下文。
#[derive(Clone)]
pub enum TlsContext {
    Client(Arc<ClientConfig>),
    Server(Arc<ServerConfig>),
}

impl TlsContext {
    pub fn mode(&self) -> Mode {
        match self {
            Self::Client(_) => Mode::Client,
            Self::Server(_) => Mode::Server,
        }
    }

    /// 上下文所属的协议族名称。
    pub fn protocol(&self) -> &'static str {
        CONTEXT_PROTOCOL
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TlsContext").field(&self.mode()).finish()
    }
}

struct ReadyContext {
    context: TlsContext,
    hostname: HostnameVerifier,
}

enum FactoryState {
    Uninitialized,
    Ready(ReadyContext),
    Destroyed,
}

impl FactoryState {
    fn label(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready(_) => "ready",
            Self::Destroyed => "destroyed",
        }
    }
}

/// 按模式产出 TLS 引擎与套接字工厂的上下文工厂。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 同一份配置既要支撑 HTTPS 服务端入口，也要支撑对外发起的 HTTPS 请求；
///   工厂在构造时固定模式，之后只发放与该模式匹配的 TLS 设施；
/// - 构造只读配置，不触碰证书文件；证书、协议与主机名策略都推迟到 `init` 统一校验。
///
/// ## 契约（What）
/// - 生命周期：`Uninitialized --init--> Ready --destroy--> Destroyed`；`init` 失败时保持 `Uninitialized`；
/// - `init` / `destroy` 以 `&mut self` 调用，其余操作以 `&self` 调用，工厂为 `Send + Sync`；
/// - 受模式限制的操作先检查模式，再检查生命周期状态；
/// - 所有失败都通过 [`TlsFactoryError`] 同步返回。
///
/// ## 实现（How）
/// - CLIENT 上下文使用 [`PolicyServerVerifier`]，每次握手向信任材料索取最新根证书并按主机名策略判定；
/// - SERVER 上下文在 `require_client_cert` 为真时安装 [`LiveClientVerifier`]，否则不请求客户端证书；
/// - 协议版本由 `enabled.protocols` 的最低令牌决定，在上下文层面生效，引擎与套接字工厂继承同一约束。
///
/// ## 风险（Trade-offs）
/// - `destroy` 后已经发放的引擎和套接字工厂仍持有上下文快照，可以继续完成握手，只是信任库不再刷新。
pub struct TlsContextFactory {
    mode: Mode,
    config: FactoryConfig,
    provider: Box<dyn TrustMaterialProvider>,
    state: FactoryState,
}

impl TlsContextFactory {
    /// 从主配置构造工厂，使用基于 PEM 文件的信任材料提供者。
    ///
    /// # 契约（What）
    /// - 读取 `hadoop.ssl.require.client.cert` 与模式对应的子配置资源键；
    /// - 加载子配置资源，并把客户端证书要求写入其中；
    /// - 资源键缺失、资源不可读或格式错误时返回 `Configuration`；
    /// - 不访问网络，也不读取证书文件。
    pub fn new(mode: Mode, conf: &dyn ConfigSource) -> Result<Self, TlsFactoryError> {
        let config = FactoryConfig::from_source(mode, conf)?;
        let ssl_conf = config.load_ssl_config()?;
        debug!(
            %mode,
            resource = %config.config_resource.display(),
            keys = ssl_conf.len(),
            "loaded TLS sub-configuration"
        );
        Ok(Self::with_provider(
            mode,
            config,
            Box::new(FileKeyStoresProvider::new(ssl_conf)),
        ))
    }

    /// 使用调用方提供的信任材料提供者构造工厂。
    pub fn with_provider(
        mode: Mode,
        config: FactoryConfig,
        provider: Box<dyn TrustMaterialProvider>,
    ) -> Self {
        Self {
            mode,
            config,
            provider,
            state: FactoryState::Uninitialized,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    pub fn is_client_cert_required(&self) -> bool {
        self.config.require_client_cert
    }

    pub fn enabled_protocols(&self) -> &[String] {
        &self.config.enabled_protocols
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, FactoryState::Ready(_))
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(self.state, FactoryState::Destroyed)
    }

    /// 装载信任材料并构建 TLS 上下文。
    ///
    /// # 契约（What）
    /// - **前置条件**：工厂处于 `Uninitialized`；`Ready` 时返回 `AlreadyInitialized`，`Destroyed` 时返回 `Destroyed`；
    /// - **后置条件**：成功则进入 `Ready`；失败则尽力释放提供者资源并保持 `Uninitialized`，可修复后重试；
    /// - 证书、私钥、信任库与协议问题返回 `SecurityInit`，策略名非法返回 `UnknownVerifier`。
    pub fn init(&mut self) -> Result<(), TlsFactoryError> {
        match self.state {
            FactoryState::Uninitialized => {}
            FactoryState::Ready(_) => return Err(TlsFactoryError::AlreadyInitialized),
            FactoryState::Destroyed => {
                return Err(TlsFactoryError::Destroyed { operation: "init" });
            }
        }

        let result = self
            .provider
            .init(self.mode)
            .and_then(|material| build_context(self.mode, &self.config, material));
        match result {
            Ok(ready) => {
                info!(
                    mode = %self.mode,
                    protocol = CONTEXT_PROTOCOL,
                    enabled_protocols = ?self.config.enabled_protocols,
                    hostname_verifier = %ready.hostname,
                    require_client_cert = self.config.require_client_cert,
                    "TLS context factory initialized"
                );
                self.state = FactoryState::Ready(ready);
                Ok(())
            }
            Err(err) => {
                warn!(mode = %self.mode, error = %err, "TLS context factory init failed");
                if let Err(release) = self.provider.destroy() {
                    warn!(
                        mode = %self.mode,
                        error = %release,
                        "releasing trust material after failed init also failed"
                    );
                }
                Err(err)
            }
        }
    }

    /// 释放信任材料，工厂进入 `Destroyed`。
    ///
    /// # 契约（What）
    /// - 无论提供者释放是否成功，工厂都会进入 `Destroyed`；释放失败会被记录并返回；
    /// - 对已销毁的工厂再次调用返回 `Destroyed`。
    pub fn destroy(&mut self) -> Result<(), TlsFactoryError> {
        if self.is_destroyed() {
            return Err(TlsFactoryError::Destroyed {
                operation: "destroy",
            });
        }
        let previous = std::mem::replace(&mut self.state, FactoryState::Destroyed);
        let released = self.provider.destroy();
        match &released {
            Ok(()) => info!(
                mode = %self.mode,
                from = previous.label(),
                "TLS context factory destroyed"
            ),
            Err(err) => warn!(
                mode = %self.mode,
                error = %err,
                "TLS context factory destroyed, releasing trust material failed"
            ),
        }
        released
    }

    /// 当前 TLS 上下文。
    pub fn context(&self) -> Result<&TlsContext, TlsFactoryError> {
        self.ready("context").map(|ready| &ready.context)
    }

    /// 创建一个握手引擎。
    ///
    /// # 契约（What）
    /// - CLIENT：引擎处于客户端角色，`peer_host` 必须是合法的 DNS 名称或 IP 地址，否则返回 `InvalidPeerHost`；
    /// - SERVER：引擎处于服务端角色，`need_client_auth` 等于 `require_client_cert`，`peer_host` 仅作记录；
    /// - `init` 之前返回 `NotInitialized`，销毁后返回 `Destroyed`。
    pub fn create_engine(&self, peer_host: Option<&str>) -> Result<TlsEngine, TlsFactoryError> {
        let ready = self.ready("create_engine")?;
        let protocols = self.config.enabled_protocols.clone();
        match &ready.context {
            TlsContext::Client(config) => {
                let host = peer_host.ok_or_else(|| TlsFactoryError::InvalidPeerHost {
                    host: String::new(),
                })?;
                let name =
                    parse_server_name(host).map_err(|_| TlsFactoryError::InvalidPeerHost {
                        host: host.to_owned(),
                    })?;
                let connection = ClientConnection::new(Arc::clone(config), name)
                    .map_err(TlsFactoryError::at_stage("engine"))?;
                Ok(TlsEngine::new(
                    Connection::Client(connection),
                    false,
                    protocols,
                    Some(host.to_owned()),
                ))
            }
            TlsContext::Server(config) => {
                let connection = ServerConnection::new(Arc::clone(config))
                    .map_err(TlsFactoryError::at_stage("engine"))?;
                Ok(TlsEngine::new(
                    Connection::Server(connection),
                    self.config.require_client_cert,
                    protocols,
                    peer_host.map(str::to_owned),
                ))
            }
        }
    }

    /// SERVER 模式专用。
    pub fn create_server_socket_factory(&self) -> Result<ServerSocketFactory, TlsFactoryError> {
        const OPERATION: &str = "create_server_socket_factory";
        self.require_mode(Mode::Server, OPERATION)?;
        match &self.ready(OPERATION)?.context {
            TlsContext::Server(config) => Ok(ServerSocketFactory::new(Arc::clone(config))),
            TlsContext::Client(_) => Err(self.wrong_mode(OPERATION)),
        }
    }

    /// CLIENT 模式专用。
    pub fn create_client_socket_factory(&self) -> Result<ClientSocketFactory, TlsFactoryError> {
        const OPERATION: &str = "create_client_socket_factory";
        self.require_mode(Mode::Client, OPERATION)?;
        match &self.ready(OPERATION)?.context {
            TlsContext::Client(config) => Ok(ClientSocketFactory::new(Arc::clone(config))),
            TlsContext::Server(_) => Err(self.wrong_mode(OPERATION)),
        }
    }

    /// CLIENT 模式专用：`init` 时解析出的主机名策略。
    pub fn hostname_verifier(&self) -> Result<HostnameVerifier, TlsFactoryError> {
        const OPERATION: &str = "hostname_verifier";
        self.require_mode(Mode::Client, OPERATION)?;
        self.ready(OPERATION).map(|ready| ready.hostname)
    }

    /// 为出站连接附加 TLS 设施。
    ///
    /// # 契约（What）
    /// - 明文连接原样返回，不做任何检查；
    /// - 安全连接附加客户端套接字工厂与主机名策略，两者的模式与状态错误原样上抛；
    /// - 不发起连接。
    pub fn configure(
        &self,
        connection: OutboundConnection,
    ) -> Result<OutboundConnection, TlsFactoryError> {
        match connection {
            OutboundConnection::Plain(plain) => Ok(OutboundConnection::Plain(plain)),
            OutboundConnection::Secure(mut secure) => {
                let socket_factory = self.create_client_socket_factory()?;
                let verifier = self.hostname_verifier()?;
                secure.attach(socket_factory, verifier);
                debug!(host = secure.host(), %verifier, "configured secure connection");
                Ok(OutboundConnection::Secure(secure))
            }
        }
    }

    fn ready(&self, operation: &'static str) -> Result<&ReadyContext, TlsFactoryError> {
        match &self.state {
            FactoryState::Ready(ready) => Ok(ready),
            FactoryState::Uninitialized => Err(TlsFactoryError::NotInitialized { operation }),
            FactoryState::Destroyed => Err(TlsFactoryError::Destroyed { operation }),
        }
    }

    fn require_mode(
        &self,
        expected: Mode,
        operation: &'static str,
    ) -> Result<(), TlsFactoryError> {
        if self.mode == expected {
            Ok(())
        } else {
            Err(self.wrong_mode(operation))
        }
    }

    fn wrong_mode(&self, operation: &'static str) -> TlsFactoryError {
        TlsFactoryError::WrongMode {
            operation,
            mode: self.mode,
        }
    }
}

impl fmt::Debug for TlsContextFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContextFactory")
            .field("mode", &self.mode)
            .field("config", &self.config)
            .field("state", &self.state.label())
            .finish_non_exhaustive()
    }
}

fn build_context(
    mode: Mode,
    config: &FactoryConfig,
    material: TrustMaterial,
) -> Result<ReadyContext, TlsFactoryError> {
    let versions = resolve_versions(&config.enabled_protocols)?;
    let hostname = HostnameVerifier::resolve(&config.hostname_verifier_name)?;
    let provider = crypto_provider();
    let context = match mode {
        Mode::Client => TlsContext::Client(Arc::new(client_config(
            provider, &versions, hostname, material,
        )?)),
        Mode::Server => TlsContext::Server(Arc::new(server_config(
            provider,
            &versions,
            config.require_client_cert,
            material,
        )?)),
    };
    if mode.is_client() && hostname.is_insecure() {
        warn!(%mode, "hostname verification is disabled (ALLOW_ALL)");
    }
    Ok(ReadyContext { context, hostname })
}

fn client_config(
    provider: Arc<CryptoProvider>,
    versions: &[&'static SupportedProtocolVersion],
    hostname: HostnameVerifier,
    material: TrustMaterial,
) -> Result<ClientConfig, TlsFactoryError> {
    let trust = material.trust_managers.unwrap_or_else(|| {
        debug!("no truststore configured, using bundled web PKI roots");
        Arc::new(StaticTrustManager::platform_default()) as Arc<dyn TrustManager>
    });
    let verifier = PolicyServerVerifier::new(trust, hostname, Arc::clone(&provider))?;
    let builder = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(versions)
        .map_err(TlsFactoryError::at_stage("protocol"))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier));
    match material.key_managers {
        Some(keys) => builder
            .with_client_auth_cert(keys.cert_chain().to_vec(), keys.private_key())
            .map_err(TlsFactoryError::at_stage("keystore")),
        None => Ok(builder.with_no_client_auth()),
    }
}

fn server_config(
    provider: Arc<CryptoProvider>,
    versions: &[&'static SupportedProtocolVersion],
    require_client_cert: bool,
    material: TrustMaterial,
) -> Result<ServerConfig, TlsFactoryError> {
    let keys = material.key_managers.ok_or_else(|| {
        TlsFactoryError::security_init("keystore", "SERVER mode requires a keystore")
    })?;
    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(versions)
        .map_err(TlsFactoryError::at_stage("protocol"))?;
    let builder = if require_client_cert {
        let trust = material.trust_managers.ok_or_else(|| {
            TlsFactoryError::security_init(
                "truststore",
                "client certificates are required but no truststore is configured",
            )
        })?;
        builder.with_client_cert_verifier(Arc::new(LiveClientVerifier::new(trust, provider)?))
    } else {
        builder.with_no_client_auth()
    };
    builder
        .with_single_cert(keys.cert_chain().to_vec(), keys.private_key())
        .map_err(TlsFactoryError::at_stage("keystore"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct EmptyProvider {
        destroyed: usize,
    }

    impl TrustMaterialProvider for EmptyProvider {
        fn init(&mut self, _mode: Mode) -> Result<TrustMaterial, TlsFactoryError> {
            Ok(TrustMaterial::default())
        }

        fn destroy(&mut self) -> Result<(), TlsFactoryError> {
            self.destroyed += 1;
            Ok(())
        }
    }

    fn client(config: FactoryConfig) -> TlsContextFactory {
        TlsContextFactory::with_provider(Mode::Client, config, Box::new(EmptyProvider::default()))
    }

    #[test]
    fn factory_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        fn assert_send<T: Send>() {}
        assert_send_sync::<TlsContextFactory>();
        assert_send::<TlsEngine>();
    }

    #[test]
    fn client_without_material_falls_back_to_bundled_roots() {
        let mut factory = client(FactoryConfig::new("ssl-client.toml"));
        factory.init().expect("客户端无需本地材料即可初始化");
        assert!(factory.is_ready());
        assert_eq!(factory.context().expect("上下文").mode(), Mode::Client);
        assert_eq!(factory.context().expect("上下文").protocol(), "TLS");
    }

    #[test]
    fn unknown_verifier_keeps_factory_uninitialized() {
        let mut factory =
            client(FactoryConfig::new("ssl-client.toml").with_hostname_verifier("LENIENT"));
        assert_eq!(
            factory.init(),
            Err(TlsFactoryError::UnknownVerifier {
                name: "LENIENT".to_owned()
            })
        );
        assert!(!factory.is_ready());
        assert!(matches!(
            factory.hostname_verifier(),
            Err(TlsFactoryError::NotInitialized { .. })
        ));
    }

    #[test]
    fn server_without_keystore_fails_security_init() {
        let mut factory = TlsContextFactory::with_provider(
            Mode::Server,
            FactoryConfig::new("ssl-server.toml"),
            Box::new(EmptyProvider::default()),
        );
        assert!(matches!(
            factory.init(),
            Err(TlsFactoryError::SecurityInit { stage: "keystore", .. })
        ));
        // 模式检查先于状态检查。
        assert!(matches!(
            factory.hostname_verifier(),
            Err(TlsFactoryError::WrongMode { .. })
        ));
    }

    #[test]
    fn client_engine_requires_a_valid_peer_host() {
        let mut factory = client(FactoryConfig::new("ssl-client.toml"));
        factory.init().expect("初始化");
        assert_eq!(
            factory.create_engine(None).map(|_| ()),
            Err(TlsFactoryError::InvalidPeerHost {
                host: String::new()
            })
        );
        assert_eq!(
            factory.create_engine(Some("not a host")).map(|_| ()),
            Err(TlsFactoryError::InvalidPeerHost {
                host: "not a host".to_owned()
            })
        );
        let engine = factory
            .create_engine(Some("kdc.example.com"))
            .expect("合法主机名");
        assert!(engine.use_client_mode());
        assert!(!engine.need_client_auth());
        assert_eq!(engine.peer_host(), Some("kdc.example.com"));
        assert_eq!(engine.enabled_protocols(), ["TLSv1".to_owned()]);
    }
}
