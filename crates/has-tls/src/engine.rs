use std::fmt;

use rustls::Connection;

/// 与传输层无关的 TLS 握手引擎。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 有些调用方自己驱动字节流（例如嵌入已有事件循环或内存管道），需要一个不绑定套接字的 TLS 会话；
/// - 引擎同时记录工厂赋予它的角色参数，便于调用方审计。
///
/// ## 契约（What）
/// - `use_client_mode()`：由工厂模式决定，CLIENT 为 `true`；
/// - `need_client_auth()`：仅 SERVER 引擎可能为 `true`，等于工厂的 `require_client_cert`；
/// - `enabled_protocols()`：工厂配置的协议令牌，实际协商范围已在上下文中生效；
/// - 读写数据通过 [`TlsEngine::connection_mut`] 暴露的 `rustls::Connection` 完成。
pub struct TlsEngine {
    connection: Connection,
    need_client_auth: bool,
    enabled_protocols: Vec<String>,
    peer_host: Option<String>,
}

impl TlsEngine {
    pub(crate) fn new(
        connection: Connection,
        need_client_auth: bool,
        enabled_protocols: Vec<String>,
        peer_host: Option<String>,
    ) -> Self {
        Self {
            connection,
            need_client_auth,
            enabled_protocols,
            peer_host,
        }
    }

    pub fn use_client_mode(&self) -> bool {
        matches!(self.connection, Connection::Client(_))
    }

    pub fn need_client_auth(&self) -> bool {
        self.need_client_auth
    }

    pub fn enabled_protocols(&self) -> &[String] {
        &self.enabled_protocols
    }

    /// 创建引擎时给出的对端主机（SERVER 引擎仅作记录）。
    pub fn peer_host(&self) -> Option<&str> {
        self.peer_host.as_deref()
    }

    pub fn is_handshaking(&self) -> bool {
        self.connection.is_handshaking()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    pub fn into_connection(self) -> Connection {
        self.connection
    }
}

impl fmt::Debug for TlsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsEngine")
            .field("client_mode", &self.use_client_mode())
            .field("need_client_auth", &self.need_client_auth)
            .field("enabled_protocols", &self.enabled_protocols)
            .field("peer_host", &self.peer_host)
            .field("handshaking", &self.is_handshaking())
            .finish()
    }
}
