//! 套接字工厂：把工厂产出的 TLS 上下文接到 Tokio 的 TCP 监听与连接上。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 工厂按模式只发放一种套接字工厂：SERVER 得到 [`ServerSocketFactory`]，CLIENT 得到 [`ClientSocketFactory`]；
//! - 两者都只持有 `Arc` 配置快照，克隆成本为一次引用计数，可自由分发给各个任务。
//!
//! ## 契约（What）
//! - 结构体本身不依赖运行时；`bind`/`accept`/`connect` 等异步方法需要 `runtime-tokio` 特性；
//! - 握手阶段的失败统一以 [`TlsHandshakeError`] 返回，可通过 [`TlsHandshakeError::tls_error`] 取出 rustls 的具体原因。

use std::{fmt, io, sync::Arc};

use rustls::{ClientConfig, ServerConfig};
use rustls_pki_types::ServerName;
use thiserror::Error;

#[cfg(feature = "runtime-tokio")]
use {
    std::net::SocketAddr,
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, TcpStream, ToSocketAddrs},
    },
    tokio_rustls::{TlsAcceptor, TlsConnector, client, server},
    tracing::debug,
};

/// 套接字层的错误类型。
///
/// # 契约（What）
/// - `Bind` / `Accept` / `Connect`：TCP 层失败；
/// - `InvalidServerName`：传入的主机名既不是合法 DNS 名称也不是 IP 地址；
/// - `Handshake`：TLS 协商失败，`source` 中包裹 rustls 的错误；
/// - `NotConfigured`：安全连接尚未经过工厂 `configure`。
#[derive(Debug, Error)]
pub enum TlsHandshakeError {
    #[error("failed to bind TLS listener: {source}")]
    Bind { source: io::Error },

    #[error("failed to accept TCP connection: {source}")]
    Accept { source: io::Error },

    #[error("failed to connect: {source}")]
    Connect { source: io::Error },

    #[error("invalid server name `{name}`")]
    InvalidServerName { name: String },

    /// 握手过程中发生 IO 或 TLS 协商错误。
    #[error("TLS handshake failed: {source}")]
    Handshake { source: io::Error },

    #[error("secure connection has not been configured by a client factory")]
    NotConfigured,
}

impl TlsHandshakeError {
    /// 握手失败时底层的 rustls 错误（例如证书被拒绝）。
    pub fn tls_error(&self) -> Option<&rustls::Error> {
        match self {
            Self::Handshake { source } => source.get_ref()?.downcast_ref::<rustls::Error>(),
            _ => None,
        }
    }
}

/// SERVER 模式的套接字工厂。
#[derive(Clone)]
pub struct ServerSocketFactory {
    config: Arc<ServerConfig>,
}

impl ServerSocketFactory {
    pub(crate) fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }

    /// 两个工厂是否来自同一次 `init`。
    pub fn shares_context_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.config, &other.config)
    }

    /// 绑定 TCP 监听地址。
    #[cfg(feature = "runtime-tokio")]
    pub async fn bind(
        &self,
        addr: impl ToSocketAddrs,
    ) -> Result<TlsServerSocket, TlsHandshakeError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TlsHandshakeError::Bind { source })?;
        Ok(TlsServerSocket {
            listener,
            acceptor: TlsAcceptor::from(Arc::clone(&self.config)),
        })
    }

    /// 在调用方提供的底层流上完成服务端握手。
    ///
    /// # 契约（What）
    /// - **前置条件**：`stream` 代表刚接受的入站连接，且尚未被读取；
    /// - **后置条件**：成功后调用方独占返回的 `TlsStream`。
    #[cfg(feature = "runtime-tokio")]
    pub async fn accept_stream<IO>(
        &self,
        stream: IO,
    ) -> Result<server::TlsStream<IO>, TlsHandshakeError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        TlsAcceptor::from(Arc::clone(&self.config))
            .accept(stream)
            .await
            .map_err(|source| TlsHandshakeError::Handshake { source })
    }
}

impl fmt::Debug for ServerSocketFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSocketFactory").finish_non_exhaustive()
    }
}

/// 已绑定的 TLS 监听套接字。
#[cfg(feature = "runtime-tokio")]
pub struct TlsServerSocket {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

#[cfg(feature = "runtime-tokio")]
impl TlsServerSocket {
    pub fn local_addr(&self) -> Result<SocketAddr, TlsHandshakeError> {
        self.listener
            .local_addr()
            .map_err(|source| TlsHandshakeError::Bind { source })
    }

    /// 接受一个 TCP 连接并完成 TLS 握手。
    ///
    /// TCP 层失败返回 `Accept`，握手失败返回 `Handshake`；两者都不影响监听器继续使用。
    pub async fn accept(
        &self,
    ) -> Result<(server::TlsStream<TcpStream>, SocketAddr), TlsHandshakeError> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|source| TlsHandshakeError::Accept { source })?;
        let tls = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|source| TlsHandshakeError::Handshake { source })?;
        debug!(%peer, "accepted TLS connection");
        Ok((tls, peer))
    }
}

#[cfg(feature = "runtime-tokio")]
impl fmt::Debug for TlsServerSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsServerSocket")
            .field("local_addr", &self.listener.local_addr().ok())
            .finish_non_exhaustive()
    }
}

/// CLIENT 模式的套接字工厂。
#[derive(Clone)]
pub struct ClientSocketFactory {
    config: Arc<ClientConfig>,
}

impl ClientSocketFactory {
    pub(crate) fn new(config: Arc<ClientConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }

    pub fn shares_context_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.config, &other.config)
    }

    /// 连接 `addr` 并以 `server_name` 完成握手与主机名校验。
    #[cfg(feature = "runtime-tokio")]
    pub async fn connect(
        &self,
        addr: impl ToSocketAddrs,
        server_name: &str,
    ) -> Result<client::TlsStream<TcpStream>, TlsHandshakeError> {
        let name = parse_server_name(server_name)?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TlsHandshakeError::Connect { source })?;
        self.handshake(stream, name).await
    }

    /// 在调用方提供的底层流上完成客户端握手。
    #[cfg(feature = "runtime-tokio")]
    pub async fn connect_stream<IO>(
        &self,
        stream: IO,
        server_name: &str,
    ) -> Result<client::TlsStream<IO>, TlsHandshakeError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let name = parse_server_name(server_name)?;
        self.handshake(stream, name).await
    }

    #[cfg(feature = "runtime-tokio")]
    async fn handshake<IO>(
        &self,
        stream: IO,
        name: ServerName<'static>,
    ) -> Result<client::TlsStream<IO>, TlsHandshakeError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let tls = TlsConnector::from(Arc::clone(&self.config))
            .connect(name.clone(), stream)
            .await
            .map_err(|source| TlsHandshakeError::Handshake { source })?;
        debug!(server_name = %name.to_str(), "TLS client handshake completed");
        Ok(tls)
    }
}

impl fmt::Debug for ClientSocketFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSocketFactory").finish_non_exhaustive()
    }
}

/// 解析对端主机名；接受带方括号的 IPv6 字面量。
pub(crate) fn parse_server_name(host: &str) -> Result<ServerName<'static>, TlsHandshakeError> {
    let trimmed = host.trim();
    let bare = trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(trimmed);
    ServerName::try_from(bare.to_owned()).map_err(|_| TlsHandshakeError::InvalidServerName {
        name: host.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_names_accept_dns_and_ip_literals() {
        assert!(parse_server_name("kdc.example.com").is_ok());
        assert!(parse_server_name("127.0.0.1").is_ok());
        assert!(parse_server_name("[::1]").is_ok());
        assert!(matches!(
            parse_server_name("bad host"),
            Err(TlsHandshakeError::InvalidServerName { .. })
        ));
        assert!(parse_server_name("").is_err());
    }

    #[test]
    fn tls_error_unwraps_handshake_failures() {
        let source = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer),
        );
        let err = TlsHandshakeError::Handshake { source };
        assert_eq!(
            err.tls_error(),
            Some(&rustls::Error::InvalidCertificate(
                rustls::CertificateError::UnknownIssuer
            ))
        );
        assert!(TlsHandshakeError::NotConfigured.tls_error().is_none());
    }
}
