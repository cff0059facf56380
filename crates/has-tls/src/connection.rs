//! 出站连接模型：`configure` 的输入与输出。
//!
//! 连接在这里只是“准备发起”的描述，不持有套接字；安全连接经过工厂 `configure` 后才带上
//! 客户端套接字工厂与主机名策略，此时才能 [`SecureConnection::connect`]。

use std::fmt;

use crate::{error::TlsFactoryError, socket::ClientSocketFactory, verifier::HostnameVerifier};

#[cfg(feature = "runtime-tokio")]
use {
    crate::socket::TlsHandshakeError,
    tokio::net::TcpStream,
    tokio_rustls::client::TlsStream,
};

const HTTP_PORT: u16 = 80;
const HTTPS_PORT: u16 = 443;

/// 明文连接，`configure` 原样返回。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlainConnection {
    host: String,
    port: u16,
    path: String,
}

impl PlainConnection {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            path: "/".to_owned(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// 安全连接。
///
/// # 契约（What）
/// - 新建时未附加任何 TLS 设施，[`SecureConnection::is_configured`] 为 `false`；
/// - 经 CLIENT 工厂 `configure` 后同时持有套接字工厂与主机名策略。
#[derive(Clone)]
pub struct SecureConnection {
    host: String,
    port: u16,
    path: String,
    socket_factory: Option<ClientSocketFactory>,
    hostname_verifier: Option<HostnameVerifier>,
}

impl SecureConnection {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            path: "/".to_owned(),
            socket_factory: None,
            hostname_verifier: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn socket_factory(&self) -> Option<&ClientSocketFactory> {
        self.socket_factory.as_ref()
    }

    pub fn hostname_verifier(&self) -> Option<HostnameVerifier> {
        self.hostname_verifier
    }

    pub fn is_configured(&self) -> bool {
        self.socket_factory.is_some() && self.hostname_verifier.is_some()
    }

    pub(crate) fn attach(&mut self, factory: ClientSocketFactory, verifier: HostnameVerifier) {
        self.socket_factory = Some(factory);
        self.hostname_verifier = Some(verifier);
    }

    /// 建立 TCP 连接并完成 TLS 握手，主机名校验使用附加的策略。
    #[cfg(feature = "runtime-tokio")]
    pub async fn connect(&self) -> Result<TlsStream<TcpStream>, TlsHandshakeError> {
        let factory = self
            .socket_factory
            .as_ref()
            .ok_or(TlsHandshakeError::NotConfigured)?;
        let host = self.host.as_str();
        let dial = host
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(host);
        factory.connect((dial, self.port), host).await
    }
}

impl fmt::Debug for SecureConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("configured", &self.is_configured())
            .field("hostname_verifier", &self.hostname_verifier)
            .finish()
    }
}

/// 出站连接：明文或安全。
#[derive(Clone, Debug)]
pub enum OutboundConnection {
    Plain(PlainConnection),
    Secure(SecureConnection),
}

impl OutboundConnection {
    /// 从 `http://` 或 `https://` 地址构造连接描述，不发起任何网络访问。
    ///
    /// # 契约（What）
    /// - 端口缺省时按协议取 80 / 443；IPv6 主机需写成 `[::1]`；
    /// - 协议、主机或端口非法时返回 `Configuration`。
    pub fn open(url: &str) -> Result<Self, TlsFactoryError> {
        let invalid =
            |reason: &str| TlsFactoryError::configuration(format!("invalid URL `{url}`: {reason}"));

        let (scheme, rest) = url
            .trim()
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;
        let secure = match scheme.to_ascii_lowercase().as_str() {
            "https" => true,
            "http" => false,
            _ => return Err(invalid("unsupported scheme")),
        };
        let (authority, path) = match rest.find('/') {
            Some(index) => (&rest[..index], &rest[index..]),
            None => (rest, "/"),
        };
        let (host, port) = split_authority(authority).ok_or_else(|| invalid("bad authority"))?;
        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let port = match port {
            Some(text) => text.parse::<u16>().map_err(|_| invalid("bad port"))?,
            None if secure => HTTPS_PORT,
            None => HTTP_PORT,
        };

        Ok(if secure {
            let mut connection = SecureConnection::new(host, port);
            connection.path = path.to_owned();
            Self::Secure(connection)
        } else {
            let mut connection = PlainConnection::new(host, port);
            connection.path = path.to_owned();
            Self::Plain(connection)
        })
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Self::Secure(_))
    }

    pub fn host(&self) -> &str {
        match self {
            Self::Plain(plain) => plain.host(),
            Self::Secure(secure) => secure.host(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Plain(plain) => plain.port(),
            Self::Secure(secure) => secure.port(),
        }
    }

    pub fn as_secure(&self) -> Option<&SecureConnection> {
        match self {
            Self::Secure(secure) => Some(secure),
            Self::Plain(_) => None,
        }
    }
}

fn split_authority(authority: &str) -> Option<(&str, Option<&str>)> {
    if authority.starts_with('[') {
        let close = authority.find(']')?;
        let host = &authority[..=close];
        return match &authority[close + 1..] {
            "" => Some((host, None)),
            tail => tail.strip_prefix(':').map(|port| (host, Some(port))),
        };
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host, Some(port))),
        None => Some((authority, None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_urls_become_unconfigured_secure_connections() {
        let connection = OutboundConnection::open("https://kdc.example.com:8443/has/v1/conf")
            .expect("解析 https 地址");
        let secure = connection.as_secure().expect("应为安全连接");
        assert_eq!(secure.host(), "kdc.example.com");
        assert_eq!(secure.port(), 8443);
        assert_eq!(secure.path(), "/has/v1/conf");
        assert!(!secure.is_configured());
    }

    #[test]
    fn default_ports_follow_scheme() {
        let plain = OutboundConnection::open("http://kdc.example.com").expect("解析 http 地址");
        assert!(!plain.is_secure());
        assert_eq!(plain.port(), 80);

        let secure = OutboundConnection::open("HTTPS://kdc.example.com/").expect("大小写不敏感");
        assert_eq!(secure.port(), 443);
    }

    #[test]
    fn bracketed_ipv6_hosts_are_kept() {
        let connection = OutboundConnection::open("https://[::1]:9443").expect("解析 IPv6");
        assert_eq!(connection.host(), "[::1]");
        assert_eq!(connection.port(), 9443);
    }

    #[test]
    fn malformed_urls_are_configuration_errors() {
        for url in ["kdc.example.com", "ftp://kdc", "https://:443", "https://kdc:http"] {
            assert!(
                matches!(
                    OutboundConnection::open(url),
                    Err(TlsFactoryError::Configuration { .. })
                ),
                "{url} 应被拒绝"
            );
        }
    }
}
