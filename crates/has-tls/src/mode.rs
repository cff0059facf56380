use std::{fmt, str::FromStr};

use crate::error::TlsFactoryError;

/// 工厂产出的是客户端还是服务端 TLS 原语。
///
/// 构造时固定，之后不可变；它决定读取哪一组配置键，也决定哪些操作可用。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    Client,
    Server,
}

impl Mode {
    /// 稳定的大写名称，用于日志与错误文案。
    #[inline]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Client => "CLIENT",
            Self::Server => "SERVER",
        }
    }

    /// 信任材料配置键中的模式段，例如 `ssl.server.keystore.location` 中的 `server`。
    #[inline]
    pub const fn key_segment(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }

    #[inline]
    pub const fn is_client(self) -> bool {
        matches!(self, Self::Client)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = TlsFactoryError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(TlsFactoryError::configuration("mode cannot be empty"));
        }
        if trimmed.eq_ignore_ascii_case("client") {
            Ok(Self::Client)
        } else if trimmed.eq_ignore_ascii_case("server") {
            Ok(Self::Server)
        } else {
            Err(TlsFactoryError::configuration(format!(
                "unknown TLS factory mode `{trimmed}`"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!(" Client ".parse::<Mode>(), Ok(Mode::Client));
        assert_eq!("SERVER".parse::<Mode>(), Ok(Mode::Server));
    }

    #[test]
    fn rejects_empty_and_unknown_modes() {
        assert!(matches!(
            "  ".parse::<Mode>(),
            Err(TlsFactoryError::Configuration { .. })
        ));
        assert!(matches!(
            "proxy".parse::<Mode>(),
            Err(TlsFactoryError::Configuration { .. })
        ));
    }

    #[test]
    fn key_segment_is_lowercase() {
        assert_eq!(Mode::Client.key_segment(), "client");
        assert_eq!(Mode::Server.to_string(), "SERVER");
    }
}
