use std::sync::{Arc, LazyLock};

use rustls::{SupportedProtocolVersion, crypto::CryptoProvider, version};

use crate::error::TlsFactoryError;

/// 构造 TLS 上下文时使用的协议族名称；具体版本由 `enabled.protocols` 约束。
pub const CONTEXT_PROTOCOL: &str = "TLS";

/// 协议令牌解析出的最低版本。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Floor {
    Tls12,
    Tls13,
}

/// 把 `enabled.protocols` 令牌解析为 rustls 可协商的版本集合。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 配置中的令牌表达的是“最低可接受版本”，而 rustls 只实现 TLS 1.2 与 1.3；
///   `TLSv1`、`TLSv1.1` 因此被抬升到 rustls 能提供的最低版本，而不是被拒绝。
///
/// ## 契约（What）
/// - `TLSv1` / `TLSv1.1` / `TLSv1.2` → TLS 1.3 + TLS 1.2；`TLSv1.3` → 仅 TLS 1.3；
/// - 多个令牌取最低者；令牌比较不区分大小写；
/// - 空列表或未知令牌返回 [`TlsFactoryError::SecurityInit`]。
pub(crate) fn resolve_versions(
    tokens: &[String],
) -> Result<Vec<&'static SupportedProtocolVersion>, TlsFactoryError> {
    let mut floor: Option<Floor> = None;
    for token in tokens {
        let parsed = parse_token(token.trim()).ok_or_else(|| {
            TlsFactoryError::security_init(
                "protocol",
                format!("unsupported TLS protocol `{token}`"),
            )
        })?;
        floor = Some(floor.map_or(parsed, |current| current.min(parsed)));
    }
    match floor {
        Some(Floor::Tls12) => Ok(vec![&version::TLS13, &version::TLS12]),
        Some(Floor::Tls13) => Ok(vec![&version::TLS13]),
        None => Err(TlsFactoryError::security_init(
            "protocol",
            "no enabled TLS protocol configured",
        )),
    }
}

fn parse_token(token: &str) -> Option<Floor> {
    const LEGACY: [&str; 3] = ["TLSv1", "TLSv1.1", "TLSv1.2"];
    if LEGACY.iter().any(|known| known.eq_ignore_ascii_case(token)) {
        Some(Floor::Tls12)
    } else if token.eq_ignore_ascii_case("TLSv1.3") {
        Some(Floor::Tls13)
    } else {
        None
    }
}

/// 进程内共享的 ring 加密提供者；随机数来源使用其默认实现。
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    static PROVIDER: LazyLock<Arc<CryptoProvider>> =
        LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));
    Arc::clone(&PROVIDER)
}

#[cfg(test)]
mod tests {
    use rustls::ProtocolVersion;

    use super::*;

    fn negotiable(tokens: &[&str]) -> Result<Vec<ProtocolVersion>, TlsFactoryError> {
        let owned: Vec<String> = tokens.iter().map(|t| (*t).to_owned()).collect();
        resolve_versions(&owned).map(|versions| versions.iter().map(|v| v.version).collect())
    }

    #[test]
    fn legacy_minimum_enables_tls12_and_tls13() {
        assert_eq!(
            negotiable(&["TLSv1"]),
            Ok(vec![ProtocolVersion::TLSv1_3, ProtocolVersion::TLSv1_2])
        );
        assert_eq!(
            negotiable(&["tlsv1.2"]),
            Ok(vec![ProtocolVersion::TLSv1_3, ProtocolVersion::TLSv1_2])
        );
    }

    #[test]
    fn tls13_floor_excludes_tls12() {
        assert_eq!(negotiable(&["TLSv1.3"]), Ok(vec![ProtocolVersion::TLSv1_3]));
    }

    #[test]
    fn lowest_token_wins() {
        assert_eq!(
            negotiable(&["TLSv1.3", "TLSv1.2"]),
            Ok(vec![ProtocolVersion::TLSv1_3, ProtocolVersion::TLSv1_2])
        );
    }

    #[test]
    fn unknown_or_empty_tokens_fail() {
        assert!(matches!(
            negotiable(&["SSLv3"]),
            Err(TlsFactoryError::SecurityInit { stage: "protocol", .. })
        ));
        assert!(negotiable(&[]).is_err());
    }
}
