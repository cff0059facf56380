//! 主机名校验策略注册表。
//!
//! # 教案式说明
//! - **意图（Why）**：把配置中的符号名（`DEFAULT`、`STRICT` …）解析为具体的匹配行为，
//!   工厂在 `init` 时只做一次解析，之后的握手直接使用解析结果；
//! - **逻辑（How）**：策略本身是无状态的枚举，匹配函数对主机名与证书名称做纯字符串比较，
//!   证书名称的提取由 `cert_verifier` 模块负责；
//! - **契约（What）**：名称比较先去空白再转大写，不接受前缀或部分匹配；未知名称返回
//!   [`TlsFactoryError::UnknownVerifier`]。

use std::{fmt, net::IpAddr, str::FromStr};

use crate::error::TlsFactoryError;

/// 两字母国家顶级域下不允许被通配的二级域，例如 `*.co.uk`。
const BAD_COUNTRY_2LDS: [&str; 14] = [
    "ac", "co", "com", "ed", "edu", "go", "gouv", "gov", "info", "lg", "ne", "net", "or", "org",
];

const LOCALHOSTS: [&str; 2] = ["localhost", "localhost.localdomain"];

/// 对端证书上可用于主机名匹配的名称。
///
/// SAN（DNS / IP）存在时只使用 SAN，否则回落到主题 CN。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerNames {
    pub common_names: Vec<String>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
}

impl PeerNames {
    pub fn with_common_name(mut self, name: impl Into<String>) -> Self {
        self.common_names.push(name.into());
        self
    }

    pub fn with_dns_name(mut self, name: impl Into<String>) -> Self {
        self.dns_names.push(name.into());
        self
    }

    pub fn with_ip_address(mut self, ip: IpAddr) -> Self {
        self.ip_addresses.push(ip);
        self
    }

    fn has_subject_alts(&self) -> bool {
        !self.dns_names.is_empty() || !self.ip_addresses.is_empty()
    }
}

/// 通配符覆盖范围。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WildcardRule {
    /// `*.foo.com` 覆盖 `foo.com` 之下任意深度。
    AnyDepth,
    /// `*.foo.com` 只覆盖一级子域。
    SingleLabel,
    /// 一级子域，同时接受 `www*.foo.com` 这类部分标签通配。
    SingleLabelLegacy,
}

/// 已解析的主机名校验策略。
///
/// | 名称 | 行为 |
/// |---|---|
/// | `DEFAULT` | RFC 2818 匹配，通配符可覆盖多级子域 |
/// | `DEFAULT_AND_LOCALHOST` | 同 `DEFAULT`，回环地址与 localhost 始终通过 |
/// | `STRICT` | 同 `DEFAULT`，但通配符只覆盖一级标签 |
/// | `STRICT_IE6` | 同 `STRICT`，保留部分标签通配的兼容行为 |
/// | `ALLOW_ALL` | 接受任意主机名，仅用于测试环境 |
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HostnameVerifier {
    Default,
    DefaultAndLocalhost,
    Strict,
    StrictIe6,
    AllowAll,
}

impl HostnameVerifier {
    pub const ALL: [Self; 5] = [
        Self::Default,
        Self::DefaultAndLocalhost,
        Self::Strict,
        Self::StrictIe6,
        Self::AllowAll,
    ];

    /// 注册表中的规范名称。
    pub const fn name(self) -> &'static str {
        match self {
            Self::Default => "DEFAULT",
            Self::DefaultAndLocalhost => "DEFAULT_AND_LOCALHOST",
            Self::Strict => "STRICT",
            Self::StrictIe6 => "STRICT_IE6",
            Self::AllowAll => "ALLOW_ALL",
        }
    }

    /// 按名称解析策略。
    ///
    /// # 契约（What）
    /// - 先 `trim` 再转大写后做精确比较；
    /// - 失败时错误中携带调用方传入的原始字符串。
    pub fn resolve(name: &str) -> Result<Self, TlsFactoryError> {
        let normalized = name.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|verifier| verifier.name() == normalized)
            .ok_or_else(|| TlsFactoryError::UnknownVerifier {
                name: name.to_owned(),
            })
    }

    /// 策略是否完全跳过主机名校验。
    pub const fn is_insecure(self) -> bool {
        matches!(self, Self::AllowAll)
    }

    /// 判断对端证书名称是否覆盖目标主机。
    pub fn verify(self, host: &str, peer: &PeerNames) -> bool {
        let host = normalize(host);
        match self {
            Self::AllowAll => true,
            Self::DefaultAndLocalhost if is_localhost(&host) => true,
            Self::Default | Self::DefaultAndLocalhost => {
                matches_peer(&host, peer, WildcardRule::AnyDepth)
            }
            Self::Strict => matches_peer(&host, peer, WildcardRule::SingleLabel),
            Self::StrictIe6 => matches_peer(&host, peer, WildcardRule::SingleLabelLegacy),
        }
    }
}

impl fmt::Display for HostnameVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HostnameVerifier {
    type Err = TlsFactoryError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::resolve(name)
    }
}

fn normalize(name: &str) -> String {
    let trimmed = name.trim();
    let unbracketed = trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(trimmed);
    unbracketed.trim_end_matches('.').to_ascii_lowercase()
}

fn is_localhost(host: &str) -> bool {
    LOCALHOSTS.contains(&host) || host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

fn matches_peer(host: &str, peer: &PeerNames, rule: WildcardRule) -> bool {
    if let Ok(ip) = host.parse::<IpAddr>() {
        // IP 目标只做精确比较，从不参与通配。
        return if peer.has_subject_alts() {
            peer.ip_addresses.contains(&ip)
        } else {
            peer.common_names
                .iter()
                .any(|cn| cn.trim().parse::<IpAddr>() == Ok(ip))
        };
    }
    let names = if peer.has_subject_alts() {
        &peer.dns_names
    } else {
        &peer.common_names
    };
    names
        .iter()
        .any(|name| matches_name(host, &normalize(name), rule))
}

fn matches_name(host: &str, pattern: &str, rule: WildcardRule) -> bool {
    if host.is_empty() {
        return false;
    }
    if !pattern.contains('*') {
        return host == pattern;
    }
    if !acceptable_wildcard(pattern) {
        return false;
    }
    let Some((first, suffix)) = pattern.split_once('.') else {
        return false;
    };
    let Some((host_first, host_suffix)) = host.split_once('.') else {
        return false;
    };
    match rule {
        WildcardRule::AnyDepth => {
            first == "*"
                && !host_first.is_empty()
                && host
                    .strip_suffix(suffix)
                    .is_some_and(|head| head.len() > 1 && head.ends_with('.'))
        }
        WildcardRule::SingleLabel => {
            first == "*" && !host_first.is_empty() && host_suffix == suffix
        }
        WildcardRule::SingleLabelLegacy => {
            host_suffix == suffix && label_matches(first, host_first)
        }
    }
}

/// 通配模式必须至少含两个点、只在最左标签出现一次 `*`，且不能覆盖 `co.uk` 一类国家二级域。
fn acceptable_wildcard(pattern: &str) -> bool {
    let labels: Vec<&str> = pattern.split('.').collect();
    if labels.len() < 3 || labels.iter().any(|label| label.is_empty()) {
        return false;
    }
    if labels[0].matches('*').count() != 1 || labels[1..].iter().any(|label| label.contains('*')) {
        return false;
    }
    let country_tld = labels[labels.len() - 1].len() == 2;
    !(labels.len() == 3 && country_tld && BAD_COUNTRY_2LDS.contains(&labels[1]))
}

fn label_matches(pattern: &str, label: &str) -> bool {
    let Some((prefix, suffix)) = pattern.split_once('*') else {
        return pattern == label;
    };
    !label.is_empty()
        && label.len() >= prefix.len() + suffix.len()
        && label.starts_with(prefix)
        && label.ends_with(suffix)
}
