use std::fmt::Display;

use thiserror::Error;

use crate::mode::Mode;

/// TLS 上下文工厂的错误域。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把“配置缺失”“证书材料损坏”“模式误用”“生命周期误用”拆成独立变体，调用方据此决定是修复配置后重试，
///   还是把错误当作编程缺陷直接上抛；
/// - 所有错误在触发它的那次调用中同步返回，不做静默降级。
///
/// ## 契约（What）
/// - `Configuration`：构造阶段的资源键缺失、资源不可读或取值非法，不会自动重试；
/// - `SecurityInit`：`init` 阶段的证书/私钥/协议失败，修复材料后可再次调用 `init`；
/// - `UnknownVerifier`：主机名校验策略名无法识别，从不回落到默认策略；
/// - `WrongMode` / `NotInitialized` / `Destroyed` / `AlreadyInitialized`：调用时序或模式错误；
/// - `InvalidPeerHost`：客户端引擎缺少或给出了非法的对端主机名。
///
/// ## 风险（Trade-offs）
/// - `detail` 使用 `String` 保存上下文，牺牲少量分配换取可读日志。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TlsFactoryError {
    /// 配置资源键缺失、资源无法读取或配置值非法。
    #[error("TLS configuration error: {detail}")]
    Configuration { detail: String },

    /// 证书、私钥、信任库或协议版本导致的初始化失败。
    #[error("TLS security initialization failed at `{stage}`: {detail}")]
    SecurityInit { stage: &'static str, detail: String },

    /// 主机名校验策略名不在注册表内。
    #[error("invalid hostname verifier: {name}")]
    UnknownVerifier { name: String },

    /// 操作与工厂固定的模式不符。
    #[error("`{operation}` is not available on a factory in {mode} mode")]
    WrongMode { operation: &'static str, mode: Mode },

    /// 在 `init` 成功之前调用了需要 TLS 上下文的操作。
    #[error("`{operation}` requires a successfully initialized factory")]
    NotInitialized { operation: &'static str },

    /// 工厂已经 `destroy`。
    #[error("`{operation}` invoked on a destroyed factory")]
    Destroyed { operation: &'static str },

    /// 重复调用 `init`。
    #[error("TLS context factory is already initialized")]
    AlreadyInitialized,

    /// 客户端引擎的对端主机名缺失或不是合法的 DNS 名称 / IP 地址。
    #[error("invalid peer host `{host}`")]
    InvalidPeerHost { host: String },
}

impl TlsFactoryError {
    pub(crate) fn configuration(detail: impl Into<String>) -> Self {
        Self::Configuration {
            detail: detail.into(),
        }
    }

    pub(crate) fn security_init(stage: &'static str, detail: impl Into<String>) -> Self {
        Self::SecurityInit {
            stage,
            detail: detail.into(),
        }
    }

    /// 生成 `map_err` 闭包，把底层错误文本挂到指定阶段上。
    pub(crate) fn at_stage<E: Display>(stage: &'static str) -> impl FnOnce(E) -> Self {
        move |err| Self::security_init(stage, err.to_string())
    }

    /// 错误是否属于调用方的编程缺陷（模式或生命周期误用）。
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::WrongMode { .. }
                | Self::NotInitialized { .. }
                | Self::Destroyed { .. }
                | Self::AlreadyInitialized
        )
    }
}
