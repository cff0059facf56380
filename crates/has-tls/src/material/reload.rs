use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant, SystemTime},
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rustls::RootCertStore;
use rustls_pki_types::{CertificateDer, pem::PemObject};
use tracing::{debug, info, warn};

use super::TrustManager;
use crate::error::TlsFactoryError;

/// 文件变化的判定依据：修改时间与长度。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    len: u64,
}

#[derive(Debug)]
struct ReloadState {
    last_check: Instant,
    stamp: FileStamp,
}

/// 按需刷新的 PEM 信任库。
///
/// # 设计动机（Why）
/// - 证书轮换时只替换 CA 文件，已运行的工厂在下一次对端校验时就能看到新根证书，无需重建上下文；
/// - 读路径用 `ArcSwap` 做 RCU 式快照，旧握手继续持有旧 `Arc<RootCertStore>`，新握手读取最新值。
///
/// # 核心契约（What）
/// - [`TrustManager::roots`] 先检查是否需要刷新，再返回当前快照；
/// - 两次文件检查之间至少间隔 `interval`；间隔为零时每次都检查；
/// - 文件变化后重新加载失败时保留旧根证书并记录告警，下个间隔再试；
/// - [`ReloadingTrustStore::close`] 之后不再访问文件系统，快照保持最后一次成功加载的内容。
///
/// # 风险提示（Trade-offs & Gotchas）
/// - 检查发生在握手校验路径上，一次 `stat` 的开销落在触发检查的那次握手；
/// - 判定依据是修改时间与长度，同一时间戳内写入同长度内容不会被识别。
pub struct ReloadingTrustStore {
    path: PathBuf,
    interval: Duration,
    current: ArcSwap<RootCertStore>,
    state: Mutex<ReloadState>,
    closed: AtomicBool,
}

impl ReloadingTrustStore {
    /// 立即加载一次信任库；文件不可读或不含可用证书时返回 `SecurityInit`。
    pub fn open(path: impl Into<PathBuf>, interval: Duration) -> Result<Self, TlsFactoryError> {
        let path = path.into();
        let stamp = file_stamp(&path).map_err(|err| {
            TlsFactoryError::security_init(
                "truststore",
                format!("cannot stat `{}`: {err}", path.display()),
            )
        })?;
        let roots = load_roots(&path)?;
        info!(
            truststore = %path.display(),
            anchors = roots.len(),
            reload_interval_ms = interval.as_millis() as u64,
            "trust store loaded"
        );
        Ok(Self {
            path,
            interval,
            current: ArcSwap::from_pointee(roots),
            state: Mutex::new(ReloadState {
                last_check: Instant::now(),
                stamp,
            }),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reload_interval(&self) -> Duration {
        self.interval
    }

    /// 当前快照，不触发检查。
    #[inline]
    pub fn snapshot(&self) -> Arc<RootCertStore> {
        self.current.load_full()
    }

    /// 若间隔已到且文件发生变化，则重新加载；返回是否替换了快照。
    pub fn check_for_update(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut state = self.state.lock();
        if state.last_check.elapsed() < self.interval {
            return false;
        }
        state.last_check = Instant::now();

        let stamp = match file_stamp(&self.path) {
            Ok(stamp) => stamp,
            Err(err) => {
                warn!(
                    truststore = %self.path.display(),
                    error = %err,
                    "cannot stat trust store, keeping previous roots"
                );
                return false;
            }
        };
        if stamp == state.stamp {
            return false;
        }
        match load_roots(&self.path) {
            Ok(roots) => {
                let anchors = roots.len();
                self.current.store(Arc::new(roots));
                state.stamp = stamp;
                info!(truststore = %self.path.display(), anchors, "trust store reloaded");
                true
            }
            Err(err) => {
                warn!(
                    truststore = %self.path.display(),
                    error = %err,
                    "trust store reload failed, keeping previous roots"
                );
                false
            }
        }
    }

    /// 停止后续刷新。
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(truststore = %self.path.display(), "trust store closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl TrustManager for ReloadingTrustStore {
    fn roots(&self) -> Arc<RootCertStore> {
        self.check_for_update();
        self.current.load_full()
    }
}

impl fmt::Debug for ReloadingTrustStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReloadingTrustStore")
            .field("path", &self.path)
            .field("interval", &self.interval)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn file_stamp(path: &Path) -> std::io::Result<FileStamp> {
    let metadata = fs::metadata(path)?;
    Ok(FileStamp {
        modified: metadata.modified()?,
        len: metadata.len(),
    })
}

/// 读取 PEM 文件中的全部证书；文件中没有证书时报错。
pub(crate) fn load_certificates(
    path: &Path,
    stage: &'static str,
) -> Result<Vec<CertificateDer<'static>>, TlsFactoryError> {
    let certs = CertificateDer::pem_file_iter(path)
        .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
        .map_err(|err| {
            TlsFactoryError::security_init(stage, format!("`{}`: {err}", path.display()))
        })?;
    if certs.is_empty() {
        return Err(TlsFactoryError::security_init(
            stage,
            format!("`{}` contains no certificate", path.display()),
        ));
    }
    Ok(certs)
}

fn load_roots(path: &Path) -> Result<RootCertStore, TlsFactoryError> {
    let certs = load_certificates(path, "truststore")?;
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
        warn!(truststore = %path.display(), ignored, "skipped unparsable trust anchors");
    }
    if added == 0 {
        return Err(TlsFactoryError::security_init(
            "truststore",
            format!("`{}` contains no usable trust anchor", path.display()),
        ));
    }
    Ok(roots)
}
