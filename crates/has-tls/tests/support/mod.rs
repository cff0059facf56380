//! 集成测试共享的证书与配置夹具。
//!
//! - 每个 [`TestPki`] 在独立临时目录内生成一个 CA，并按需签发叶子证书；
//! - 配置资源以 TOML 写入同一目录，随 `TempDir` 一起清理。

#![allow(dead_code)]

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use has_tls::{
    MapConfig, Mode, SSL_CLIENT_CONF_KEY, SSL_ENABLED_PROTOCOLS_KEY, SSL_HOSTNAME_VERIFIER_KEY,
    SSL_REQUIRE_CLIENT_CERT_KEY, SSL_SERVER_CONF_KEY, TlsContextFactory,
};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair,
};
use tempfile::TempDir;

/// 叶子证书与私钥的文件位置。
#[derive(Clone, Debug)]
pub struct Identity {
    pub cert: PathBuf,
    pub key: PathBuf,
}

pub struct TestPki {
    dir: TempDir,
    name: String,
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_path: PathBuf,
}

impl TestPki {
    pub fn new(name: &str) -> Self {
        let dir = tempfile::tempdir().expect("创建临时目录");
        let ca_key = KeyPair::generate().expect("生成 CA 密钥");
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("CA 参数");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, format!("{name} Root CA"));
        let ca_cert = params.self_signed(&ca_key).expect("自签 CA");
        let ca_path = dir.path().join(format!("{name}-ca.pem"));
        fs::write(&ca_path, ca_cert.pem()).expect("写入 CA");
        Self {
            dir,
            name: name.to_owned(),
            ca_cert,
            ca_key,
            ca_path,
        }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn ca_path(&self) -> &Path {
        &self.ca_path
    }

    pub fn ca_pem(&self) -> String {
        self.ca_cert.pem()
    }

    /// 签发一张同时可用于服务端与客户端认证的叶子证书。
    pub fn issue(&self, label: &str, names: &[&str]) -> Identity {
        let key = KeyPair::generate().expect("生成叶子密钥");
        let owned: Vec<String> = names.iter().map(|name| (*name).to_owned()).collect();
        let mut params = CertificateParams::new(owned).expect("叶子参数");
        params
            .distinguished_name
            .push(DnType::CommonName, names.first().copied().unwrap_or(label));
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let cert = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .expect("CA 签发叶子证书");

        let cert_path = self.dir.path().join(format!("{}-{label}.pem", self.name));
        let key_path = self.dir.path().join(format!("{}-{label}.key", self.name));
        fs::write(&cert_path, cert.pem()).expect("写入叶子证书");
        fs::write(&key_path, key.serialize_pem()).expect("写入私钥");
        Identity {
            cert: cert_path,
            key: key_path,
        }
    }

    /// 在临时目录中写入一个 TOML 子配置资源。
    pub fn write_resource(&self, file: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(file);
        fs::write(&path, body).expect("写入子配置资源");
        path
    }
}

/// 生成模式子配置的 TOML 文本。
pub fn ssl_resource(
    mode: Mode,
    identity: Option<&Identity>,
    truststore: Option<&Path>,
    reload_interval_ms: Option<u64>,
) -> String {
    let mut body = format!("[ssl.{}]\n", mode.key_segment());
    if let Some(identity) = identity {
        body.push_str(&format!("keystore.location = {}\n", quoted(&identity.cert)));
        body.push_str(&format!("keystore.keyfile = {}\n", quoted(&identity.key)));
    }
    if let Some(truststore) = truststore {
        body.push_str(&format!("truststore.location = {}\n", quoted(truststore)));
    }
    if let Some(interval) = reload_interval_ms {
        body.push_str(&format!("truststore.reload.interval = {interval}\n"));
    }
    body
}

fn quoted(path: &Path) -> String {
    format!("{:?}", path.display().to_string())
}

/// 主配置构造器，默认只包含模式对应的资源键。
pub struct MainConfig {
    conf: MapConfig,
}

impl MainConfig {
    pub fn new(mode: Mode, resource: &Path) -> Self {
        let key = match mode {
            Mode::Client => SSL_CLIENT_CONF_KEY,
            Mode::Server => SSL_SERVER_CONF_KEY,
        };
        Self {
            conf: MapConfig::new().with(key, resource.display().to_string()),
        }
    }

    pub fn require_client_cert(mut self, required: bool) -> Self {
        self.conf.set_bool(SSL_REQUIRE_CLIENT_CERT_KEY, required);
        self
    }

    pub fn hostname_verifier(mut self, name: &str) -> Self {
        self.conf.set(SSL_HOSTNAME_VERIFIER_KEY, name);
        self
    }

    pub fn enabled_protocols(mut self, protocols: &str) -> Self {
        self.conf.set(SSL_ENABLED_PROTOCOLS_KEY, protocols);
        self
    }

    pub fn build(&self) -> MapConfig {
        self.conf.clone()
    }
}

/// 构造 SERVER 工厂（未初始化）。
pub fn server_factory(
    pki: &TestPki,
    identity: &Identity,
    truststore: Option<&Path>,
    require_client_cert: bool,
) -> TlsContextFactory {
    let resource = pki.write_resource(
        "ssl-server.toml",
        &ssl_resource(Mode::Server, Some(identity), truststore, None),
    );
    let conf = MainConfig::new(Mode::Server, &resource)
        .require_client_cert(require_client_cert)
        .build();
    TlsContextFactory::new(Mode::Server, &conf).expect("构造 SERVER 工厂")
}

/// 构造 CLIENT 工厂（未初始化），信任 `pki` 的 CA。
pub fn client_factory(
    pki: &TestPki,
    identity: Option<&Identity>,
    hostname_verifier: &str,
) -> TlsContextFactory {
    let resource = pki.write_resource(
        "ssl-client.toml",
        &ssl_resource(Mode::Client, identity, Some(pki.ca_path()), None),
    );
    let conf = MainConfig::new(Mode::Client, &resource)
        .hostname_verifier(hostname_verifier)
        .build();
    TlsContextFactory::new(Mode::Client, &conf).expect("构造 CLIENT 工厂")
}

/// 覆盖文件内容并把修改时间推到未来，确保信任库能识别变化。
pub fn rewrite_with_new_mtime(path: &Path, contents: &str, ahead: Duration) {
    fs::write(path, contents).expect("覆盖文件");
    File::options()
        .write(true)
        .open(path)
        .and_then(|file| file.set_modified(SystemTime::now() + ahead))
        .expect("调整修改时间");
}
