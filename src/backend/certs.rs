// ============================================================================
// CERTS.RS - BROKER CERTIFICATE PROVIDER
// Self-signed CA plus a server certificate, generated once per directory
// ============================================================================

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::EnvironmentError;

const CA_KEY: &str = "ca.key";
const CA_CERT: &str = "ca.crt";
const SERVER_KEY: &str = "server.key";
const SERVER_CERT: &str = "server.crt";
const SERVER_DNS_NAME: &str = "broker.local";

/// Paths of the generated artifacts the broker and clients use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateSet {
    pub ca_cert: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
}

/// Owns the certificate directory
#[derive(Debug, Clone)]
pub struct CertificateProvider {
    dir: PathBuf,
}

impl CertificateProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn paths(&self) -> [PathBuf; 4] {
        [
            self.dir.join(CA_KEY),
            self.dir.join(CA_CERT),
            self.dir.join(SERVER_KEY),
            self.dir.join(SERVER_CERT),
        ]
    }

    fn set(&self) -> CertificateSet {
        CertificateSet {
            ca_cert: self.dir.join(CA_CERT),
            server_cert: self.dir.join(SERVER_CERT),
            server_key: self.dir.join(SERVER_KEY),
        }
    }

    /// Generate certificates unless all four files already exist.
    ///
    /// `lan_ip` is added to the server certificate's alternative names next
    /// to loopback and the wildcard bind address.
    pub fn ensure(&self, force_regenerate: bool, lan_ip: IpAddr) -> Result<CertificateSet, EnvironmentError> {
        if !force_regenerate && self.paths().iter().all(|p| p.exists()) {
            debug!("Certificates already exist in {}, skipping generation", self.dir.display());
            return Ok(self.set());
        }

        info!("Generating TLS certificates in {}", self.dir.display());
        std::fs::create_dir_all(&self.dir).map_err(|e| cert_error("create certificate directory", e))?;

        let ca_key = KeyPair::generate().map_err(|e| cert_error("generate CA key", e))?;
        let mut ca_params = CertificateParams::default();
        ca_params.distinguished_name = common_name("Local-CA");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        set_validity(&mut ca_params);
        let ca_cert = ca_params
            .self_signed(&ca_key)
            .map_err(|e| cert_error("sign CA certificate", e))?;

        let server_key = KeyPair::generate().map_err(|e| cert_error("generate server key", e))?;
        let mut server_params = CertificateParams::new(vec![SERVER_DNS_NAME.to_string()])
            .map_err(|e| cert_error("build server certificate", e))?;
        server_params.distinguished_name = common_name(SERVER_DNS_NAME);
        server_params.is_ca = IsCa::ExplicitNoCa;
        for ip in san_addresses(lan_ip) {
            server_params.subject_alt_names.push(SanType::IpAddress(ip));
        }
        server_params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        set_validity(&mut server_params);
        let server_cert = server_params
            .signed_by(&server_key, &ca_cert, &ca_key)
            .map_err(|e| cert_error("sign server certificate", e))?;

        let [ca_key_path, ca_cert_path, server_key_path, server_cert_path] = self.paths();
        write(&ca_key_path, &ca_key.serialize_pem())?;
        write(&ca_cert_path, &ca_cert.pem())?;
        write(&server_key_path, &server_key.serialize_pem())?;
        write(&server_cert_path, &server_cert.pem())?;

        info!("Generated certificates in {}", self.dir.display());
        Ok(self.set())
    }
}

/// Loopback, wildcard bind and the LAN address, without duplicates
fn san_addresses(lan_ip: IpAddr) -> Vec<IpAddr> {
    let mut ips = vec![IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V4(Ipv4Addr::UNSPECIFIED)];
    if !ips.contains(&lan_ip) {
        ips.push(lan_ip);
    }
    ips
}

fn common_name(name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, name);
    dn
}

fn set_validity(params: &mut CertificateParams) {
    let now = chrono::Utc::now();
    let (year, month, day) = (
        chrono::Datelike::year(&now),
        chrono::Datelike::month(&now) as u8,
        chrono::Datelike::day(&now).min(28) as u8,
    );
    params.not_before = rcgen::date_time_ymd(year - 1, month, day);
    params.not_after = rcgen::date_time_ymd(year + 10, month, day);
}

fn write(path: &Path, pem: &str) -> Result<(), EnvironmentError> {
    std::fs::write(path, pem).map_err(|e| cert_error(&format!("write {}", path.display()), e))
}

fn cert_error(action: &str, err: impl std::fmt::Display) -> EnvironmentError {
    EnvironmentError::Certificate(format!("could not {}: {}", action, err))
}
