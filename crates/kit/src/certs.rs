//! TLS certificate set generation
//!
//! Produces the material for the generated-certificates TLS path: a
//! fresh certificate authority, a server certificate bound to the VM's
//! IP set, and a client certificate for the monitor, all PEM-encoded.
//! Generation is a pure function of the IP set; nothing touches the
//! hypervisor.

use std::net::Ipv4Addr;
use std::time::{Duration, SystemTime};

use color_eyre::eyre::{Context, Result};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair,
};

const CA_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);
const LEAF_VALIDITY: Duration = Duration::from_secs(2 * 365 * 24 * 60 * 60);

/// The generated trust material. The CA key is deliberately not kept:
/// once the leaves are issued nothing should be able to mint more.
#[derive(Debug, Clone)]
pub struct CertificateSet {
    pub ca_cert_pem: String,
    pub server_cert_pem: String,
    pub server_key_pem: String,
    pub client_cert_pem: String,
    pub client_key_pem: String,
}

fn base_params(common_name: &str, sans: Vec<String>) -> Result<CertificateParams> {
    let mut params =
        CertificateParams::new(sans).context("Building certificate parameters")?;
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    let not_before = SystemTime::now();
    params.not_before = not_before.into();
    params.not_after = (not_before + LEAF_VALIDITY).into();
    Ok(params)
}

fn generate_ca(common_name: &str) -> Result<(Certificate, KeyPair)> {
    let mut params = base_params(common_name, Vec::new())?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.not_after = (SystemTime::now() + CA_VALIDITY).into();
    let key = KeyPair::generate().context("Generating CA key pair")?;
    let cert = params
        .self_signed(&key)
        .context("Self-signing CA certificate")?;
    Ok((cert, key))
}

/// Subject alternative names for the server certificate: every address
/// in the VM's IP set. The caller is responsible for having included
/// the loopback address in the set.
fn san_strings(ips: &[Ipv4Addr]) -> Vec<String> {
    ips.iter().map(|ip| ip.to_string()).collect()
}

/// Generate a complete certificate set scoped to the given IP set.
///
/// `label` ties the certificate subjects to the VM for operator
/// recognition; it carries no trust semantics.
pub fn generate(label: &str, ips: &[Ipv4Addr]) -> Result<CertificateSet> {
    let (ca_cert, ca_key) = generate_ca(&format!("cvk CA ({label})"))?;

    let mut server_params = base_params(&format!("cvk server ({label})"), san_strings(ips))?;
    server_params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ServerAuth);
    let server_key = KeyPair::generate().context("Generating server key pair")?;
    let server_cert = server_params
        .signed_by(&server_key, &ca_cert, &ca_key)
        .context("Issuing server certificate")?;

    let mut client_params = base_params(&format!("cvk client ({label})"), Vec::new())?;
    client_params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ClientAuth);
    let client_key = KeyPair::generate().context("Generating client key pair")?;
    let client_cert = client_params
        .signed_by(&client_key, &ca_cert, &ca_key)
        .context("Issuing client certificate")?;

    Ok(CertificateSet {
        ca_cert_pem: ca_cert.pem(),
        server_cert_pem: server_cert.pem(),
        server_key_pem: server_key.serialize_pem(),
        client_cert_pem: client_cert.pem(),
        client_key_pem: client_key.serialize_pem(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_san_strings() {
        let ips: Vec<Ipv4Addr> = vec!["10.0.0.1".parse().unwrap(), "127.0.0.1".parse().unwrap()];
        assert_eq!(san_strings(&ips), vec!["10.0.0.1", "127.0.0.1"]);
    }

    #[test]
    fn test_generate_produces_pem_material() {
        let ips: Vec<Ipv4Addr> = vec!["192.168.1.5".parse().unwrap()];
        let set = generate("test-vm", &ips).unwrap();
        for pem in [&set.ca_cert_pem, &set.server_cert_pem, &set.client_cert_pem] {
            assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
        }
        for key in [&set.server_key_pem, &set.client_key_pem] {
            assert!(key.contains("PRIVATE KEY"));
        }
        // Server and client material must be distinct certificates.
        assert_ne!(set.server_cert_pem, set.client_cert_pem);
        assert_ne!(set.server_key_pem, set.client_key_pem);
    }
}
