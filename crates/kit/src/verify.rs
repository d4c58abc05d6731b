//! Post-install verification probe and failure diagnostics
//!
//! Once trust is established the workflow confirms monitoring will
//! actually succeed by asking the guest's container runtime for its
//! version through the just-installed channel: `docker version` over
//! SSH, or the runtime's TLS endpoint via `curl` with the stored
//! client material. On failure, [`diagnose`] turns the VM's
//! connectivity state into a human-readable cause.

use std::net::Ipv4Addr;
use std::process::Command;

use color_eyre::eyre::{eyre, Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::command_run::CommandRun;
use crate::sshkey;
use crate::xapi::{ControlPlane, VmUuid};

/// TLS port of the container runtime's remote API.
pub const TLS_PORT: u16 = 2376;

/// Per-VM secret names for the stored TLS client material. Written by
/// the credential installer, read by the probe and the monitor.
pub fn secret_name_client_cert(vm: &VmUuid) -> String {
    format!("cvk-tls-client-cert-{vm}")
}

pub fn secret_name_client_key(vm: &VmUuid) -> String {
    format!("cvk-tls-client-key-{vm}")
}

pub fn secret_name_ca_cert(vm: &VmUuid) -> String {
    format!("cvk-tls-ca-cert-{vm}")
}

/// The slice of the runtime's version reply we care about; anything
/// parseable here proves the channel end to end.
#[derive(Debug, Deserialize)]
pub struct RuntimeVersion {
    #[serde(rename = "Version")]
    pub version: String,
}

/// Seam for the container-runtime version probe.
pub trait Probe {
    fn probe(&self, vm: &VmUuid) -> Result<RuntimeVersion>;
}

/// Probe over SSH using the controller's pushed key.
pub struct SshProbe<'a> {
    pub cp: &'a dyn ControlPlane,
    pub username: String,
}

impl Probe for SshProbe<'_> {
    fn probe(&self, vm: &VmUuid) -> Result<RuntimeVersion> {
        let ips = self.cp.vm_ips(vm)?;
        let ip = reachable_ip(&ips, sshkey::SSH_PORT)
            .ok_or_else(|| eyre!("No address of VM {vm} accepts SSH connections"))?;
        let identity = sshkey::ensure_identity_file(self.cp)?;
        let out = sshkey::ssh_command(&identity, &self.username, ip, false)
            .arg("docker version --format '{{json .Server}}'")
            .run_get_string()
            .context("Failed to query the container runtime over SSH")?;
        parse_version(&out)
    }
}

/// Probe the runtime's TLS endpoint with the stored client material.
pub struct TlsProbe<'a> {
    pub cp: &'a dyn ControlPlane,
}

impl Probe for TlsProbe<'_> {
    fn probe(&self, vm: &VmUuid) -> Result<RuntimeVersion> {
        let ips = self.cp.vm_ips(vm)?;
        let ip = reachable_ip(&ips, TLS_PORT)
            .ok_or_else(|| eyre!("No address of VM {vm} accepts connections on port {TLS_PORT}"))?;

        let fetch = |name: String| -> Result<String> {
            self.cp
                .secret_get(&name)?
                .ok_or_else(|| eyre!("TLS material {name} is missing from secret storage"))
        };
        let dir = tempfile::tempdir().context("Creating TLS material directory")?;
        let write = |name: &str, content: &str| -> Result<std::path::PathBuf> {
            let path = dir.path().join(name);
            std::fs::write(&path, content)
                .with_context(|| format!("Failed to materialize {name}"))?;
            Ok(path)
        };
        let ca = write("ca.pem", &fetch(secret_name_ca_cert(vm))?)?;
        let cert = write("client-cert.pem", &fetch(secret_name_client_cert(vm))?)?;
        let key = write("client-key.pem", &fetch(secret_name_client_key(vm))?)?;

        let out = Command::new("curl")
            .args(["--silent", "--show-error", "--fail"])
            .arg("--cacert")
            .arg(&ca)
            .arg("--cert")
            .arg(&cert)
            .arg("--key")
            .arg(&key)
            .arg(format!("https://{ip}:{TLS_PORT}/version"))
            .run_get_string()
            .context("Failed to query the container runtime's TLS endpoint")?;
        parse_version(&out)
    }
}

fn parse_version(raw: &str) -> Result<RuntimeVersion> {
    serde_json::from_str(raw.trim())
        .with_context(|| format!("Unexpected version reply from the container runtime: {raw:?}"))
}

fn reachable_ip(ips: &[Ipv4Addr], port: u16) -> Option<Ipv4Addr> {
    sshkey::suitable_ip_on_port(ips, port)
}

/// Determine a human-readable cause for a failed probe.
pub fn diagnose(cp: &dyn ControlPlane, vm: &VmUuid, port: u16) -> String {
    let ips = match cp.vm_ips(vm) {
        Ok(ips) => ips,
        Err(e) => {
            debug!("diagnosis could not query guest addresses: {e:#}");
            return format!("The control plane could not report addresses for VM {vm}.");
        }
    };
    if ips.is_empty() {
        return format!(
            "VM {vm} reports no IPv4 addresses. The guest agent may not be \
             running, or the VM has no connected network."
        );
    }
    if reachable_ip(&ips, port).is_none() {
        let listed: Vec<String> = ips.iter().map(|ip| ip.to_string()).collect();
        return format!(
            "None of the VM's addresses ({}) accept connections on port {port}. \
             Check the guest's firewall and that the service is listening.",
            listed.join(", ")
        );
    }
    format!(
        "VM {vm} is reachable on port {port} but rejected the connection. \
         The installed trust material was likely not accepted by the guest."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        let v = parse_version("{\"Version\":\"24.0.7\",\"ApiVersion\":\"1.43\"}\n").unwrap();
        assert_eq!(v.version, "24.0.7");
    }

    #[test]
    fn test_parse_version_rejects_noise() {
        assert!(parse_version("command not found").is_err());
        assert!(parse_version("").is_err());
    }

    #[test]
    fn test_secret_names_are_vm_scoped() {
        let a = VmUuid::new("aaaa");
        let b = VmUuid::new("bbbb");
        assert_ne!(secret_name_client_key(&a), secret_name_client_key(&b));
        assert!(secret_name_ca_cert(&a).contains("aaaa"));
    }
}
