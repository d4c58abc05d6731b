//! Control plane client for a XenServer-style hypervisor
//!
//! Everything the workflow needs from the hypervisor is behind the
//! [`ControlPlane`] trait; [`XeCli`] implements it by shelling out to
//! the `xe` CLI, optionally against a remote server. Only the handful
//! of operations the preparation workflow consumes are exposed: power
//! state, guest IPs, VM metadata, the CD drive, disk import/insert/
//! eject/destroy, and pool secret storage.

use std::fmt;
use std::net::Ipv4Addr;
use std::process::Command;

use camino::Utf8Path;
use color_eyre::eyre::{eyre, Context, Result};
use tracing::debug;

use crate::command_run::{CapturedOutput, CommandRun};

/// Disk images are padded to this alignment before import; the import
/// transport rejects raw images that are not 2MiB-aligned.
const IMPORT_ALIGNMENT: u64 = 2 * 1024 * 1024;

macro_rules! uuid_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name(String);

        impl $name {
            pub fn new(uuid: impl Into<String>) -> Self {
                Self(uuid.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

uuid_newtype!(
    /// Opaque identifier of a virtual machine.
    VmUuid
);
uuid_newtype!(
    /// Opaque identifier of a virtual block device (CD drive slot).
    VbdUuid
);
uuid_newtype!(
    /// Opaque identifier of a virtual disk image.
    VdiUuid
);
uuid_newtype!(
    /// Opaque identifier of a storage repository.
    SrUuid
);

/// Outcome of attempting to insert media into a CD drive. A drive that
/// already holds media is a conflicting-state condition the workflow
/// resolves interactively, so it is not modeled as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    DriveNotEmpty,
}

/// The narrow hypervisor interface the preparation workflow consumes.
pub trait ControlPlane {
    fn vm_is_running(&self, vm: &VmUuid) -> Result<bool>;

    /// The VM's guest-reported IPv4 addresses, in device order.
    fn vm_ips(&self, vm: &VmUuid) -> Result<Vec<Ipv4Addr>>;

    fn vm_other_config_get(&self, vm: &VmUuid, key: &str) -> Result<Option<String>>;
    fn vm_other_config_set(&self, vm: &VmUuid, key: &str, value: &str) -> Result<()>;
    /// Idempotent: removing an absent key succeeds.
    fn vm_other_config_remove(&self, vm: &VmUuid, key: &str) -> Result<()>;

    /// The VM's virtual CD drive, if it has one.
    fn vm_cd_drive(&self, vm: &VmUuid) -> Result<Option<VbdUuid>>;

    /// The storage repository backing the VM's first disk, if any.
    fn vm_sr(&self, vm: &VmUuid) -> Result<Option<SrUuid>>;

    /// The pool's default storage repository.
    fn default_sr(&self) -> Result<SrUuid>;

    fn import_disk(
        &self,
        sr: &SrUuid,
        path: &Utf8Path,
        format: &str,
        label: &str,
    ) -> Result<VdiUuid>;

    fn insert_media(&self, drive: &VbdUuid, vdi: &VdiUuid) -> Result<InsertOutcome>;

    /// Idempotent: ejecting an already-empty drive succeeds.
    fn eject_media(&self, drive: &VbdUuid) -> Result<()>;

    fn destroy_disk(&self, vdi: &VdiUuid) -> Result<()>;

    /// Pool secret storage, addressed by name via pool other-config.
    fn secret_get(&self, name: &str) -> Result<Option<String>>;
    fn secret_set(&self, name: &str, value: &str) -> Result<()>;
}

/// `xe`-CLI-backed control plane client.
pub struct XeCli {
    /// Server to target (`xe -s <server>`); None means the local host.
    server: Option<String>,
}

impl XeCli {
    pub fn new(server: Option<String>) -> Self {
        Self { server }
    }

    fn xe_command(&self) -> Command {
        let mut cmd = Command::new("xe");
        if let Some(server) = &self.server {
            cmd.arg("-s").arg(server);
        }
        cmd
    }

    fn xe_string(&self, args: &[&str]) -> Result<String> {
        let out = self
            .xe_command()
            .args(args)
            .run_get_string()
            .with_context(|| format!("Failed to run xe {:?}", args))?;
        Ok(out.trim().to_string())
    }

    fn xe_run(&self, args: &[&str]) -> Result<()> {
        self.xe_command()
            .args(args)
            .run()
            .with_context(|| format!("Failed to run xe {:?}", args))
    }

    fn xe_captured(&self, args: &[&str]) -> Result<CapturedOutput> {
        self.xe_command()
            .args(args)
            .run_captured()
            .with_context(|| format!("Failed to run xe {:?}", args))
    }

    fn pool_uuid(&self) -> Result<String> {
        let out = self.xe_string(&["pool-list", "params=uuid", "--minimal"])?;
        first_minimal(&out).ok_or_else(|| eyre!("No pool visible on the control plane"))
    }
}

/// Split `--minimal` output (comma-separated, possibly empty) and
/// return the first entry.
fn first_minimal(out: &str) -> Option<String> {
    out.split(',')
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// Parse the guest-metrics `networks` map as printed by
/// `xe vm-param-get param-name=networks`, e.g.
/// `0/ip: 10.0.0.5; 0/ipv6/0: fe80::1; 1/ip: 169.254.0.2`.
///
/// Only IPv4 entries are kept (the controller cannot reach the guest's
/// link-scoped IPv6 addresses), ordered by device index and then by
/// entry index within the device, deduplicated.
fn parse_guest_networks(raw: &str) -> Vec<Ipv4Addr> {
    let mut entries: Vec<(u32, u32, Ipv4Addr)> = Vec::new();
    for item in raw.split(';') {
        let Some((key, value)) = item.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        let mut parts = key.split('/');
        let Some(device) = parts.next().and_then(|d| d.parse::<u32>().ok()) else {
            continue;
        };
        let kind = parts.next().unwrap_or("");
        if kind != "ip" && kind != "ipv4" {
            continue;
        }
        let sub = parts.next().and_then(|s| s.parse::<u32>().ok()).unwrap_or(0);
        let Ok(addr) = value.parse::<Ipv4Addr>() else {
            continue;
        };
        entries.push((device, sub, addr));
    }
    entries.sort_by_key(|&(device, sub, _)| (device, sub));
    let mut ips = Vec::new();
    for (_, _, addr) in entries {
        if !ips.contains(&addr) {
            ips.push(addr);
        }
    }
    ips
}

/// Round a raw image size up to the import alignment boundary.
fn aligned_import_size(bytes: u64) -> u64 {
    bytes.div_ceil(IMPORT_ALIGNMENT) * IMPORT_ALIGNMENT
}

fn classify_insert(out: &CapturedOutput) -> Result<InsertOutcome> {
    if out.success {
        return Ok(InsertOutcome::Inserted);
    }
    if out.stderr.contains("VBD_NOT_EMPTY") {
        return Ok(InsertOutcome::DriveNotEmpty);
    }
    Err(eyre!("Failed to insert media: {}", out.stderr.trim()))
}

fn classify_eject(out: &CapturedOutput) -> Result<()> {
    if out.success {
        return Ok(());
    }
    if out.stderr.contains("VBD_IS_EMPTY") {
        debug!("drive already empty, nothing to eject");
        return Ok(());
    }
    Err(eyre!("Failed to eject media: {}", out.stderr.trim()))
}

/// Missing map keys come back from `xe` as a non-zero exit with a
/// "Key ... not found" message; that is an absent value, not a fault.
fn classify_map_get(out: &CapturedOutput) -> Result<Option<String>> {
    if out.success {
        return Ok(Some(out.stdout.trim().to_string()));
    }
    if out.stderr.contains("not found") || out.stderr.contains("Key") {
        return Ok(None);
    }
    Err(eyre!("Failed to read map key: {}", out.stderr.trim()))
}

impl ControlPlane for XeCli {
    fn vm_is_running(&self, vm: &VmUuid) -> Result<bool> {
        let state = self.xe_string(&[
            "vm-param-get",
            &format!("uuid={vm}"),
            "param-name=power-state",
        ])?;
        Ok(state == "running")
    }

    fn vm_ips(&self, vm: &VmUuid) -> Result<Vec<Ipv4Addr>> {
        // The networks map is populated by the guest agent; a VM
        // without one (or freshly booted) reports an empty map.
        let out = self.xe_captured(&[
            "vm-param-get",
            &format!("uuid={vm}"),
            "param-name=networks",
        ])?;
        if !out.success {
            debug!(vm = %vm, "no guest networks reported: {}", out.stderr.trim());
            return Ok(Vec::new());
        }
        Ok(parse_guest_networks(&out.stdout))
    }

    fn vm_other_config_get(&self, vm: &VmUuid, key: &str) -> Result<Option<String>> {
        let out = self.xe_captured(&[
            "vm-param-get",
            &format!("uuid={vm}"),
            "param-name=other-config",
            &format!("param-key={key}"),
        ])?;
        classify_map_get(&out)
    }

    fn vm_other_config_set(&self, vm: &VmUuid, key: &str, value: &str) -> Result<()> {
        self.xe_run(&[
            "vm-param-set",
            &format!("uuid={vm}"),
            &format!("other-config:{key}={value}"),
        ])
    }

    fn vm_other_config_remove(&self, vm: &VmUuid, key: &str) -> Result<()> {
        let out = self.xe_captured(&[
            "vm-param-remove",
            &format!("uuid={vm}"),
            "param-name=other-config",
            &format!("param-key={key}"),
        ])?;
        if !out.success && !out.stderr.contains("not found") {
            return Err(eyre!(
                "Failed to remove other-config:{key}: {}",
                out.stderr.trim()
            ));
        }
        Ok(())
    }

    fn vm_cd_drive(&self, vm: &VmUuid) -> Result<Option<VbdUuid>> {
        let out = self.xe_string(&[
            "vbd-list",
            &format!("vm-uuid={vm}"),
            "type=CD",
            "params=uuid",
            "--minimal",
        ])?;
        Ok(first_minimal(&out).map(VbdUuid::new))
    }

    fn vm_sr(&self, vm: &VmUuid) -> Result<Option<SrUuid>> {
        let out = self.xe_string(&[
            "vbd-list",
            &format!("vm-uuid={vm}"),
            "type=Disk",
            "params=vdi-uuid",
            "--minimal",
        ])?;
        let Some(vdi) = first_minimal(&out) else {
            return Ok(None);
        };
        let sr = self.xe_string(&[
            "vdi-param-get",
            &format!("uuid={vdi}"),
            "param-name=sr-uuid",
        ])?;
        Ok(Some(SrUuid::new(sr)))
    }

    fn default_sr(&self) -> Result<SrUuid> {
        let out = self.xe_string(&["pool-list", "params=default-SR", "--minimal"])?;
        match first_minimal(&out) {
            Some(uuid) if !uuid.contains("not in database") => Ok(SrUuid::new(uuid)),
            _ => Err(eyre!("The pool has no default storage repository")),
        }
    }

    fn import_disk(
        &self,
        sr: &SrUuid,
        path: &Utf8Path,
        format: &str,
        label: &str,
    ) -> Result<VdiUuid> {
        let size = std::fs::metadata(path)
            .with_context(|| format!("Failed to stat {path}"))?
            .len();
        let virtual_size = aligned_import_size(size);
        debug!(%sr, %path, virtual_size, "importing disk image");
        let vdi = self.xe_string(&[
            "vdi-create",
            &format!("sr-uuid={sr}"),
            &format!("name-label={label}"),
            &format!("virtual-size={virtual_size}"),
            "type=user",
        ])?;
        let vdi = VdiUuid::new(vdi);
        let import = self.xe_captured(&[
            "vdi-import",
            &format!("uuid={vdi}"),
            &format!("filename={path}"),
            &format!("format={format}"),
        ])?;
        if !import.success {
            // Don't leave the empty VDI behind on a failed upload.
            if let Err(e) = self.destroy_disk(&vdi) {
                debug!("failed to destroy partially imported disk: {e:#}");
            }
            return Err(eyre!(
                "Failed to import {path} into SR {sr}: {}",
                import.stderr.trim()
            ));
        }
        Ok(vdi)
    }

    fn insert_media(&self, drive: &VbdUuid, vdi: &VdiUuid) -> Result<InsertOutcome> {
        let out = self.xe_captured(&[
            "vbd-insert",
            &format!("uuid={drive}"),
            &format!("vdi-uuid={vdi}"),
        ])?;
        classify_insert(&out)
    }

    fn eject_media(&self, drive: &VbdUuid) -> Result<()> {
        let out = self.xe_captured(&["vbd-eject", &format!("uuid={drive}")])?;
        classify_eject(&out)
    }

    fn destroy_disk(&self, vdi: &VdiUuid) -> Result<()> {
        self.xe_run(&["vdi-destroy", &format!("uuid={vdi}")])
    }

    fn secret_get(&self, name: &str) -> Result<Option<String>> {
        let pool = self.pool_uuid()?;
        let out = self.xe_captured(&[
            "pool-param-get",
            &format!("uuid={pool}"),
            "param-name=other-config",
            &format!("param-key={name}"),
        ])?;
        let Some(secret_uuid) = classify_map_get(&out)? else {
            return Ok(None);
        };
        let value = self.xe_string(&[
            "secret-param-get",
            &format!("uuid={secret_uuid}"),
            "param-name=value",
        ])?;
        Ok(Some(value))
    }

    fn secret_set(&self, name: &str, value: &str) -> Result<()> {
        let secret_uuid = self.xe_string(&["secret-create", &format!("value={value}")])?;
        let pool = self.pool_uuid()?;
        self.xe_run(&[
            "pool-param-set",
            &format!("uuid={pool}"),
            &format!("other-config:{name}={secret_uuid}"),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_guest_networks_orders_and_filters() {
        let raw = "1/ip: 10.0.1.7; 0/ipv6/0: fe80::216:3eff:fe4d:1; 0/ip: 192.168.5.20; 0/ipv4/1: 169.254.0.2";
        let ips = parse_guest_networks(raw);
        assert_eq!(
            ips,
            vec![
                "192.168.5.20".parse::<Ipv4Addr>().unwrap(),
                "169.254.0.2".parse().unwrap(),
                "10.0.1.7".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn test_parse_guest_networks_dedupes() {
        let raw = "0/ip: 10.0.0.1; 0/ipv4/0: 10.0.0.1";
        assert_eq!(parse_guest_networks(raw).len(), 1);
    }

    #[test]
    fn test_parse_guest_networks_empty() {
        assert!(parse_guest_networks("").is_empty());
        assert!(parse_guest_networks("garbage").is_empty());
    }

    #[test]
    fn test_first_minimal() {
        assert_eq!(first_minimal("abc,def").as_deref(), Some("abc"));
        assert_eq!(first_minimal(" abc \n").as_deref(), Some("abc"));
        assert_eq!(first_minimal(""), None);
        assert_eq!(first_minimal(",,"), None);
    }

    #[test]
    fn test_aligned_import_size() {
        assert_eq!(aligned_import_size(1), IMPORT_ALIGNMENT);
        assert_eq!(aligned_import_size(IMPORT_ALIGNMENT), IMPORT_ALIGNMENT);
        assert_eq!(
            aligned_import_size(IMPORT_ALIGNMENT + 1),
            2 * IMPORT_ALIGNMENT
        );
    }

    #[test]
    fn test_classify_insert_not_empty() {
        let out = CapturedOutput {
            success: false,
            stdout: String::new(),
            stderr: "Error: VBD_NOT_EMPTY".into(),
        };
        assert_eq!(classify_insert(&out).unwrap(), InsertOutcome::DriveNotEmpty);
    }

    #[test]
    fn test_classify_insert_other_failure() {
        let out = CapturedOutput {
            success: false,
            stdout: String::new(),
            stderr: "Error: HANDLE_INVALID".into(),
        };
        assert!(classify_insert(&out).is_err());
    }

    #[test]
    fn test_classify_eject_tolerates_empty() {
        let out = CapturedOutput {
            success: false,
            stdout: String::new(),
            stderr: "Error: VBD_IS_EMPTY".into(),
        };
        assert!(classify_eject(&out).is_ok());
    }
}
