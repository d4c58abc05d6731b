//! Virtual media packaging and the delivery transaction record
//!
//! The generated-certificates TLS path delivers trust material to the
//! guest on a virtual CD: the certificate set plus an in-guest
//! configuration script, packaged as an ISO with `genisoimage`.
//! [`MediaTransaction`] tracks the transient resources that delivery
//! allocates (local ISO file, imported VDI, occupied drive) so a single
//! release call can unwind all of them on every exit path.

use std::net::Ipv4Addr;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context, Result};
use tracing::{debug, warn};

use crate::certs::{self, CertificateSet};
use crate::command_run::CommandRun;
use crate::xapi::{ControlPlane, VbdUuid, VdiUuid};

/// In-guest script shipped on the media. It installs the delivered
/// certificates and points the container runtime's TLS listener at
/// them; the operator runs it from the mounted CD.
const CONFIGURE_SCRIPT: &str = r#"#!/bin/sh
# Install the delivered TLS material and enable the container
# runtime's TLS listener. Run as root from the mounted media.
set -eu

SRC="$(dirname "$0")"
DEST=/etc/docker/cvk-tls

mkdir -p "$DEST"
chmod 700 "$DEST"
cp "$SRC/ca.pem" "$SRC/server-cert.pem" "$SRC/server-key.pem" "$DEST/"
chmod 600 "$DEST"/server-key.pem

mkdir -p /etc/systemd/system/docker.service.d
cat > /etc/systemd/system/docker.service.d/cvk-tls.conf <<EOF
[Service]
ExecStart=
ExecStart=/usr/bin/dockerd \
  --tlsverify \
  --tlscacert=$DEST/ca.pem \
  --tlscert=$DEST/server-cert.pem \
  --tlskey=$DEST/server-key.pem \
  -H tcp://0.0.0.0:2376 \
  -H unix:///var/run/docker.sock
EOF

systemctl daemon-reload
systemctl restart docker
echo "TLS listener configured on port 2376."
"#;

/// What the builder hands back: the packaged ISO, plus the client
/// triple the workflow stores in secret storage for the monitor.
#[derive(Debug)]
pub struct GeneratedMedia {
    pub iso_path: Utf8PathBuf,
    pub certs: CertificateSet,
}

/// Seam for certificate-set generation and packaging, so the workflow
/// can be exercised without cutting ISOs (and so tests can observe
/// that generation is never reached on an aborted precondition).
pub trait MediaBuilder {
    fn build(&self, label: &str, ips: &[Ipv4Addr]) -> Result<GeneratedMedia>;
}

/// Real builder: rcgen material staged into a temp dir, packaged with
/// `genisoimage`.
pub struct IsoBuilder;

/// Write the certificate files and configuration script into `dir`
/// with the layout the in-guest script expects.
fn stage(dir: &Utf8Path, certs: &CertificateSet) -> Result<()> {
    let write = |name: &str, content: &str| -> Result<()> {
        std::fs::write(dir.join(name), content)
            .with_context(|| format!("Failed to stage {name}"))
    };
    write("ca.pem", &certs.ca_cert_pem)?;
    write("server-cert.pem", &certs.server_cert_pem)?;
    write("server-key.pem", &certs.server_key_pem)?;
    write("client-cert.pem", &certs.client_cert_pem)?;
    write("client-key.pem", &certs.client_key_pem)?;
    write("configure.sh", CONFIGURE_SCRIPT)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(
            dir.join("configure.sh"),
            std::fs::Permissions::from_mode(0o755),
        )
        .context("Failed to mark configure.sh executable")?;
    }
    Ok(())
}

impl MediaBuilder for IsoBuilder {
    fn build(&self, label: &str, ips: &[Ipv4Addr]) -> Result<GeneratedMedia> {
        let certs = certs::generate(label, ips)?;

        let staging = tempfile::tempdir().context("Creating staging directory")?;
        let staging_path = Utf8Path::from_path(staging.path())
            .ok_or_else(|| eyre!("Non-UTF-8 temporary directory path"))?;
        stage(staging_path, &certs)?;

        let (_, iso_path) = tempfile::Builder::new()
            .prefix("cvk-certs-")
            .suffix(".iso")
            .tempfile()
            .context("Creating ISO file")?
            .keep()
            .map_err(|e| eyre!("Persisting ISO file: {e}"))?;
        let iso_path = Utf8PathBuf::try_from(iso_path)
            .map_err(|e| eyre!("Non-UTF-8 ISO path: {e}"))?;

        debug!(%iso_path, "packaging certificate media");
        Command::new("genisoimage")
            .args(["-J", "-R", "-quiet", "-o"])
            .arg(&iso_path)
            .arg(staging_path)
            .run()
            .context("Failed to package certificate media with genisoimage")?;

        Ok(GeneratedMedia { iso_path, certs })
    }
}

/// Resource-tracking record for one certificate-delivery attempt.
///
/// Each resource is recorded as it is acquired; [`release`] unwinds
/// whatever was recorded, in reverse-acquisition order, exactly once.
/// Release problems are logged rather than raised so they cannot mask
/// the failure that triggered the unwind.
///
/// [`release`]: MediaTransaction::release
#[derive(Debug, Default)]
pub struct MediaTransaction {
    iso: Option<Utf8PathBuf>,
    vdi: Option<VdiUuid>,
    drive: Option<VbdUuid>,
}

impl MediaTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_iso(&mut self, path: Utf8PathBuf) {
        self.iso = Some(path);
    }

    pub fn record_vdi(&mut self, vdi: VdiUuid) {
        self.vdi = Some(vdi);
    }

    /// Record that an insert was attempted on `drive`; the drive will
    /// be ejected during release whether or not the insert stuck.
    pub fn record_drive(&mut self, drive: VbdUuid) {
        self.drive = Some(drive);
    }

    pub fn release(&mut self, cp: &dyn ControlPlane) {
        if let Some(drive) = self.drive.take() {
            if let Err(e) = cp.eject_media(&drive) {
                warn!("failed to eject media from drive {drive}: {e:#}");
            }
        }
        if let Some(vdi) = self.vdi.take() {
            if let Err(e) = cp.destroy_disk(&vdi) {
                warn!("failed to destroy media disk {vdi}: {e:#}");
            }
        }
        if let Some(iso) = self.iso.take() {
            match std::fs::remove_file(&iso) {
                Ok(()) => debug!(%iso, "removed media image"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("failed to remove media image {iso}: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configure_script_shape() {
        assert!(CONFIGURE_SCRIPT.starts_with("#!/bin/sh"));
        for needle in ["--tlsverify", "tcp://0.0.0.0:2376", "ca.pem", "server-key.pem"] {
            assert!(
                CONFIGURE_SCRIPT.contains(needle),
                "missing {needle} in configure script"
            );
        }
        // The script must not reference the client material; that
        // stays with the monitor, not the guest.
        assert!(!CONFIGURE_SCRIPT.contains("client-key.pem"));
    }

    #[test]
    fn test_stage_layout() {
        let certs = CertificateSet {
            ca_cert_pem: "CA".into(),
            server_cert_pem: "SCERT".into(),
            server_key_pem: "SKEY".into(),
            client_cert_pem: "CCERT".into(),
            client_key_pem: "CKEY".into(),
        };
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap();
        stage(path, &certs).unwrap();
        for name in [
            "ca.pem",
            "server-cert.pem",
            "server-key.pem",
            "client-cert.pem",
            "client-key.pem",
            "configure.sh",
        ] {
            assert!(path.join(name).exists(), "missing staged file {name}");
        }
        assert_eq!(std::fs::read_to_string(path.join("ca.pem")).unwrap(), "CA");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(path.join("configure.sh"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }
}
