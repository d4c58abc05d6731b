//! SSH trust establishment
//!
//! The controller keeps an RSA key pair in pool secret storage,
//! generated on first use with `ssh-keygen`. Establishing trust means
//! resolving a reachable guest address on the SSH port and executing a
//! remote command that idempotently appends the public key to the
//! target user's authorized_keys.

use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::process::Command;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context, Result};
use tracing::{debug, info};

use crate::command_run::CommandRun;
use crate::xapi::{ControlPlane, VmUuid};

const SECRET_PRIVATE_KEY: &str = "cvk-idrsa-private";
const SECRET_PUBLIC_KEY: &str = "cvk-idrsa-public";

pub const SSH_PORT: u16 = 22;
const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(5);

/// The materialized private key is refreshed once it is older than
/// this, in case the pool secret has rotated underneath it.
const IDENTITY_FILE_MAX_AGE: Duration = Duration::from_secs(60);

/// Seam for pushing the controller's public key into a VM, so the
/// workflow can be driven in tests without a live guest.
pub trait KeyPusher {
    fn push(&self, vm: &VmUuid, username: &str) -> Result<()>;
}

/// Build the ssh invocation shared by the key push and the later
/// verification probe. `password_auth` is enabled only for the initial
/// push, before our key is trusted.
pub fn ssh_command(
    identity: &Utf8Path,
    username: &str,
    ip: Ipv4Addr,
    password_auth: bool,
) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.args([
        "-o",
        "UserKnownHostsFile=/dev/null",
        "-o",
        "StrictHostKeyChecking=no",
        "-o",
        "LogLevel=ERROR",
        "-o",
        "ConnectTimeout=10",
    ]);
    if !password_auth {
        cmd.args(["-o", "PasswordAuthentication=no"]);
    }
    cmd.arg("-i").arg(identity);
    cmd.arg(format!("{username}@{ip}"));
    cmd
}

/// The remote side of the push: create ~/.ssh with restrictive
/// permissions if needed, append the key only when absent, and
/// best-effort restore the SELinux context on the directory.
fn remote_append_command(pubkey: &str) -> String {
    let key = pubkey.trim();
    format!(
        "mkdir -p \"$HOME/.ssh\" && chmod 700 \"$HOME/.ssh\" && \
         touch \"$HOME/.ssh/authorized_keys\" && \
         grep -q -F '{key}' \"$HOME/.ssh/authorized_keys\" || echo '{key}' >> \"$HOME/.ssh/authorized_keys\"; \
         chmod 600 \"$HOME/.ssh/authorized_keys\"; \
         restorecon -R \"$HOME/.ssh\" 2>/dev/null || true"
    )
}

/// Order candidate addresses for the SSH probe: host-internal
/// (169.254/16) networks first, otherwise guest device order.
fn order_candidates(ips: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
    let mut ordered = Vec::with_capacity(ips.len());
    for &ip in ips {
        if ip.is_link_local() {
            ordered.insert(0, ip);
        } else {
            ordered.push(ip);
        }
    }
    ordered
}

fn tcp_reachable(ip: Ipv4Addr, port: u16) -> bool {
    let addr = SocketAddr::from((ip, port));
    TcpStream::connect_timeout(&addr, REACHABILITY_TIMEOUT).is_ok()
}

/// Resolve an address the VM accepts SSH connections on.
pub fn suitable_ip(
    ips: &[Ipv4Addr],
    reachable: impl Fn(Ipv4Addr, u16) -> bool,
) -> Option<Ipv4Addr> {
    order_candidates(ips)
        .into_iter()
        .find(|&ip| reachable(ip, SSH_PORT))
}

/// Like [`suitable_ip`] but probing an arbitrary port with the live
/// TCP check; the verification probes share the candidate ordering.
pub fn suitable_ip_on_port(ips: &[Ipv4Addr], port: u16) -> Option<Ipv4Addr> {
    order_candidates(ips)
        .into_iter()
        .find(|&ip| tcp_reachable(ip, port))
}

/// Fetch the controller key pair from pool secret storage, generating
/// and storing a fresh one on first use.
fn ensure_keypair(cp: &dyn ControlPlane) -> Result<(String, String)> {
    if let (Some(private), Some(public)) = (
        cp.secret_get(SECRET_PRIVATE_KEY)?,
        cp.secret_get(SECRET_PUBLIC_KEY)?,
    ) {
        return Ok((private, public));
    }
    info!("generating controller SSH key pair");
    let dir = tempfile::tempdir().context("Creating key generation directory")?;
    let key_path = dir.path().join("id_rsa");
    let key_path_str = key_path
        .to_str()
        .ok_or_else(|| eyre!("Non-UTF-8 temporary key path"))?;
    Command::new("ssh-keygen")
        .args(["-t", "rsa", "-b", "3072", "-N", "", "-C", "cvk", "-f", key_path_str])
        .run()
        .context("Failed to generate SSH key pair")?;
    let private = std::fs::read_to_string(&key_path).context("Reading generated private key")?;
    let public = std::fs::read_to_string(key_path.with_extension("pub"))
        .context("Reading generated public key")?;
    cp.secret_set(SECRET_PRIVATE_KEY, &private)?;
    cp.secret_set(SECRET_PUBLIC_KEY, &public)?;
    Ok((private, public))
}

/// The controller's public key, for display and for the remote append.
pub fn public_key(cp: &dyn ControlPlane) -> Result<String> {
    let (_, public) = ensure_keypair(cp)?;
    Ok(public.trim().to_string())
}

/// Materialize the private key to a mode-0600 file for the `ssh`
/// child, refreshing it when stale.
pub fn ensure_identity_file(cp: &dyn ControlPlane) -> Result<Utf8PathBuf> {
    let path = Utf8PathBuf::try_from(std::env::temp_dir())
        .map_err(|e| eyre!("Non-UTF-8 temp dir: {e}"))?
        .join("cvk-idrsa");
    let stale = match std::fs::metadata(&path).and_then(|m| m.modified()) {
        Ok(mtime) => mtime
            .elapsed()
            .map(|age| age > IDENTITY_FILE_MAX_AGE)
            .unwrap_or(true),
        Err(_) => true,
    };
    if stale {
        let (private, _) = ensure_keypair(cp)?;
        std::fs::write(&path, private).with_context(|| format!("Failed to write {path}"))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("Failed to restrict permissions on {path}"))?;
        }
    }
    Ok(path)
}

/// Real pusher: resolves the address via live TCP probes and drives
/// the `ssh` subprocess. The child inherits the terminal so the
/// operator can satisfy the guest's password prompt on first contact.
pub struct SshKeyPusher<'a> {
    pub cp: &'a dyn ControlPlane,
}

impl KeyPusher for SshKeyPusher<'_> {
    fn push(&self, vm: &VmUuid, username: &str) -> Result<()> {
        let ips = self.cp.vm_ips(vm)?;
        let ip = suitable_ip(&ips, tcp_reachable).ok_or_else(|| {
            eyre!("No address of VM {vm} accepts connections on port {SSH_PORT}; check the guest's network")
        })?;
        debug!(%vm, %ip, "pushing public key");
        let identity = ensure_identity_file(self.cp)?;
        let pubkey = public_key(self.cp)?;
        ssh_command(&identity, username, ip, true)
            .arg(remote_append_command(&pubkey))
            .run()
            .with_context(|| format!("Failed to install public key for {username}@{ip}"))?;
        info!("public key installed for {username}@{ip}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_order_candidates_prefers_host_internal() {
        let ips = vec![ip("10.0.0.4"), ip("169.254.0.2"), ip("192.168.1.9")];
        assert_eq!(
            order_candidates(&ips),
            vec![ip("169.254.0.2"), ip("10.0.0.4"), ip("192.168.1.9")]
        );
    }

    #[test]
    fn test_suitable_ip_skips_unreachable() {
        let ips = vec![ip("169.254.0.2"), ip("10.0.0.4")];
        let picked = suitable_ip(&ips, |addr, _| addr == ip("10.0.0.4"));
        assert_eq!(picked, Some(ip("10.0.0.4")));
    }

    #[test]
    fn test_suitable_ip_none_reachable() {
        let ips = vec![ip("10.0.0.4")];
        assert_eq!(suitable_ip(&ips, |_, _| false), None);
    }

    #[test]
    fn test_remote_append_is_guarded() {
        let cmd = remote_append_command("ssh-rsa AAAA cvk\n");
        // Append only when the key is absent, keep permissions tight,
        // and never fail on a missing restorecon.
        assert!(cmd.contains("grep -q -F 'ssh-rsa AAAA cvk'"));
        assert!(cmd.contains("chmod 700"));
        assert!(cmd.contains("chmod 600"));
        assert!(cmd.contains("restorecon"));
        assert!(cmd.ends_with("|| true"));
        assert!(!cmd.contains('\n'));
    }

    #[test]
    fn test_ssh_command_disables_password_auth_for_probes() {
        let cmd = ssh_command(Utf8Path::new("/tmp/id"), "core", ip("10.0.0.1"), false);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"PasswordAuthentication=no".to_string()));
        assert!(args.contains(&"core@10.0.0.1".to_string()));
    }
}
