//! prepare command - drive a VM from unprepared to monitored
//!
//! The controller sequences the whole workflow: entry running-state
//! check, mode dispatch (SSH key push, supplied TLS material, or the
//! generated-certificate media transaction), metadata recording,
//! the operator-paced verification loop, and the final registration
//! handoff. Collaborators are trait objects so the state machine runs
//! unchanged against fakes in tests.

use std::net::Ipv4Addr;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::media::{IsoBuilder, MediaBuilder, MediaTransaction};
use crate::monitor::Handoff;
use crate::prompt::{Prompter, TerminalPrompter};
use crate::sshkey::{self, KeyPusher, SshKeyPusher};
use crate::verify::{self, Probe, SshProbe, TlsProbe};
use crate::xapi::{ControlPlane, InsertOutcome, SrUuid, VbdUuid, VmUuid, XeCli};

/// VM other-config key recording the chosen trust mode.
pub const MODE_KEY: &str = "cvk-mode";
/// VM other-config key recording the SSH username.
pub const USERNAME_KEY: &str = "cvk-username";

/// Options for preparing a VM for container monitoring.
#[derive(Debug, Parser)]
pub struct PrepareOpts {
    /// UUID of the VM to prepare (must be running)
    pub vm_uuid: String,

    /// Control plane server to target (defaults to the local host)
    #[clap(short = 's', long = "server", global = true)]
    pub server: Option<String>,

    #[command(subcommand)]
    pub mode: ModeOpts,
}

#[derive(Debug, Subcommand)]
pub enum ModeOpts {
    /// Establish trust by pushing an SSH public key into the guest
    Ssh {
        /// Guest account that receives the controller's public key
        #[clap(long, default_value = "core")]
        username: String,
    },
    /// Establish trust with TLS client certificates
    Tls(TlsOpts),
}

#[derive(Debug, Parser)]
pub struct TlsOpts {
    /// Generate a fresh certificate set and deliver it via virtual CD
    #[clap(long, conflicts_with_all = ["client_cert", "client_key", "ca_cert"])]
    pub generate: bool,

    /// Path to an operator-supplied client certificate (PEM)
    #[clap(long, requires = "client_key")]
    pub client_cert: Option<Utf8PathBuf>,

    /// Path to the CA certificate the guest's server cert chains to
    #[clap(long, requires = "client_cert")]
    pub ca_cert: Option<Utf8PathBuf>,

    /// Path to the matching client private key (PEM)
    #[clap(long)]
    pub client_key: Option<Utf8PathBuf>,
}

/// The resolved trust mode. Parameters live on the variant that needs
/// them; nothing is optional-but-sometimes-required.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Ssh { username: String },
    Tls(TlsSource),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsSource {
    /// Generate certificates and deliver them on virtual media.
    Generate,
    /// Operator-supplied certificate material, already on disk.
    Supplied {
        client_cert: Utf8PathBuf,
        client_key: Utf8PathBuf,
        ca_cert: Utf8PathBuf,
    },
}

impl ModeOpts {
    fn resolve(&self) -> Result<Mode> {
        match self {
            ModeOpts::Ssh { username } => Ok(Mode::Ssh {
                username: username.clone(),
            }),
            ModeOpts::Tls(opts) => {
                if opts.generate {
                    return Ok(Mode::Tls(TlsSource::Generate));
                }
                match (&opts.client_cert, &opts.client_key, &opts.ca_cert) {
                    (Some(client_cert), Some(client_key), Some(ca_cert)) => {
                        Ok(Mode::Tls(TlsSource::Supplied {
                            client_cert: client_cert.clone(),
                            client_key: client_key.clone(),
                            ca_cert: ca_cert.clone(),
                        }))
                    }
                    _ => bail!(
                        "TLS mode needs either --generate or all of \
                         --client-cert, --client-key and --ca-cert"
                    ),
                }
            }
        }
    }
}

impl Mode {
    fn as_metadata(&self) -> &'static str {
        match self {
            Mode::Ssh { .. } => "ssh",
            Mode::Tls(_) => "tls",
        }
    }

    fn probe_port(&self) -> u16 {
        match self {
            Mode::Ssh { .. } => sshkey::SSH_PORT,
            Mode::Tls(_) => verify::TLS_PORT,
        }
    }
}

/// The workflow controller over its collaborator seams.
pub struct Workflow<'a> {
    pub cp: &'a dyn ControlPlane,
    pub prompter: &'a dyn Prompter,
    pub media: &'a dyn MediaBuilder,
    pub pusher: &'a dyn KeyPusher,
    pub handoff: Handoff,
}

impl Workflow<'_> {
    /// Run the workflow to completion. On any error the VM is left
    /// without the monitor flag and without partially recorded
    /// metadata; transient media resources are always released.
    pub fn run(&self, vm: &VmUuid, mode: &Mode, probe: &dyn Probe) -> Result<()> {
        if !self.cp.vm_is_running(vm)? {
            bail!("VM {vm} is not running; start it before preparing it for monitoring");
        }

        match mode {
            Mode::Ssh { username } => self.install_ssh(vm, username)?,
            Mode::Tls(source) => self.install_tls(vm, source)?,
        }

        // Metadata is written only once the credential path fully
        // succeeded; a failed run must not look half-prepared.
        self.cp
            .vm_other_config_set(vm, MODE_KEY, mode.as_metadata())?;
        if let Mode::Ssh { username } = mode {
            self.cp.vm_other_config_set(vm, USERNAME_KEY, username)?;
        }

        self.verification_loop(vm, mode.probe_port(), probe)?;
        self.handoff.register(self.cp, vm)
    }

    fn install_ssh(&self, vm: &VmUuid, username: &str) -> Result<()> {
        let granted = self.prompter.confirm(&format!(
            "Install the controller's public key for user '{username}' on VM {vm}, \
             granting it SSH access?"
        ))?;
        if !granted {
            bail!("Aborted: operator declined the SSH key push");
        }
        self.pusher.push(vm, username)
    }

    fn install_tls(&self, vm: &VmUuid, source: &TlsSource) -> Result<()> {
        match source {
            TlsSource::Supplied {
                client_cert,
                client_key,
                ca_cert,
            } => {
                let read = |path: &Utf8PathBuf| -> Result<String> {
                    std::fs::read_to_string(path)
                        .with_context(|| format!("Failed to read {path}"))
                };
                self.store_tls_material(
                    vm,
                    &read(ca_cert)?,
                    &read(client_cert)?,
                    &read(client_key)?,
                )
            }
            TlsSource::Generate => self.deliver_generated(vm),
        }
    }

    /// Store the client-side TLS triple where the monitor (and the
    /// verification probe) will look for it.
    fn store_tls_material(
        &self,
        vm: &VmUuid,
        ca_cert: &str,
        client_cert: &str,
        client_key: &str,
    ) -> Result<()> {
        self.cp
            .secret_set(&verify::secret_name_ca_cert(vm), ca_cert)?;
        self.cp
            .secret_set(&verify::secret_name_client_cert(vm), client_cert)?;
        self.cp
            .secret_set(&verify::secret_name_client_key(vm), client_key)?;
        debug!(%vm, "TLS client material stored");
        Ok(())
    }

    /// The certificate provisioning transaction: generate, package,
    /// import, insert, wait for the in-guest script, and release every
    /// transient resource no matter where it stops.
    fn deliver_generated(&self, vm: &VmUuid) -> Result<()> {
        let assigned = self.cp.vm_ips(vm)?;
        if assigned.is_empty() {
            bail!(
                "VM {vm} reports no IPv4 addresses; the generated certificates \
                 would be bound to nothing. Check the guest agent and network."
            );
        }
        let mut ips = assigned;
        if !ips.contains(&Ipv4Addr::LOCALHOST) {
            ips.push(Ipv4Addr::LOCALHOST);
        }

        let listed: Vec<String> = ips.iter().map(|ip| ip.to_string()).collect();
        println!("Certificates will be bound to: {}", listed.join(", "));
        let proceed = self.prompter.confirm(
            "Generate a fresh certificate set for these addresses and deliver \
             it to the VM via its virtual CD drive?",
        )?;
        if !proceed {
            bail!("Aborted: operator declined certificate delivery");
        }

        // Resolve the drive before generating anything; without one
        // there is no way to deliver the certificates.
        let Some(drive) = self.cp.vm_cd_drive(vm)? else {
            bail!(
                "VM {vm} has no virtual CD drive to deliver certificates \
                 through. Add a CD drive to the VM and re-run."
            );
        };

        let mut txn = MediaTransaction::new();
        let result = self.deliver_media(vm, &ips, &drive, &mut txn);
        txn.release(self.cp);
        result
    }

    fn deliver_media(
        &self,
        vm: &VmUuid,
        ips: &[Ipv4Addr],
        drive: &VbdUuid,
        txn: &mut MediaTransaction,
    ) -> Result<()> {
        let media = self.media.build(vm.as_str(), ips)?;
        txn.record_iso(media.iso_path.clone());

        let label = format!("cvk-certs-{vm}");
        let attempt = |sr: &SrUuid| self.cp.import_disk(sr, &media.iso_path, "raw", &label);
        let vdi = match self.cp.vm_sr(vm)? {
            Some(sr) => match attempt(&sr) {
                Ok(vdi) => vdi,
                Err(e) => {
                    warn!("import into the VM's SR {sr} failed: {e:#}; retrying on the default SR");
                    attempt(&self.cp.default_sr()?)?
                }
            },
            None => attempt(&self.cp.default_sr()?)?,
        };
        txn.record_vdi(vdi.clone());

        match self.cp.insert_media(drive, &vdi)? {
            InsertOutcome::Inserted => {}
            InsertOutcome::DriveNotEmpty => {
                let eject = self.prompter.confirm(
                    "The VM's CD drive already contains media. Eject it and retry?",
                )?;
                if !eject {
                    bail!("Aborted: the VM's CD drive is occupied");
                }
                self.cp.eject_media(drive)?;
                match self.cp.insert_media(drive, &vdi)? {
                    InsertOutcome::Inserted => {}
                    InsertOutcome::DriveNotEmpty => {
                        bail!("The VM's CD drive is still occupied after ejecting")
                    }
                }
            }
        }
        txn.record_drive(drive.clone());

        println!(
            "Certificate media inserted. In the guest, mount the CD and run \
             configure.sh as root (e.g. mount /dev/cdrom /mnt && sh /mnt/configure.sh)."
        );
        self.prompter
            .wait_for_ack("Has configure.sh been run inside the guest?")?;

        // The guest holds the server material now; record the client
        // side so the probe and the monitor can authenticate.
        self.store_tls_material(
            vm,
            &media.certs.ca_cert_pem,
            &media.certs.client_cert_pem,
            &media.certs.client_key_pem,
        )?;
        info!("certificate delivery to VM {vm} complete");
        Ok(())
    }

    /// Probe until success or the operator gives up. Retries are
    /// entirely operator-paced; there is no limit and no backoff.
    fn verification_loop(&self, vm: &VmUuid, port: u16, probe: &dyn Probe) -> Result<()> {
        loop {
            match probe.probe(vm) {
                Ok(version) => {
                    println!(
                        "Container runtime {} is reachable; monitoring will work.",
                        version.version
                    );
                    return Ok(());
                }
                Err(e) => {
                    let cause = verify::diagnose(self.cp, vm, port);
                    warn!("verification probe failed: {e:#}");
                    eprintln!("Verification failed: {cause}");
                    if !self.prompter.confirm("Retry the verification probe?")? {
                        return Err(e.wrap_err("Verification failed and retry was declined"));
                    }
                }
            }
        }
    }
}

pub fn run(opts: PrepareOpts) -> Result<()> {
    let mode = opts.mode.resolve()?;
    let cp = XeCli::new(opts.server.clone());
    let vm = VmUuid::new(&opts.vm_uuid);
    let prompter = TerminalPrompter;
    let media = IsoBuilder;
    let pusher = SshKeyPusher { cp: &cp };
    let workflow = Workflow {
        cp: &cp,
        prompter: &prompter,
        media: &media,
        pusher: &pusher,
        handoff: Handoff::default(),
    };
    match &mode {
        Mode::Ssh { username } => {
            let probe = SshProbe {
                cp: &cp,
                username: username.clone(),
            };
            workflow.run(&vm, &mode, &probe)
        }
        Mode::Tls(_) => {
            let probe = TlsProbe { cp: &cp };
            workflow.run(&vm, &mode, &probe)
        }
    }
}
