use crate::activation;
use crate::audit_log::segment_paths;
use crate::audit_verifier::verify_segment;
use crate::config::{CynapseConfig, DEFAULT_CONFIG_FILE};
use crate::keys::ToolSigningKey;
use crate::registry::ToolManifest;
use crate::runtime::Cynapse;
use crate::signature::SignatureRecord;
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

/// Top-level CLI interface for Cynapse
#[derive(Parser)]
#[command(
    name = "cynapse",
    version,
    about = "Fragmented-secret custodian and signed tool launcher"
)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, env = "CYNAPSE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Actor name recorded in audit entries
    #[arg(long, global = true, default_value = "operator")]
    pub actor: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Reassemble a secret from its fragments to prove quorum
    Assemble {
        secret_id: String,
        /// Minimum fragments required (never lowers the declared threshold)
        #[arg(short, long)]
        threshold: Option<u8>,
    },

    /// Run a tool command
    Run {
        tool: String,
        command: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
        /// Assemble this secret and hand it to the tool on stdin
        #[arg(long)]
        secret: Option<String>,
        #[arg(short, long)]
        threshold: Option<u8>,
    },

    /// List discovered tools
    List,

    /// Verify a tool's signature
    Verify { tool: String },

    /// Print runtime status as JSON
    Status,

    /// Split a secret read from stdin into fragment files
    Split {
        secret_id: String,
        #[arg(short, long)]
        threshold: u8,
        #[arg(short = 'n', long)]
        total: u8,
        /// Medium directories, used round robin
        #[arg(short, long)]
        out: Vec<PathBuf>,
    },

    /// Generate an Ed25519 signing key and trust its public half
    Keygen {
        key_id: String,
        /// Where to write the private key (defaults to <keys_dir>/<key_id>.key)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Sign a tool directory, writing signature.sig next to its manifest
    Sign {
        tool_dir: PathBuf,
        #[arg(short, long)]
        key: PathBuf,
    },

    /// Check sequence and hash chain of every audit segment
    AuditVerify,

    /// Write the default configuration as TOML
    InitConfig {
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        output: PathBuf,
    },
}

fn open_runtime(config: &CynapseConfig, actor: &str) -> anyhow::Result<Cynapse> {
    Ok(Cynapse::open(config.clone(), actor)?)
}

pub async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let config = CynapseConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Assemble { secret_id, threshold } => {
            let runtime = open_runtime(&config, &cli.actor)?;
            let session = runtime.assemble(&secret_id, threshold)?;
            let (fragments, bytes) = (session.source_fragment_ids().len(), session.len());
            drop(session);
            println!("Secret '{secret_id}' assembled from {fragments} fragments ({bytes} bytes); session wiped");
        }

        Commands::Run {
            tool,
            command,
            args,
            secret,
            threshold,
        } => {
            let runtime = Arc::new(open_runtime(&config, &cli.actor)?);
            let session = match secret {
                Some(secret_id) => Some(runtime.assemble(&secret_id, threshold)?),
                None => None,
            };

            // SIGTERM or Ctrl-C during the run locks the engine down, which
            // terminates the tool and audits the cancellation.
            let (events, rx) = activation::channel(4);
            let signals = tokio::spawn(activation::forward_signals(events)?);
            let mut listener = tokio::spawn(activation::listen(Arc::clone(&runtime), rx));

            let run = runtime.run(&tool, &command, args, session);
            tokio::pin!(run);
            let outcome = tokio::select! {
                outcome = &mut run => {
                    signals.abort();
                    let _ = listener.await;
                    outcome
                }
                _ = &mut listener => {
                    signals.abort();
                    run.await
                }
            };

            let result = outcome?;
            print!("{}", result.stdout);
            eprint!("{}", result.stderr);
        }

        Commands::List => {
            let runtime = open_runtime(&config, &cli.actor)?;
            let tools = runtime.list()?;
            if tools.is_empty() {
                println!("No tools found under {}", config.tool_root.display());
            }
            for t in tools {
                println!(
                    "{:<20} {:<10} {}{}",
                    t.name,
                    t.version,
                    t.description,
                    if t.requires_signature { " [signed]" } else { "" }
                );
                if !t.commands.is_empty() {
                    println!("{:<20} commands: {}", "", t.commands.join(", "));
                }
            }
        }

        Commands::Verify { tool } => {
            let runtime = open_runtime(&config, &cli.actor)?;
            let verified = runtime.verify(&tool)?;
            println!(
                "{} {} verified with key '{}'",
                verified.tool(),
                verified.version(),
                verified.key_id()
            );
        }

        Commands::Status => {
            let runtime = open_runtime(&config, &cli.actor)?;
            let status = runtime.status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Commands::Split {
            secret_id,
            threshold,
            total,
            out,
        } => {
            let mut secret = zeroize::Zeroizing::new(Vec::new());
            std::io::stdin()
                .read_to_end(&mut secret)
                .context("reading secret from stdin")?;
            while secret.last() == Some(&b'\n') {
                secret.pop();
            }
            if secret.is_empty() {
                bail!("no secret on stdin");
            }
            let runtime = open_runtime(&config, &cli.actor)?;
            for path in runtime.split(&secret_id, &secret, threshold, total, &out)? {
                println!("{}", path.display());
            }
        }

        Commands::Keygen { key_id, output } => {
            let key = ToolSigningKey::generate(&key_id)?;
            let private_path =
                output.unwrap_or_else(|| config.keys_dir.join(format!("{key_id}.key")));
            if let Some(parent) = private_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            key.save_to_file(&private_path)?;
            let public_path = key.save_public(&config.keys_dir)?;
            println!("Private key: {}", private_path.display());
            println!("Public key:  {}", public_path.display());
        }

        Commands::Sign { tool_dir, key } => {
            let key = ToolSigningKey::load_from_file(&key)?;
            let manifest = ToolManifest::load(&tool_dir)?;
            let binary = std::fs::read(&manifest.entry_path)
                .with_context(|| format!("reading {}", manifest.entry_path.display()))?;
            let record = SignatureRecord::sign(&key, &manifest, &binary);
            let path = SignatureRecord::path_for(&manifest);
            record.save(&path)?;
            println!("Signed {} {} -> {}", manifest.name, manifest.version, path.display());
        }

        Commands::AuditVerify => {
            let segments = segment_paths(&config.audit_dir)
                .with_context(|| format!("listing {}", config.audit_dir.display()))?;
            if segments.is_empty() {
                println!("No audit segments in {}", config.audit_dir.display());
            }
            for (_, path) in segments {
                let report = verify_segment(&path)
                    .with_context(|| format!("audit segment {}", path.display()))?;
                println!(
                    "{}: {} entries, last sequence {}",
                    path.display(),
                    report.entries,
                    report.last_sequence
                );
            }
        }

        Commands::InitConfig { output } => {
            if output.exists() {
                bail!("{} already exists", output.display());
            }
            std::fs::write(&output, config.to_toml()?)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("Wrote {}", output.display());
        }
    }
    Ok(())
}
