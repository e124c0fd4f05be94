//! The main CLI logic.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use rpmostree_admin::config::DEFAULT_CONFIG_PATH;
use rpmostree_admin::keyfile::Changes;
use rpmostree_admin::progress::TransactionProgress;
use rpmostree_admin::{
    Client, ClientEvent, Compare, Config, Deployment, DeploymentAdmin, GioBus, PackageSet,
    ProxyAttr, Remotes, RpmCli,
};
use serde_json::{json, Value};
use termcolor::WriteColor;

type AdminClient = Client<GioBus, RpmCli>;

#[derive(Debug, Parser)]
#[clap(name = "rpmostree-admin", version, rename_all = "kebab-case")]
/// Inspect and manage rpm-ostree deployments
struct Opt {
    /// Configuration file; defaults apply if it does not exist
    #[clap(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, clap::Args)]
struct OriginOpts {
    /// Operating system name; defaults to the booted one
    #[clap(long)]
    os: Option<String>,

    /// Show or check a different remote than the current origin
    #[clap(long)]
    remote: Option<String>,

    /// Show or check a different branch than the current origin
    #[clap(long)]
    branch: Option<String>,
}

#[derive(Debug, Subcommand)]
#[clap(rename_all = "kebab-case")]
enum Cmd {
    /// Show deployments and any pending update
    Status {
        #[clap(flatten)]
        origin: OriginOpts,

        /// Also show signatures
        #[clap(long, short = 'v')]
        verbose: bool,
    },
    /// Show the packages of a deployment, or its diff against the booted one
    Packages {
        /// Deployment index, or a checksum (prefix)
        target: String,

        #[clap(long)]
        os: Option<String>,
    },
    /// Download update metadata and show what would change
    Check {
        #[clap(flatten)]
        origin: OriginOpts,
    },
    /// Deploy a specific commit
    Deploy {
        checksum: String,

        #[clap(long)]
        os: Option<String>,

        #[clap(long)]
        reboot: bool,
    },
    /// Make the rollback deployment the default
    Rollback {
        #[clap(long)]
        os: Option<String>,

        #[clap(long)]
        reboot: bool,
    },
    /// Switch to a different remote and/or branch
    Rebase {
        /// Remote name; keeps the current remote if empty
        remote: String,

        /// Branch; keeps the current branch if omitted
        branch: Option<String>,

        #[clap(long)]
        os: Option<String>,

        #[clap(long)]
        reboot: bool,
    },
    /// Free up disk space
    Cleanup {
        #[clap(long)]
        os: Option<String>,

        /// Temporary files
        #[clap(long)]
        base: bool,

        /// Cached rpm repository metadata
        #[clap(long)]
        repomd: bool,

        /// The pending deployment
        #[clap(long)]
        pending: bool,

        /// The rollback deployment
        #[clap(long)]
        rollback: bool,
    },
    /// Remove package layering and/or overrides
    Reset {
        #[clap(long)]
        os: Option<String>,

        #[clap(long)]
        no_layering: bool,

        #[clap(long)]
        no_overrides: bool,

        #[clap(long)]
        reboot: bool,
    },
    /// Keep a deployment from being garbage collected
    Pin { index: usize },
    /// Undo `pin`
    Unpin { index: usize },
    /// Delete a deployment
    Undeploy { index: usize },
    /// Print a line whenever the daemon's state changes
    Watch,
    /// Manage ostree remotes
    #[clap(subcommand)]
    Remote(RemoteCmd),
}

#[derive(Debug, Subcommand)]
#[clap(rename_all = "kebab-case")]
enum RemoteCmd {
    List,
    Add {
        name: String,
        url: String,

        /// Don't require commits to be signed
        #[clap(long)]
        no_gpg_verify: bool,
    },
    Delete {
        name: String,
    },
    /// List branches available from a remote
    Branches {
        name: String,
    },
    /// Import a GPG key from a file, or stdin
    GpgImport {
        name: String,

        #[clap(long)]
        file: Option<PathBuf>,
    },
    /// Print the remote's configuration
    Show {
        name: String,
    },
    /// Edit the remote's configuration
    Set {
        name: String,

        #[clap(long)]
        url: Option<String>,

        #[clap(long)]
        gpg_verify: Option<bool>,

        /// Remove a key
        #[clap(long, value_name = "KEY")]
        unset: Vec<String>,
    },
}

/// The OS to act on: the requested one, else the booted one, else the first.
fn resolve_os(client: &AdminClient, os: Option<String>) -> Result<String> {
    if let Some(os) = os {
        return Ok(os);
    }
    let os_list = client.os_list();
    os_list
        .iter()
        .find(|os| client.os_deployment(os, ProxyAttr::BootedDeployment).is_some())
        .or(os_list.first())
        .cloned()
        .ok_or_else(|| anyhow!("No deployments found"))
}

fn format_timestamp(ts: u64) -> String {
    i64::try_from(ts)
        .ok()
        .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
        .map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn print_deployment(client: &AdminClient, d: &Deployment, verbose: bool) {
    let marker = if d.booted { "●" } else { " " };
    let label = match d.index {
        Some(i) => i.to_string(),
        None => "update".to_string(),
    };
    println!(
        "{marker} [{label}] {}",
        d.effective_origin().unwrap_or("<unknown origin>")
    );
    if let Some(version) = d.version.as_deref() {
        println!("      Version: {version} ({})", format_timestamp(d.timestamp));
    }
    println!("       Commit: {}", d.checksum);
    let mut flags = Vec::new();
    if client.item_matches(d, ProxyAttr::DefaultDeployment, Compare::Checksum) {
        flags.push("default");
    }
    if d.is_installed() && client.item_matches(d, ProxyAttr::RollbackDeployment, Compare::Checksum) {
        flags.push("rollback");
    }
    if d.pinned {
        flags.push("pinned");
    }
    if d.staged {
        flags.push("staged");
    }
    if !flags.is_empty() {
        println!("        State: {}", flags.join(", "));
    }
    if verbose {
        for raw in &d.signatures {
            match client.signature(raw) {
                Ok(sig) => {
                    let by = sig.signed_by().unwrap_or_default();
                    let validity = match (sig.valid, sig.expired()) {
                        (true, false) => "valid",
                        (true, true) => "expired",
                        _ => "invalid",
                    };
                    println!(
                        "    Signature: {validity} {} {} {by}",
                        sig.key_label().unwrap_or_default(),
                        sig.fingerprint
                    );
                }
                Err(e) => println!("    Signature: {e}"),
            }
        }
    }
}

fn print_packages(set: &PackageSet) {
    match set {
        PackageSet::Installed(p) => {
            for name in p.iter() {
                println!("  {name}");
            }
        }
        PackageSet::Diff(d) => {
            for (title, list) in [
                ("Upgraded", &d.up),
                ("Downgraded", &d.down),
                ("Removed", &d.removes),
                ("Added", &d.adds),
            ] {
                if list.is_empty() {
                    continue;
                }
                println!("{title}:");
                for c in list {
                    println!("  {} {}.{}", c.name, c.version, c.arch);
                }
            }
        }
    }
}

async fn status(client: &AdminClient, origin: OriginOpts, verbose: bool) -> Result<()> {
    let os_list = match origin.os {
        Some(os) => vec![os],
        None => client.os_list(),
    };
    if let Some(running) = client.active_transaction() {
        println!("Transaction in progress: {running}");
    }
    for os in os_list {
        println!("{os}:");
        let versions =
            client.known_versions_for(&os, origin.remote.as_deref(), origin.branch.as_deref());
        for d in versions {
            print_deployment(client, &d, verbose);
        }
    }
    Ok(())
}

async fn packages(client: &AdminClient, target: &str, os: Option<String>) -> Result<()> {
    let os = resolve_os(client, os)?;
    let versions = client.known_versions_for(&os, None, None);
    let d = match target.parse::<usize>() {
        Ok(i) => versions.iter().find(|d| d.index == Some(i)),
        Err(_) => versions.iter().find(|d| d.checksum.starts_with(target)),
    }
    .ok_or_else(|| anyhow!("No deployment {target} for {os}"))?;
    let handle = client
        .packages(d)
        .await
        .ok_or_else(|| anyhow!("No package information available for {target}"))?;
    handle.wait_ready().await;
    if let Some(e) = handle.error() {
        return Err(anyhow!(e)).context("Loading packages");
    }
    if handle.is_empty() {
        println!("No package changes");
    } else if let Some(set) = handle.set() {
        print_packages(&set);
    }
    Ok(())
}

async fn check(client: &AdminClient, origin: OriginOpts) -> Result<()> {
    let os = resolve_os(client, origin.os)?;
    let remote = origin.remote.as_deref();
    let branch = origin.branch.as_deref();
    let progress = TransactionProgress::new("Checking for updates");
    let r = client.check_for_updates(&os, remote, branch).await;
    progress.finish(r.is_ok());
    match r? {
        Some(update) => {
            print_deployment(client, &update, false);
            if let Some(handle) = client.packages(&update).await {
                handle.wait_ready().await;
                if let Some(set) = handle.set() {
                    print_packages(&set);
                }
            }
        }
        None => println!("No updates available"),
    }
    Ok(())
}

/// Run a transaction with a spinner, printing the result detail if any.
async fn transaction(client: &AdminClient, method: &str, args: Vec<Value>, os: &str) -> Result<()> {
    let progress = TransactionProgress::new(method);
    let r = client
        .run_transaction_with_progress(method, args, os, |s| progress.update(s))
        .await;
    progress.finish(r.is_ok());
    match r.with_context(|| format!("{method} on {os}"))? {
        Value::String(s) if !s.is_empty() => println!("{s}"),
        _ => {}
    }
    Ok(())
}

/// The deployment at `index` in the host's list.
fn deployment_at(client: &AdminClient, index: usize) -> Result<Deployment> {
    let mut d = client
        .deployments()
        .into_iter()
        .nth(index)
        .ok_or_else(|| anyhow!("No deployment at index {index}"))?;
    d.index = Some(index);
    Ok(d)
}

async fn remote(config: &Config, client: &AdminClient, cmd: RemoteCmd) -> Result<()> {
    let remotes = Remotes::new(config);
    match cmd {
        RemoteCmd::List => {
            for name in remotes.list_remotes().await? {
                println!("{name}");
            }
        }
        RemoteCmd::Add {
            name,
            url,
            no_gpg_verify,
        } => remotes.add_remote(&name, &url, !no_gpg_verify).await?,
        RemoteCmd::Delete { name } => remotes.delete_remote(&name).await?,
        RemoteCmd::Branches { name } => {
            if let Err(e) = client.connect().await {
                tracing::warn!("Not reloading daemon configuration: {e}");
            }
            for branch in remotes.list_branches(&name, client).await? {
                println!("{branch}");
            }
        }
        RemoteCmd::GpgImport { name, file } => {
            let key = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Reading {}", path.display()))?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("Reading key from stdin")?;
                    buf
                }
            };
            remotes.import_gpg_key(&name, &key).await?
        }
        RemoteCmd::Show { name } => {
            for (k, v) in remotes.load_remote_settings(&name)? {
                println!("{k} = {v}");
            }
        }
        RemoteCmd::Set {
            name,
            url,
            gpg_verify,
            unset,
        } => {
            let mut changes = Changes::new();
            if let Some(url) = url {
                changes = changes.set("url", url);
            }
            if let Some(v) = gpg_verify {
                changes = changes.set_bool("gpg-verify", v);
            }
            for key in unset {
                changes = changes.remove(&key);
            }
            if changes.is_empty() {
                return Err(anyhow!("Nothing to change"));
            }
            remotes.update_remote_settings(&name, &changes)?;
        }
    }
    Ok(())
}

async fn run(opt: Opt) -> Result<()> {
    let config = Config::load_or_default(&opt.config)?;
    let client = Client::from_config(&config);

    let cmd = match opt.cmd {
        Cmd::Remote(cmd) => return remote(&config, &client, cmd).await,
        cmd => cmd,
    };

    client.connect().await.context("Connecting to rpm-ostree")?;
    match cmd {
        Cmd::Status { origin, verbose } => status(&client, origin, verbose).await,
        Cmd::Packages { target, os } => packages(&client, &target, os).await,
        Cmd::Check { origin } => check(&client, origin).await,
        Cmd::Deploy {
            checksum,
            os,
            reboot,
        } => {
            let os = resolve_os(&client, os)?;
            let args = vec![json!(checksum), json!({ "reboot": reboot })];
            transaction(&client, "Deploy", args, &os).await
        }
        Cmd::Rollback { os, reboot } => {
            let os = resolve_os(&client, os)?;
            transaction(&client, "Rollback", vec![json!({ "reboot": reboot })], &os).await
        }
        Cmd::Rebase {
            remote,
            branch,
            os,
            reboot,
        } => {
            let os = resolve_os(&client, os)?;
            let refspec = client
                .build_change_refspec(&os, Some(&remote), branch.as_deref())
                .ok_or_else(|| anyhow!("{os} is already following that origin"))?;
            let mut options = json!({ "reboot": reboot });
            if let Ok(Some(update)) = client
                .cache_update_for(&os, Some(&remote), branch.as_deref())
                .await
            {
                options["revision"] = json!(update.checksum);
            }
            let args = vec![options, json!(refspec), json!([])];
            transaction(&client, "Rebase", args, &os).await
        }
        Cmd::Cleanup {
            os,
            base,
            repomd,
            pending,
            rollback,
        } => {
            let os = resolve_os(&client, os)?;
            let mut flags = Vec::new();
            // Same defaults as the interactive cleanup
            let defaults = !(base || repomd || pending || rollback);
            if base || defaults {
                flags.push("base");
            }
            if repomd || defaults {
                flags.push("repomd");
            }
            if pending {
                flags.push("pending-deploy");
            }
            if rollback {
                flags.push("rollback-deploy");
            }
            transaction(&client, "Cleanup", vec![json!(flags)], &os).await
        }
        Cmd::Reset {
            os,
            no_layering,
            no_overrides,
            reboot,
        } => {
            let os = resolve_os(&client, os)?;
            let mut flags = serde_json::Map::new();
            if no_layering {
                flags.insert("no-layering".into(), json!(true));
            }
            if no_overrides {
                flags.insert("no-overrides".into(), json!(true));
            }
            if reboot {
                flags.insert("reboot".into(), json!(true));
            }
            let args = vec![json!({}), Value::Object(flags)];
            transaction(&client, "UpdateDeployment", args, &os).await
        }
        Cmd::Pin { index } => {
            let d = deployment_at(&client, index)?;
            DeploymentAdmin::new(&config).pin(&d).await?;
            client.refresh().await?;
            Ok(())
        }
        Cmd::Unpin { index } => {
            let d = deployment_at(&client, index)?;
            DeploymentAdmin::new(&config).unpin(&d).await?;
            client.refresh().await?;
            Ok(())
        }
        Cmd::Undeploy { index } => {
            let d = deployment_at(&client, index)?;
            DeploymentAdmin::new(&config).undeploy(&d).await?;
            client.refresh().await?;
            Ok(())
        }
        Cmd::Watch => {
            let _sub = client.subscribe(|ev| match ev {
                ClientEvent::Changed => println!("changed"),
                ClientEvent::RestartExpected => println!("restart expected"),
                ClientEvent::ConnectionLost { problem, message } => {
                    println!("connection lost ({problem}): {message}")
                }
            });
            client.watch().await?;
            Ok(())
        }
        Cmd::Remote(cmd) => remote(&config, &client, cmd).await,
    }
}

/// The real main function returns a `Result<>`.
fn inner_main() -> Result<i32> {
    // We need to write to stderr, because our commands write to stdout
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    tracing::trace!("starting");
    let opt = Opt::parse();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    runtime.block_on(run(opt))?;
    Ok(0)
}

fn print_error(e: anyhow::Error) {
    let msg = format!("{:#}", e);
    // Print the error: prefix in red if we're on a tty
    let stderr = termcolor::BufferWriter::stderr(termcolor::ColorChoice::Auto);
    let stderrbuf = {
        let mut stderrbuf = stderr.buffer();
        let _ =
            stderrbuf.set_color(termcolor::ColorSpec::new().set_fg(Some(termcolor::Color::Red)));
        let _ = write!(&mut stderrbuf, "error: ");
        let _ = stderrbuf.reset();
        let _ = writeln!(&mut stderrbuf, "{}", msg);
        stderrbuf
    };
    let _ = stderr.print(&stderrbuf);
}

fn main() {
    match inner_main() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            print_error(e);
            std::process::exit(1)
        }
    }
}
