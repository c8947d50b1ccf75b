use anyhow::Result;
use clap::Parser;
use ocibundle::{
    bundle::{pull, Contents, PullOpts},
    config::{parse_duration, RegistryOpts, DEFAULT_CONCURRENCY},
    imageset::{
        copy_to_repo, resolve_inputs, write_lock_output, CopyInputs, CopyOrigin,
    },
    imagetar::{export, TarRegistry},
    lockconfig::{BundleLock, Lock},
    registry::RemoteRegistry,
    ImageName, Repository,
};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "ocibundle", version, about = "Relocate OCI images and bundles between registries")]
enum Opt {
    /// Push files as a bundle or a plain image
    Push {
        /// Bundle reference to push to
        #[arg(short = 'b', long = "bundle")]
        bundle: Option<String>,

        /// Image reference to push to
        #[arg(short = 'i', long = "image")]
        image: Option<String>,

        /// Files or directories to include
        #[arg(short = 'f', long = "file", required = true)]
        files: Vec<PathBuf>,

        /// Write a BundleLock for the pushed bundle
        #[arg(long = "lock-output")]
        lock_output: Option<PathBuf>,

        #[command(flatten)]
        registry: RegistryFlags,
    },

    /// Pull an image or bundle into a directory, rewriting its lock
    Pull {
        /// Bundle reference to pull
        #[arg(short = 'b', long = "bundle")]
        bundle: Option<String>,

        /// Image reference to pull
        #[arg(short = 'i', long = "image")]
        image: Option<String>,

        /// BundleLock file naming the bundle to pull
        #[arg(long = "lock")]
        lock: Option<PathBuf>,

        /// Output directory
        #[arg(short = 'o', long = "output")]
        output: PathBuf,

        /// Extract nested bundles under .imgpkg/bundles/
        #[arg(long = "recursive")]
        recursive: bool,

        #[command(flatten)]
        registry: RegistryFlags,
    },

    /// Copy a bundle, image, or lock file between repositories or
    /// through a tar archive
    Copy {
        /// Bundle reference to copy
        #[arg(short = 'b', long = "bundle")]
        bundle: Option<String>,

        /// Image reference to copy
        #[arg(short = 'i', long = "image")]
        image: Option<String>,

        /// ImagesLock or BundleLock file naming what to copy
        #[arg(long = "lock")]
        lock: Option<PathBuf>,

        /// Source tar archive written by a previous copy
        #[arg(long = "tar")]
        tar: Option<PathBuf>,

        /// Destination repository
        #[arg(long = "to-repo")]
        to_repo: Option<String>,

        /// Destination tar archive
        #[arg(long = "to-tar")]
        to_tar: Option<PathBuf>,

        /// Write a lock file describing the copied artifacts
        #[arg(long = "lock-output")]
        lock_output: Option<PathBuf>,

        #[command(flatten)]
        registry: RegistryFlags,
    },

    /// Print version
    Version,
}

#[derive(Debug, clap::Args)]
struct RegistryFlags {
    /// How long to wait for a registry to start answering a request
    #[arg(long = "registry-response-header-timeout", default_value = "30s")]
    response_header_timeout: String,

    /// Worker count shared by resolve and copy
    #[arg(long = "concurrency", default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,
}

impl RegistryFlags {
    fn opts(&self) -> Result<RegistryOpts> {
        Ok(RegistryOpts {
            response_header_timeout: parse_duration(&self.response_header_timeout)?,
            concurrency: self.concurrency.max(1),
        })
    }
}

fn main() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Warn)
        .parse_default_env()
        .init();

    if let Err(err) = run(Opt::parse()) {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run(opt: Opt) -> Result<()> {
    match opt {
        Opt::Push {
            bundle,
            image,
            files,
            lock_output,
            registry,
        } => {
            let opts = registry.opts()?;
            let origin =
                CopyOrigin::from_flags(bundle.as_deref(), image.as_deref(), None)?;
            let (target, is_bundle) = match &origin {
                CopyOrigin::Bundle(name) => (name.clone(), true),
                CopyOrigin::Image(name) => (name.clone(), false),
                CopyOrigin::Lock(_) => unreachable!("push accepts no lock input"),
            };
            let remote = RemoteRegistry::new(opts.clone());
            let pushed = Contents::new(files).push(&remote, &target, is_bundle, &opts)?;
            if let Some(path) = lock_output {
                BundleLock::new(&pushed, target.tag().map(|t| t.to_string()))
                    .write_to_path(&path)?;
            }
            println!("Pushed '{pushed}'");
        }

        Opt::Pull {
            bundle,
            image,
            lock,
            output,
            recursive,
            registry,
        } => {
            let opts = registry.opts()?;
            let (target, expect_bundle) = pull_target(bundle, image, lock)?;
            let remote = RemoteRegistry::new(opts);
            let pulled = pull(
                &remote,
                &target,
                &output,
                &PullOpts {
                    bundle: expect_bundle,
                    recursive,
                },
            )?;
            println!("Pulled '{pulled}' to '{}'", output.display());
        }

        Opt::Copy {
            bundle,
            image,
            lock,
            tar,
            to_repo,
            to_tar,
            lock_output,
            registry,
        } => {
            let opts = registry.opts()?;
            copy(bundle, image, lock, tar, to_repo, to_tar, lock_output, &opts)?;
        }

        Opt::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
        }
    }
    Ok(())
}

fn pull_target(
    bundle: Option<String>,
    image: Option<String>,
    lock: Option<PathBuf>,
) -> Result<(ImageName, bool)> {
    match CopyOrigin::from_flags(bundle.as_deref(), image.as_deref(), lock)? {
        CopyOrigin::Bundle(name) => Ok((name, true)),
        CopyOrigin::Image(name) => Ok((name, false)),
        CopyOrigin::Lock(path) => match Lock::from_path(&path)? {
            Lock::Bundle(lock) => Ok((lock.image_name()?, true)),
            Lock::Images(_) => anyhow::bail!(
                "Expected a BundleLock file when pulling with --lock, found an ImagesLock"
            ),
        },
    }
}

#[allow(clippy::too_many_arguments)]
fn copy(
    bundle: Option<String>,
    image: Option<String>,
    lock: Option<PathBuf>,
    tar: Option<PathBuf>,
    to_repo: Option<String>,
    to_tar: Option<PathBuf>,
    lock_output: Option<PathBuf>,
    opts: &RegistryOpts,
) -> Result<()> {
    if tar.is_some() && to_tar.is_some() {
        anyhow::bail!("Expected either --to-tar or --tar, not both");
    }

    // Origin: a tar archive, or references resolved from a registry
    let archive = tar.as_deref().map(TarRegistry::open).transpose()?;
    let inputs = match &archive {
        Some(archive) => {
            if bundle.is_some() || image.is_some() || lock.is_some() {
                anyhow::bail!("Expected no bundle, image, or lock when copying from a tar");
            }
            CopyInputs {
                roots: archive.root_refs()?,
                expect_bundle: false,
                expect_plain: false,
            }
        }
        None => CopyOrigin::from_flags(bundle.as_deref(), image.as_deref(), lock)?
            .inputs()?,
    };

    let remote = RemoteRegistry::new(opts.clone());

    match (to_repo, to_tar) {
        (Some(to_repo), None) => {
            let repo = Repository::parse(&to_repo)?;
            let result = match &archive {
                Some(archive) => copy_to_repo(archive, &remote, &inputs, &repo, opts)?,
                None => copy_to_repo(&remote, &remote, &inputs, &repo, opts)?,
            };
            if let Some(path) = lock_output {
                write_lock_output(&inputs, &result, &repo, &path)?;
            }
            println!("Copied {} images to '{}'", result.processed.len(), repo);
        }
        (None, Some(to_tar)) => {
            if lock_output.is_some() {
                anyhow::bail!("Lock output is not supported when copying to a tar");
            }
            let set = resolve_inputs(&remote, &inputs, opts.concurrency)?;
            export(&set, &remote, &to_tar)?;
            println!(
                "Exported {} images to '{}'",
                set.nodes.len(),
                to_tar.display()
            );
        }
        _ => anyhow::bail!("Expected either --to-repo or --to-tar"),
    }
    Ok(())
}
