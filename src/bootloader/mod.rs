//! Boot loader reinstallation for migrated system partitions.
//!
//! The original loader configuration on the copied filesystem is only read
//! for the kernel and initrd it boots. A fresh grub2 configuration pointing
//! at those images replaces the copied `boot` directory, and `grub2-install`
//! writes the loader to the replacement device.

use crate::args;
use crate::error::{ShrinkError, ShrinkResult};
use crate::execution::CommandExecutor;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::info;

const GRUB_TEMPLATE: &str = include_str!("grub.cfg.in");
const GRUB_INSTALL: &str = "grub2-install";
const GENERATED_CONFIG: &str = "boot/grub2/grub.cfg";

pub const KERNEL: &str = "kernel";
pub const INITRD: &str = "initrd";

type Keywords = &'static [(&'static str, &'static [&'static str])];

/// A boot loader configuration this tool knows how to read.
#[derive(Debug)]
pub struct LoaderSpec {
    pub name: &'static str,
    /// Relative to the root of the mounted partition
    pub config_path: &'static str,
    pub keywords: Keywords,
}

pub const LOADERS: &[LoaderSpec] = &[
    LoaderSpec {
        name: "grub",
        config_path: "boot/grub/grub.conf",
        keywords: &[(KERNEL, &["kernel"]), (INITRD, &["initrd"])],
    },
    LoaderSpec {
        name: "grub2",
        config_path: "boot/grub2/grub.cfg",
        keywords: &[
            (KERNEL, &["linux16", "linux", "linuxefi"]),
            (INITRD, &["initrd16", "initrd", "initrdefi"]),
        ],
    },
    LoaderSpec {
        name: "grub2",
        config_path: "boot/grub/grub.cfg",
        keywords: &[(KERNEL, &["linux"]), (INITRD, &["initrd"])],
    },
];

/// Collect one value per logical parameter from a boot loader configuration.
///
/// A line contributes when its first token is one of the parameter's
/// keywords; the rest of the line is the value. The first match wins and
/// scanning stops once every parameter has a value.
pub fn parse_boot_config(
    content: &str,
    keywords: Keywords,
) -> ShrinkResult<BTreeMap<&'static str, String>> {
    let mut found = BTreeMap::new();

    for line in content.lines() {
        let mut fields = line.trim().splitn(2, char::is_whitespace);
        let (Some(first), Some(rest)) = (fields.next(), fields.next()) else {
            continue;
        };
        let rest = rest.trim();
        if rest.is_empty() {
            continue;
        }

        if let Some((name, _)) = keywords
            .iter()
            .find(|(name, words)| words.contains(&first) && !found.contains_key(name))
        {
            found.insert(*name, rest.to_string());
            if found.len() == keywords.len() {
                return Ok(found);
            }
        }
    }

    let missing: Vec<&str> = keywords
        .iter()
        .map(|(name, _)| *name)
        .filter(|name| !found.contains_key(name))
        .collect();
    Err(ShrinkError::BootLoader(format!(
        "insufficient parameters, missing {}",
        missing.join(", ")
    )))
}

/// Image file named by a `kernel`/`initrd` value, relative to the partition root.
pub fn image_path(value: &str) -> &str {
    value
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_start_matches(['/', '\\'])
}

pub fn render_config(params: &BTreeMap<&'static str, String>, uuid: &str, date: NaiveDate) -> String {
    let header = format!(
        "#\n# grub2 config for volshrink\n# Created on {} by volshrink {}\n#\n\n",
        date,
        env!("CARGO_PKG_VERSION")
    );
    let kernel = params.get(KERNEL).map(String::as_str).unwrap_or_default();
    let initrd = params.get(INITRD).map(String::as_str).unwrap_or_default();

    header
        + &GRUB_TEMPLATE
            .replace("@UUID@", uuid)
            .replace("@KERNEL@", kernel)
            .replace("@INITRD@", initrd)
}

/// First supported loader configuration present under `mount_path`.
pub async fn locate(mount_path: &Path) -> ShrinkResult<(&'static LoaderSpec, String)> {
    for loader in LOADERS {
        let path = mount_path.join(loader.config_path);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => return Ok((loader, content)),
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Err(ShrinkError::BootLoader(format!(
        "no supported boot loader found under {}",
        mount_path.display()
    )))
}

/// Where the loader for one device is assembled before it is copied over.
pub struct BootStaging {
    pub template: PathBuf,
    pub staging: PathBuf,
}

pub async fn reinstall(
    executor: &CommandExecutor,
    layout: &BootStaging,
    device: &str,
    mount_path: &Path,
    uuid: &str,
) -> ShrinkResult<()> {
    let (loader, content) = locate(mount_path).await?;
    let params = parse_boot_config(&content, loader.keywords)?;
    info!(
        "{} configuration {} found on {}, reinstalling for UUID {}",
        loader.name,
        loader.config_path,
        device,
        uuid
    );

    let staging = &layout.staging;
    executor.run("rm", &args!["-rf", staging.display()]).await?;
    tokio::fs::create_dir_all(staging).await?;
    executor
        .run(
            "cp",
            &args!["-a", layout.template.display(), staging.join("boot").display()],
        )
        .await?;

    for value in params.values() {
        let relative = image_path(value);
        let from = mount_path.join(relative);
        if !tokio::fs::try_exists(&from).await? {
            return Err(ShrinkError::BootLoader(format!(
                "{} not found",
                from.display()
            )));
        }
        let to = staging.join(relative);
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        executor
            .run("cp", &args!["-f", from.display(), to.display()])
            .await?;
    }

    let config_file = staging.join(GENERATED_CONFIG);
    if let Some(parent) = config_file.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let rendered = render_config(&params, uuid, chrono::Local::now().date_naive());
    tokio::fs::write(&config_file, rendered).await?;
    set_private(&config_file).await?;

    let boot = mount_path.join("boot");
    executor.run("rm", &args!["-rf", boot.display()]).await?;
    executor
        .run("cp", &args!["-a", staging.join("boot").display(), boot.display()])
        .await?;
    executor
        .run(
            GRUB_INSTALL,
            &args![format!("--boot-directory={}", boot.display()), device],
        )
        .await?;

    executor.run("rm", &args!["-rf", staging.display()]).await?;
    Ok(())
}

async fn set_private(path: &Path) -> ShrinkResult<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}
