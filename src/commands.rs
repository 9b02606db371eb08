// src/commands.rs
//! Command handlers for the pkgpanda CLI

use crate::cli::HostArgs;
use anyhow::{Context, Result};
use pkgpanda::actions;
use pkgpanda::build::{self, DockerExecutor, PackageStore};
use pkgpanda::config::variant_name;
use pkgpanda::{Install, InstallOptions, Repository};
use std::path::Path;
use tracing::info;

fn open_host(host: &HostArgs) -> Result<(Install, Repository)> {
    let install = Install::system(InstallOptions {
        root: host.root.clone(),
        config_dir: Some(host.config_dir.clone()),
        rooted_systemd: host.rooted_systemd,
        manage_systemd: !host.no_systemd,
        block_systemd: !host.no_block_systemd,
        ..InstallOptions::default()
    })
    .with_context(|| format!("Failed to open install root {}", host.root.display()))?;
    let repository = Repository::new(&host.repository)
        .with_context(|| format!("Failed to open repository {}", host.repository.display()))?;
    Ok((install, repository))
}

pub fn cmd_activate(host: &HostArgs, ids: &[String]) -> Result<()> {
    let (install, repository) = open_host(host)?;
    actions::activate_packages(&install, &repository, ids, !host.no_systemd, !host.no_block_systemd)?;
    Ok(())
}

pub fn cmd_swap(host: &HostArgs, package_id: &str) -> Result<()> {
    let (install, repository) = open_host(host)?;
    actions::swap_active_package(&install, &repository, package_id, !host.no_systemd, !host.no_block_systemd)?;
    Ok(())
}

pub fn cmd_active(host: &HostArgs) -> Result<()> {
    let (install, _) = open_host(host)?;
    for id in install.get_active()? {
        println!("{id}");
    }
    Ok(())
}

pub fn cmd_fetch(host: &HostArgs, repository_url: &str, ids: &[String]) -> Result<()> {
    let (_, repository) = open_host(host)?;
    let work_dir = std::env::current_dir()?;
    for id in ids {
        actions::fetch_package(&repository, repository_url, id, &work_dir)?;
    }
    Ok(())
}

pub fn cmd_add(host: &HostArgs, package_tarball: &Path) -> Result<()> {
    let (_, repository) = open_host(host)?;
    actions::add_package_file(&repository, package_tarball)
        .with_context(|| format!("Failed to add {}", package_tarball.display()))?;
    Ok(())
}

pub fn cmd_list(host: &HostArgs) -> Result<()> {
    let (_, repository) = open_host(host)?;
    print!("{}", actions::format_repo_list(repository.list()?)?);
    Ok(())
}

pub fn cmd_remove(host: &HostArgs, ids: &[String]) -> Result<()> {
    let (install, repository) = open_host(host)?;

    // Refuse the whole batch before removing anything
    let active = install.get_active()?;
    let conflicts: Vec<&str> = ids
        .iter()
        .filter(|id| active.contains(*id))
        .map(String::as_str)
        .collect();
    if !conflicts.is_empty() {
        anyhow::bail!("Refusing to remove active packages {}", conflicts.join(" "));
    }

    for id in ids {
        actions::remove_package(&install, &repository, id)?;
    }
    Ok(())
}

pub fn cmd_setup(host: &HostArgs) -> Result<()> {
    let (install, repository) = open_host(host)?;
    actions::setup(&install, &repository, !host.no_block_systemd)?;
    Ok(())
}

pub fn cmd_uninstall(host: &HostArgs) -> Result<()> {
    let (install, _) = open_host(host)?;
    actions::uninstall(&install)?;
    Ok(())
}

/// Returns the process exit code
pub fn cmd_check(host: &HostArgs, list: bool) -> Result<i32> {
    let (install, repository) = open_host(host)?;
    let checks = actions::find_checks(&install, &repository)?;
    if list {
        print!("{}", actions::format_checks(&checks));
        return Ok(0);
    }
    Ok(actions::run_checks(&checks, &repository)?)
}

pub fn cmd_build(repository_url: Option<&str>, dont_clean_after_build: bool, recursive: bool) -> Result<()> {
    let package_dir = std::env::current_dir()?;
    let name = package_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("Unable to determine package name from the current directory")?;
    let packages_dir = package_dir
        .parent()
        .context("Package directory has no parent packages directory")?;

    let store = PackageStore::new(packages_dir, repository_url)?;
    let executor = DockerExecutor::new()?;

    let variants: Vec<Option<String>> = store
        .packages_by_name()
        .get(&name)
        .with_context(|| format!("No buildinfo.json found for package {name}"))?
        .keys()
        .cloned()
        .collect();

    for variant in variants {
        let path = build::build(
            &store,
            &name,
            variant.as_deref(),
            !dont_clean_after_build,
            recursive,
            &executor,
        )?;
        println!("{} {}", variant_name(variant.as_deref()), path.display());
    }
    Ok(())
}

pub fn cmd_tree(mkbootstrap: bool, repository_url: Option<&str>, variant: Option<&str>) -> Result<()> {
    let packages_dir = std::env::current_dir()?;
    let store = PackageStore::new(&packages_dir, repository_url)?;
    let executor = DockerExecutor::new()?;

    let results = build::build_tree(&store, mkbootstrap, variant, &executor)?;
    for (tree, bootstrap_id) in results {
        match bootstrap_id {
            Some(id) => info!("Tree {} bootstrap {}", variant_name(tree.as_deref()), id),
            None => info!("Tree {} built", variant_name(tree.as_deref())),
        }
    }
    Ok(())
}
