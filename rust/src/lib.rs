/*
 * Copyright (C) 2018 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

//! Administration of rpm-ostree deployments: a reconciled view of the
//! daemon's state, transactions, and ostree remote management.

// pub(crate) utilities
mod cmdutils;
mod variant_utils;

pub mod bus;
pub mod client;
pub use self::client::{Client, Compare, Phase, ProxyAttr};
pub mod config;
pub use self::config::Config;
pub mod dbus;
pub use self::dbus::GioBus;
pub mod deployment_utils;
pub use self::deployment_utils::*;
mod error;
pub use self::error::*;
pub mod keyfile;
mod notify;
pub use self::notify::*;
mod packages;
pub use self::packages::*;
pub mod progress;
pub mod remotes;
pub use self::remotes::{ConfigReload, Remotes};
#[cfg(test)]
mod testutils;
mod transaction;
pub use self::transaction::TransactionSignal;

pub use rpmostree_client::{
    ChangeKind, Deployment, DownloadProgress, InstalledPackages, Origin, PackageChange,
    PackageDiff, PackageSet, Signature,
};
