/*
 * Copyright (C) 2018 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

//! Rendering transaction progress on the terminal.

use std::time::Duration;

use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};
use rpmostree_client::DownloadProgress;

use crate::transaction::TransactionSignal;

/// One line describing where a pull is at.
pub fn render_download_progress(p: &DownloadProgress) -> String {
    if p.outstanding_fetches > 0 {
        let transferred = HumanBytes(p.bytes_transferred);
        let rate = if p.bytes_sec == 0 {
            "-".to_string()
        } else {
            HumanBytes(p.bytes_sec).to_string()
        };
        if p.total_delta_parts > 0 {
            format!(
                "Receiving delta parts: {}/{} {rate}/s {transferred}/{}",
                p.fetched_delta_parts,
                p.total_delta_parts,
                HumanBytes(p.total_delta_part_size)
            )
        } else if p.outstanding_metadata_fetches > 0 {
            format!(
                "Receiving metadata objects: {}/(estimating) {rate}/s {transferred}",
                p.metadata_fetched
            )
        } else {
            let percent = (p.fetched * 100).checked_div(p.requested).unwrap_or(0);
            format!(
                "Receiving objects; {percent}% ({}/{}) {rate}/s {transferred}",
                p.fetched, p.requested
            )
        }
    } else if p.outstanding_writes > 0 {
        format!("Writing objects: {}", p.outstanding_writes)
    } else {
        format!("Scanning metadata: {}", p.scanned_metadata)
    }
}

/// Text to show for a transaction signal, if any.
pub fn render_signal(signal: &TransactionSignal) -> Option<String> {
    match signal {
        TransactionSignal::Message(m) => Some(m.clone()),
        TransactionSignal::DownloadProgress(p) => Some(render_download_progress(p)),
        TransactionSignal::Other { name, args } if name == "TaskBegin" => {
            args.first().and_then(|v| v.as_str()).map(ToOwned::to_owned)
        }
        _ => None,
    }
}

/// A spinner on stderr following one transaction.  When stderr isn't a
/// terminal, messages are printed as plain lines instead.
pub struct TransactionProgress {
    bar: ProgressBar,
    prefix: String,
}

impl TransactionProgress {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());
        if let Ok(style) = ProgressStyle::with_template("{spinner} {prefix} {msg}") {
            bar.set_style(style);
        }
        bar.set_prefix(format!("{prefix}..."));
        bar.enable_steady_tick(Duration::from_millis(200));
        Self { bar, prefix }
    }

    pub fn update(&self, signal: &TransactionSignal) {
        let Some(msg) = render_signal(signal) else {
            return;
        };
        if self.bar.is_hidden() {
            eprintln!("{}: {msg}", self.prefix);
        } else {
            self.bar.set_message(msg);
        }
    }

    pub fn finish(self, success: bool) {
        let status = if success { "done" } else { "failed" };
        if self.bar.is_hidden() {
            eprintln!("{}...{status}", self.prefix);
        } else {
            self.bar
                .finish_with_message(status.to_string());
        }
    }
}
