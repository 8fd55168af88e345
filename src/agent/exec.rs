//! Post-create and post-delete command hooks.
//!
//! Commands run asynchronously, with no shell. The only variable expansion
//! is `${ifname}`, `${ipv4}` and `${mac}`, and argv[0] must be in the
//! agent's static allow-list.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::api::{ExecReport, NetworkAttachment};
use crate::netutil::{secs_between, Nsn};

use super::interfaces::LocalInterface;
use super::ConnectionAgent;

pub const WHAT_POST_CREATE: &str = "postCreate";
pub const WHAT_POST_DELETE: &str = "postDelete";

/// Stored stdout/stderr are capped at this many bytes.
const OUTPUT_CAP: usize = 1024;

pub fn expand_command(command: &[String], ifname: &str, ipv4: &str, mac: &str) -> Vec<String> {
    command
        .iter()
        .map(|arg| {
            arg.replace("${ifname}", ifname)
                .replace("${ipv4}", ipv4)
                .replace("${mac}", mac)
        })
        .collect()
}

fn truncate_output(raw: std::borrow::Cow<'_, str>) -> String {
    let mut s = raw.into_owned();
    if s.len() > OUTPUT_CAP {
        let mut end = OUTPUT_CAP;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}

/// Runs the (already expanded) command and reports what happened.
pub async fn run_command(command: Vec<String>) -> ExecReport {
    let start = Utc::now();
    let output = tokio::process::Command::new(&command[0])
        .args(&command[1..])
        .output()
        .await;
    let stop = Utc::now();
    match output {
        Ok(out) => ExecReport {
            exit_status: out.status.code().unwrap_or(-1),
            start_time: Some(start),
            stop_time: Some(stop),
            std_out: truncate_output(String::from_utf8_lossy(&out.stdout)),
            std_err: truncate_output(String::from_utf8_lossy(&out.stderr)),
            command,
        },
        Err(err) => ExecReport {
            exit_status: -1,
            start_time: Some(start),
            stop_time: Some(stop),
            std_out: String::new(),
            std_err: err.to_string(),
            command,
        },
    }
}

fn disallowed_report(command: Vec<String>) -> ExecReport {
    let now = Utc::now();
    ExecReport {
        exit_status: -1,
        start_time: Some(now),
        stop_time: Some(now),
        std_out: String::new(),
        std_err: format!("program {:?} is not in the allowed list", command[0]),
        command,
    }
}

impl ConnectionAgent {
    /// Launches the attachment's post-create command once per interface.
    /// Returns the host error strings to surface in status, if any.
    pub(super) fn maybe_launch_post_create(
        &self,
        nsn: &Nsn,
        att: &NetworkAttachment,
        ifc: &LocalInterface,
    ) -> Vec<String> {
        if att.spec.post_create_exec.is_empty() {
            return Vec::new();
        }
        let program = &att.spec.post_create_exec[0];
        if !self.allowed_programs.contains(program) {
            // The complaint must stay in status on every pass, not just
            // the one that first noticed it.
            if !ifc.post_create_launched.swap(true, Ordering::SeqCst) {
                *ifc.post_create_report.lock().unwrap() =
                    Some(disallowed_report(att.spec.post_create_exec.clone()));
            }
            return vec![format!("postCreateExec program {program:?} is not allowed")];
        }
        if ifc.post_create_launched.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        let command = expand_command(
            &att.spec.post_create_exec,
            &ifc.name,
            &ifc.guest_ip.to_string(),
            &ifc.guest_mac,
        );
        debug!(attachment = %nsn, ?command, "launching post-create command");
        let me = self.me.clone();
        let report_slot = Arc::clone(&ifc.post_create_report);
        let nsn = nsn.clone();
        tokio::spawn(async move {
            let report = run_command(command).await;
            if let Some(agent) = me.upgrade() {
                if let (Some(start), Some(stop)) = (report.start_time, report.stop_time) {
                    agent
                        .metrics
                        .attachment_exec_duration
                        .with_label_values(&[WHAT_POST_CREATE, &report.exit_status.to_string()])
                        .observe(secs_between(stop, start));
                }
                *report_slot.lock().unwrap() = Some(report);
                // Re-queue so the status update picks the report up.
                agent.queue.add(nsn);
            } else {
                *report_slot.lock().unwrap() = Some(report);
            }
        });
        Vec::new()
    }

    /// Launches the post-delete command after the interface was deleted,
    /// iff the post-create command had been launched for it. The outcome
    /// is not reported anywhere but the logs.
    pub(super) fn maybe_launch_post_delete(&self, nsn: &Nsn, ifc: &LocalInterface) {
        if !ifc.post_create_launched.load(Ordering::SeqCst) || ifc.post_delete_exec.is_empty() {
            return;
        }
        let program = &ifc.post_delete_exec[0];
        if !self.allowed_programs.contains(program) {
            warn!(attachment = %nsn, program = %program, "postDeleteExec program is not allowed");
            return;
        }
        let command = expand_command(
            &ifc.post_delete_exec,
            &ifc.name,
            &ifc.guest_ip.to_string(),
            &ifc.guest_mac,
        );
        debug!(attachment = %nsn, ?command, "launching post-delete command");
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let report = run_command(command).await;
            if let (Some(start), Some(stop)) = (report.start_time, report.stop_time) {
                metrics
                    .attachment_exec_duration
                    .with_label_values(&[WHAT_POST_DELETE, &report.exit_status.to_string()])
                    .observe(secs_between(stop, start));
            }
            debug!(exit_status = report.exit_status, "post-delete command finished");
        });
    }
}
